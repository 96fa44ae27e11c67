//! Periodic hand-off from the shared store to the durable store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info, warn};

use pagetally_core::clock::{format_minute, next_midnight};
use pagetally_core::keys::{parse_flow_member, StoreKey};
use pagetally_core::model::{Browsing, FlowCounters, RealtimeSnapshot, WebFlow};
use pagetally_core::store::{parse_count, Expiry, SharedStore, StoreResult, WriteOp};

use super::retry::{with_retry, RetryOutcome};
use super::Aggregator;

/// What one rollover run moved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RolloverReport {
    pub webflows: usize,
    pub browsings: usize,
    pub failures: usize,
}

impl Aggregator {
    /// Move the finished day's aggregates into the durable store.
    ///
    /// Both in-memory tables are flushed first. From then on, deltas for
    /// `date` or earlier go straight to the durable store: merges already
    /// under way are waited for and whatever reached memory in the meantime
    /// is flushed there, so the seen sets are complete. The sets are popped
    /// in batches; each record is claimed (read and deleted in one watched
    /// transaction) and then merged into the durable store. A record whose
    /// durable merge fails is put back in memory and counted as a failure.
    /// Finally the current day's seen sets get their expiry refreshed.
    pub async fn rollover(self: &Arc<Self>, date: NaiveDate) -> RolloverReport {
        self.flush_everything().await;
        {
            let mut rolled = self
                .rolled_through
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if rolled.map_or(true, |d| d < date) {
                *rolled = Some(date);
            }
        }
        drop(self.persist_gate.write().await);
        self.flush_everything().await;

        let mut report = RolloverReport::default();
        self.roll_over_webflows(date, &mut report).await;
        self.roll_over_browsings(date, &mut report).await;

        let today = self.clock.today();
        let expiry = Expiry::At(next_midnight(today) + self.config.rollover_grace());
        for key in [
            StoreKey::SeenUrls { date: today }.build(),
            StoreKey::SeenVisitors { date: today }.build(),
        ] {
            if let Err(e) = self.store.expire(&key, expiry).await {
                warn!(key = %key, error = %e, "Failed to refresh seen-set expiry");
            }
        }

        info!(
            date = %date,
            webflows = report.webflows,
            browsings = report.browsings,
            failures = report.failures,
            "Daily rollover finished"
        );
        report
    }

    async fn roll_over_webflows(&self, date: NaiveDate, report: &mut RolloverReport) {
        let set = StoreKey::SeenUrls { date }.build();
        loop {
            let members = match self.store.set_pop(&set, self.config.flush_threshold).await {
                Ok(members) => members,
                Err(e) => {
                    error!(key = %set, error = %e, "Failed to pop seen URLs");
                    return;
                }
            };
            if members.is_empty() {
                break;
            }
            for member in members {
                let Some((domain, url)) = parse_flow_member(&member) else {
                    warn!(member = %member, "Malformed seen-URL member skipped");
                    report.failures += 1;
                    continue;
                };
                match self.roll_over_webflow(date, &domain, &url).await {
                    Ok(true) => report.webflows += 1,
                    Ok(false) => {}
                    Err(e) => {
                        error!(domain = %domain, url = %url, error = %e, "Webflow rollover failed");
                        report.failures += 1;
                    }
                }
            }
        }
        if let Err(e) = self.store.delete(&[set]).await {
            warn!(error = %e, "Failed to delete seen-URL set");
        }
    }

    /// Returns `false` when the flow hash had already expired.
    async fn roll_over_webflow(&self, date: NaiveDate, domain: &str, url: &str) -> anyhow::Result<bool> {
        let key = StoreKey::Flow { date, domain, url }.build();
        let stored = self.claim(&key, |store, key| claim_flow_once(store, key)).await?;
        if stored.iter().all(Option::is_none) {
            return Ok(false);
        }
        let mut values = [0i64; 6];
        for (slot, raw) in values.iter_mut().zip(stored.iter()) {
            *slot = parse_count(&key, raw.as_deref())?;
        }
        let flow = WebFlow {
            domain: domain.to_string(),
            url: url.to_string(),
            date: Some(date),
            ..Default::default()
        }
        .with_counters(FlowCounters::from_values(values));
        if let Err(e) = self.durable.merge_webflow(&flow).await {
            warn!(url, "Rolled-over counters kept in memory after durable merge failure");
            self.webflows.merge(flow).await;
            return Err(e);
        }
        Ok(true)
    }

    /// Read and delete `key` in one watched transaction, retried under the
    /// configured policy.
    async fn claim<'a, T, F, Fut>(&'a self, key: &str, mut attempt: F) -> anyhow::Result<T>
    where
        F: FnMut(&'a dyn SharedStore, String) -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>> + 'a,
    {
        let store = self.store.as_ref();
        match with_retry(&self.config.retry, || attempt(store, key.to_string())).await {
            RetryOutcome::Done(value) => Ok(value),
            RetryOutcome::Exhausted => anyhow::bail!("claim of {key} kept conflicting"),
            RetryOutcome::Failed(e) => Err(e.into()),
        }
    }

    async fn roll_over_browsings(&self, date: NaiveDate, report: &mut RolloverReport) {
        let set = StoreKey::SeenVisitors { date }.build();
        loop {
            let uids = match self.store.set_pop(&set, self.config.flush_threshold).await {
                Ok(uids) => uids,
                Err(e) => {
                    error!(key = %set, error = %e, "Failed to pop seen visitors");
                    return;
                }
            };
            if uids.is_empty() {
                break;
            }
            for uid in uids {
                match self.roll_over_visitor(date, &uid).await {
                    Ok((moved, failed)) => {
                        report.browsings += moved;
                        report.failures += failed;
                    }
                    Err(e) => {
                        error!(uid = %uid, error = %e, "Browsing rollover failed");
                        report.failures += 1;
                    }
                }
            }
        }
        if let Err(e) = self.store.delete(&[set]).await {
            warn!(error = %e, "Failed to delete seen-visitor set");
        }
    }

    /// Claim the visitor's day hash and merge every per-domain record. A
    /// record that does not make it is put back in memory.
    async fn roll_over_visitor(&self, date: NaiveDate, uid: &str) -> anyhow::Result<(usize, usize)> {
        let key = StoreKey::Browsing { date, uid }.build();
        let records = self.claim(&key, |store, key| claim_visitor_once(store, key)).await?;
        let mut moved = 0;
        let mut failed = 0;
        for (domain, raw) in records {
            let mut browsing: Browsing = match serde_json::from_str(&raw) {
                Ok(b) => b,
                Err(e) => {
                    warn!(uid, domain = %domain, error = %e, "Undecodable browsing record skipped");
                    failed += 1;
                    continue;
                }
            };
            browsing.uid = uid.to_string();
            browsing.domain = domain;
            browsing.date = Some(date);
            match self.durable.merge_browsing(&browsing).await {
                Ok(()) => moved += 1,
                Err(e) => {
                    error!(uid, domain = %browsing.domain, error = %e, "Browsing merge into durable store failed; kept in memory");
                    self.browsings.merge(browsing).await;
                    failed += 1;
                }
            }
        }
        Ok((moved, failed))
    }

    /// Latest day already handed to the durable store, if any.
    pub fn rolled_through(&self) -> Option<NaiveDate> {
        *self
            .rolled_through
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one live-load sample for every registered domain.
    /// Returns how many samples were written.
    pub async fn snapshot_realtime(&self) -> usize {
        let domains = match self.durable.registered_domains().await {
            Ok(domains) => domains,
            Err(e) => {
                error!(error = %e, "Failed to load registered domains");
                return 0;
            }
        };
        let minute = format_minute(self.clock.now());
        let mut written = 0;
        for registered in domains {
            let domain = registered.domain;
            let snapshot = match self.read_realtime(&domain, &minute).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!(domain = %domain, error = %e, "Failed to read realtime counters");
                    continue;
                }
            };
            match self.durable.save_realtime_snapshot(&snapshot).await {
                Ok(()) => written += 1,
                Err(e) => error!(domain = %domain, error = %e, "Failed to save realtime snapshot"),
            }
        }
        written
    }

    /// Current live load of `domain` as stored in the shared store.
    pub async fn read_realtime(&self, domain: &str, minute: &str) -> anyhow::Result<RealtimeSnapshot> {
        let pv_key = StoreKey::RealtimePv { domain }.build();
        let pv = parse_count(&pv_key, self.store.get(&pv_key).await?.as_deref())?;
        let ip = self
            .store
            .hash_len(&StoreKey::RealtimeIp { domain }.build())
            .await?;
        let uv = self
            .store
            .hash_len(&StoreKey::RealtimeUv { domain }.build())
            .await?;
        Ok(RealtimeSnapshot {
            domain: domain.to_string(),
            pv: pv.max(0),
            ip: i64::try_from(ip)?,
            uv: i64::try_from(uv)?,
            date: minute.to_string(),
        })
    }
}

async fn claim_flow_once(store: &dyn SharedStore, key: String) -> StoreResult<Vec<Option<String>>> {
    let watch = store.watch(&key).await?;
    let stored = store.hash_get(&key, &FlowCounters::FIELDS).await?;
    store.exec(&[watch], vec![WriteOp::Delete { key }]).await?;
    Ok(stored)
}

async fn claim_visitor_once(store: &dyn SharedStore, key: String) -> StoreResult<HashMap<String, String>> {
    let watch = store.watch(&key).await?;
    let records = store.hash_get_all(&key).await?;
    store.exec(&[watch], vec![WriteOp::Delete { key }]).await?;
    Ok(records)
}
