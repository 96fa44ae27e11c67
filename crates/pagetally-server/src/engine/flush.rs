//! Moving accumulated deltas from memory into the shared store.
//!
//! Every merge is a watch / read / add / commit transaction retried under a
//! [`RetryPolicy`](pagetally_core::config::RetryPolicy). Flow and browsing
//! deltas are never dropped: a merge that cannot commit puts its original
//! delta back in memory. Deltas for a day that has already been rolled over
//! go to the durable store directly. Realtime deltas are best effort.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use chrono::NaiveDate;
use tokio::task::JoinSet;
use tracing::{debug, error};

use pagetally_core::clock::next_midnight;
use pagetally_core::keys::{flow_member, StoreKey};
use pagetally_core::model::{Browsing, FlowCounters, WebFlow};
use pagetally_core::store::{parse_count, Expiry, SharedStore, StoreResult, WriteOp};

use super::realtime::MemberFamily;
use super::retry::{with_retry, RetryOutcome};
use super::Aggregator;

impl Aggregator {
    /// Expiry of a day's aggregates and seen sets.
    ///
    /// They do not expire at midnight: they live until the following
    /// midnight plus `rollover_grace` (24 hours by default), because the
    /// rollover runs just after midnight and must still find them.
    pub(crate) fn aggregate_expiry(&self, date: NaiveDate) -> Expiry {
        Expiry::At(next_midnight(date) + self.config.rollover_grace())
    }

    fn is_rolled_over(&self, date: NaiveDate) -> bool {
        self.rolled_through
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|through| date <= through)
    }

    /// Flush one batch of webflows. Returns how many entries were taken.
    pub async fn flush_webflows(self: &Arc<Self>) -> usize {
        let batch = self.webflows.drain(self.config.flush_threshold).await;
        let taken = batch.len();
        if taken == 0 {
            return 0;
        }
        let mut merges = JoinSet::new();
        for entry in batch {
            merges.spawn(Arc::clone(self).persist_webflow(entry));
        }
        while merges.join_next().await.is_some() {}
        debug!(count = taken, "Webflows flushed");
        taken
    }

    pub async fn flush_browsings(self: &Arc<Self>) -> usize {
        let batch = self.browsings.drain(self.config.flush_threshold).await;
        let taken = batch.len();
        if taken == 0 {
            return 0;
        }
        let mut merges = JoinSet::new();
        for entry in batch {
            merges.spawn(Arc::clone(self).persist_browsing(entry));
        }
        while merges.join_next().await.is_some() {}
        debug!(count = taken, "Browsings flushed");
        taken
    }

    pub(crate) async fn flush_webflows_owned(self: Arc<Self>) {
        self.flush_webflows().await;
    }

    pub(crate) async fn flush_browsings_owned(self: Arc<Self>) {
        self.flush_browsings().await;
    }

    /// One ticker pass: a batch of each table plus all realtime deltas.
    pub async fn flush_tick(self: &Arc<Self>) {
        self.flush_webflows().await;
        self.flush_browsings().await;
        self.flush_realtime().await;
    }

    /// Flush until both tables are empty.
    pub async fn flush_everything(self: &Arc<Self>) {
        loop {
            let flushed = self.flush_webflows().await + self.flush_browsings().await;
            if flushed == 0 {
                break;
            }
        }
        self.flush_realtime().await;
    }

    async fn persist_webflow(self: Arc<Self>, mut entry: WebFlow) {
        let date = entry.date.unwrap_or_else(|| self.clock.today());
        entry.date = Some(date);
        let gate = self.persist_gate.read().await;
        let persisted = if self.is_rolled_over(date) {
            match self.durable.merge_webflow(&entry).await {
                Ok(()) => true,
                Err(e) => {
                    error!(url = %entry.url, error = %e, "Late webflow merge into durable store failed; requeueing");
                    false
                }
            }
        } else {
            let expiry = self.aggregate_expiry(date);
            let store = self.store.as_ref();
            let delta = &entry;
            let outcome = with_retry(&self.config.retry, move || {
                merge_webflow_once(store, delta, date, expiry)
            })
            .await;
            match outcome {
                RetryOutcome::Done(()) => true,
                RetryOutcome::Exhausted => {
                    error!(url = %entry.url, "Webflow merge kept conflicting; requeueing");
                    false
                }
                RetryOutcome::Failed(e) => {
                    error!(url = %entry.url, error = %e, "Webflow merge failed; requeueing");
                    false
                }
            }
        };
        drop(gate);
        if !persisted {
            self.requeue_webflow(entry).await;
        }
    }

    async fn persist_browsing(self: Arc<Self>, mut entry: Browsing) {
        let date = entry.date.unwrap_or_else(|| self.clock.today());
        entry.date = Some(date);
        let gate = self.persist_gate.read().await;
        let persisted = if self.is_rolled_over(date) {
            match self.durable.merge_browsing(&entry).await {
                Ok(()) => true,
                Err(e) => {
                    error!(uid = %entry.uid, error = %e, "Late browsing merge into durable store failed; requeueing");
                    false
                }
            }
        } else {
            let expiry = self.aggregate_expiry(date);
            let store = self.store.as_ref();
            let delta = &entry;
            let outcome = with_retry(&self.config.retry, move || {
                merge_browsing_once(store, delta, date, expiry)
            })
            .await;
            match outcome {
                RetryOutcome::Done(()) => true,
                RetryOutcome::Exhausted => {
                    error!(uid = %entry.uid, "Browsing merge kept conflicting; requeueing");
                    false
                }
                RetryOutcome::Failed(e) => {
                    error!(uid = %entry.uid, error = %e, "Browsing merge failed; requeueing");
                    false
                }
            }
        };
        drop(gate);
        if !persisted {
            self.requeue_browsing(entry).await;
        }
    }

    async fn requeue_webflow(&self, entry: WebFlow) {
        tokio::time::sleep(self.config.retry.requeue_delay).await;
        self.webflows.merge(entry).await;
    }

    async fn requeue_browsing(&self, entry: Browsing) {
        tokio::time::sleep(self.config.retry.requeue_delay).await;
        self.browsings.merge(entry).await;
    }

    /// Send all pending realtime deltas. Each domain and family commits on
    /// its own; a delta that cannot be committed is dropped.
    pub async fn flush_realtime(&self) {
        let pv = self.realtime.take_pv().await;
        let ip = self.realtime.take_members(MemberFamily::Ip).await;
        let uv = self.realtime.take_members(MemberFamily::Uv).await;
        if pv.is_empty() && ip.is_empty() && uv.is_empty() {
            return;
        }

        let policy = self.config.realtime_retry();
        let mut merges = JoinSet::new();
        for (domain, delta) in pv {
            let store = Arc::clone(&self.store);
            merges.spawn(async move {
                let key = StoreKey::RealtimePv { domain: &domain }.build();
                let outcome = {
                    let store = store.as_ref();
                    let key = key.as_str();
                    with_retry(&policy, move || add_realtime_pv_once(store, key, delta)).await
                };
                report_realtime(&key, outcome);
            });
        }
        for (family, deltas) in [(MemberFamily::Ip, ip), (MemberFamily::Uv, uv)] {
            for (domain, members) in deltas {
                let store = Arc::clone(&self.store);
                merges.spawn(async move {
                    let key = match family {
                        MemberFamily::Ip => StoreKey::RealtimeIp { domain: &domain },
                        MemberFamily::Uv => StoreKey::RealtimeUv { domain: &domain },
                    }
                    .build();
                    let outcome = {
                        let store = store.as_ref();
                        let key = key.as_str();
                        let members = &members;
                        with_retry(&policy, move || {
                            add_realtime_members_once(store, key, members)
                        })
                        .await
                    };
                    report_realtime(&key, outcome);
                });
            }
        }
        while merges.join_next().await.is_some() {}
    }
}

fn report_realtime(key: &str, outcome: RetryOutcome<()>) {
    match outcome {
        RetryOutcome::Done(()) => {}
        RetryOutcome::Exhausted => {
            error!(key, "Realtime counter kept conflicting; delta dropped");
        }
        RetryOutcome::Failed(e) => {
            error!(key, error = %e, "Realtime counter update failed; delta dropped");
        }
    }
}

/// One optimistic attempt at adding `delta`'s counters to the stored flow.
/// Also records the URL in the day's seen set so the rollover finds it.
async fn merge_webflow_once(
    store: &dyn SharedStore,
    delta: &WebFlow,
    date: NaiveDate,
    expiry: Expiry,
) -> StoreResult<()> {
    let key = StoreKey::Flow {
        date,
        domain: &delta.domain,
        url: &delta.url,
    }
    .build();
    let watch = store.watch(&key).await?;
    let stored = store.hash_get(&key, &FlowCounters::FIELDS).await?;
    let mut values = [0i64; 6];
    for (slot, raw) in values.iter_mut().zip(stored.iter()) {
        *slot = parse_count(&key, raw.as_deref())?;
    }
    let merged = FlowCounters::from_values(values).plus(delta.counters());
    let fields = FlowCounters::FIELDS
        .iter()
        .zip(merged.values())
        .map(|(field, value)| (field.to_string(), value.to_string()))
        .collect();

    let seen = StoreKey::SeenUrls { date }.build();
    store
        .exec(
            &[watch],
            vec![
                WriteOp::HashSet {
                    key: key.clone(),
                    fields,
                },
                WriteOp::Expire { key, expiry },
                WriteOp::SetAdd {
                    key: seen.clone(),
                    member: flow_member(&delta.domain, &delta.url),
                },
                WriteOp::Expire { key: seen, expiry },
            ],
        )
        .await
}

/// One optimistic attempt at merging `delta` into the visitor's day hash,
/// under the field named after the domain.
async fn merge_browsing_once(
    store: &dyn SharedStore,
    delta: &Browsing,
    date: NaiveDate,
    expiry: Expiry,
) -> StoreResult<()> {
    let key = StoreKey::Browsing {
        date,
        uid: &delta.uid,
    }
    .build();
    let watch = store.watch(&key).await?;
    let stored = store.hash_get(&key, &[delta.domain.as_str()]).await?;
    let stored: Browsing = match stored.into_iter().next().flatten() {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Browsing::default(),
    };
    let mut merged = delta.merged_with_stored(&stored);
    merged.date = Some(date);
    let encoded = serde_json::to_string(&merged)?;

    let seen = StoreKey::SeenVisitors { date }.build();
    store
        .exec(
            &[watch],
            vec![
                WriteOp::HashSet {
                    key: key.clone(),
                    fields: vec![(delta.domain.clone(), encoded)],
                },
                WriteOp::Expire { key, expiry },
                WriteOp::SetAdd {
                    key: seen.clone(),
                    member: delta.uid.clone(),
                },
                WriteOp::Expire { key: seen, expiry },
            ],
        )
        .await
}

/// Add to the domain's open-page scalar, never going below zero.
async fn add_realtime_pv_once(store: &dyn SharedStore, key: &str, delta: i64) -> StoreResult<()> {
    let watch = store.watch(key).await?;
    let stored = store.get(key).await?;
    let current = parse_count(key, stored.as_deref())?;
    let next = current.saturating_add(delta).max(0);
    store
        .exec(
            &[watch],
            vec![WriteOp::Set {
                key: key.to_string(),
                value: next.to_string(),
            }],
        )
        .await
}

/// Add per-member deltas to a realtime hash; members that end at or below
/// zero are removed.
async fn add_realtime_members_once(
    store: &dyn SharedStore,
    key: &str,
    deltas: &HashMap<String, i64>,
) -> StoreResult<()> {
    let watch = store.watch(key).await?;
    let members: Vec<&str> = deltas.keys().map(String::as_str).collect();
    let stored = store.hash_get(key, &members).await?;

    let mut keep = Vec::new();
    let mut remove = Vec::new();
    for (member, raw) in members.iter().zip(stored.iter()) {
        let delta = deltas.get(*member).copied().unwrap_or(0);
        let next = parse_count(key, raw.as_deref())?.saturating_add(delta);
        if next > 0 {
            keep.push((member.to_string(), next.to_string()));
        } else {
            remove.push(member.to_string());
        }
    }

    let mut ops = Vec::new();
    if !keep.is_empty() {
        ops.push(WriteOp::HashSet {
            key: key.to_string(),
            fields: keep,
        });
    }
    if !remove.is_empty() {
        ops.push(WriteOp::HashDelete {
            key: key.to_string(),
            fields: remove,
        });
    }
    store.exec(&[watch], ops).await
}
