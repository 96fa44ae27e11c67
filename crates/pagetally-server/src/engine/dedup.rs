//! "Seen before?" questions answered by shared-store set membership.
//!
//! Every check adds the member and arms the set's expiry in one watched
//! transaction, so two concurrent events for the same visitor never both
//! count as first and no marker is left without an expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{error, warn};

use pagetally_core::clock::next_midnight;
use pagetally_core::config::RetryPolicy;
use pagetally_core::durable::DurableStore;
use pagetally_core::keys::StoreKey;
use pagetally_core::store::{Expiry, SharedStore, StoreResult, WriteOp};

use super::retry::{with_retry, RetryOutcome};

/// Window in which repeated views of a URL count as one visit.
pub const VISIT_WINDOW: Duration = Duration::from_secs(30 * 60);

const RECENT_VISIT_MARKER: &str = "1";

pub struct Dedup {
    store: Arc<dyn SharedStore>,
    durable: Arc<dyn DurableStore>,
    retry: RetryPolicy,
}

impl Dedup {
    pub fn new(
        store: Arc<dyn SharedStore>,
        durable: Arc<dyn DurableStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            durable,
            retry,
        }
    }

    /// Add `member` to the set at `key`. Returns `true` if it was already
    /// there. A new member (re)arms the key's expiry in the same commit.
    ///
    /// A store failure is logged and reported as "not seen", so the event is
    /// counted rather than lost.
    pub async fn already_seen(&self, key: &str, member: &str, expiry: Expiry) -> bool {
        let store = self.store.as_ref();
        match with_retry(&self.retry, || mark_seen_once(store, key, member, expiry)).await {
            RetryOutcome::Done(seen) => seen,
            RetryOutcome::Exhausted => {
                warn!(key, "Dedup marker kept conflicting; counting event as first");
                false
            }
            RetryOutcome::Failed(e) => {
                warn!(key, error = %e, "Dedup check failed; counting event as first");
                false
            }
        }
    }

    pub async fn ip_visited_today(&self, url: &str, date: NaiveDate, ip: &str) -> bool {
        let key = StoreKey::IpVisited { date, ip }.build();
        self.already_seen(&key, url, Expiry::At(next_midnight(date)))
            .await
    }

    pub async fn visitor_visited_today(&self, url: &str, date: NaiveDate, uid: &str) -> bool {
        let key = StoreKey::VisitorVisited { date, uid }.build();
        self.already_seen(&key, url, Expiry::At(next_midnight(date)))
            .await
    }

    /// Whether the visitor viewed `url` within the visit window. The window
    /// starts at the first view and is not extended by later ones.
    pub async fn visitor_visited_recently(&self, url: &str, date: NaiveDate, uid: &str) -> bool {
        let key = StoreKey::RecentVisit { date, uid, url }.build();
        self.already_seen(&key, RECENT_VISIT_MARKER, Expiry::After(VISIT_WINDOW))
            .await
    }

    /// Whether this is the visitor's first appearance on `domain`.
    ///
    /// The durable history is consulted once per visitor per day; later
    /// checks the same day hit the cache and report `false`. A failed history
    /// lookup treats the visitor as returning and caches nothing.
    pub async fn is_new_visitor(&self, domain: &str, date: NaiveDate, uid: &str) -> bool {
        let key = StoreKey::NewVisitorChecked { date, domain }.build();
        match self.store.set_is_member(&key, uid).await {
            Ok(true) => return false,
            Ok(false) => {}
            Err(e) => warn!(key = %key, error = %e, "New-visitor cache lookup failed"),
        }

        let seen_before = match self.durable.visitor_seen_before(domain, uid).await {
            Ok(seen) => seen,
            Err(e) => {
                error!(domain, uid, error = %e, "Visitor history lookup failed");
                return false;
            }
        };

        // Someone else may have classified the visitor in the meantime; the
        // first writer's answer stands.
        if self.already_seen(&key, uid, Expiry::At(next_midnight(date))).await {
            return false;
        }
        !seen_before
    }
}

/// One attempt: report membership, or add the member together with its
/// expiry.
async fn mark_seen_once(
    store: &dyn SharedStore,
    key: &str,
    member: &str,
    expiry: Expiry,
) -> StoreResult<bool> {
    let watch = store.watch(key).await?;
    if store.set_is_member(key, member).await? {
        return Ok(true);
    }
    store
        .exec(
            &[watch],
            vec![
                WriteOp::SetAdd {
                    key: key.to_string(),
                    member: member.to_string(),
                },
                WriteOp::Expire {
                    key: key.to_string(),
                    expiry,
                },
            ],
        )
        .await?;
    Ok(false)
}
