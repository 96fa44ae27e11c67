//! Durable (relational) store abstraction.

use async_trait::async_trait;

use crate::model::{Browsing, PageInfo, RealtimeSnapshot, RegisteredDomain, WebFlow};

/// Long-term persistence used by the rollover, the snapshot ticker and the
/// new-visitor lookup.
///
/// The DuckDB crate provides the implementation; tests can substitute their
/// own.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Merge-or-insert by `(domain, url, date)`: add counters to an existing
    /// row, or insert the record as a new row.
    async fn merge_webflow(&self, flow: &WebFlow) -> anyhow::Result<()>;

    /// Merge-or-insert by `(uid, domain, date)`.
    async fn merge_browsing(&self, browsing: &Browsing) -> anyhow::Result<()>;

    /// Whether `uid` has any recorded history on `domain`.
    async fn visitor_seen_before(&self, domain: &str, uid: &str) -> anyhow::Result<bool>;

    /// Insert page metadata unless a row for the URL already exists.
    async fn save_page_info(&self, page: &PageInfo) -> anyhow::Result<()>;

    async fn save_realtime_snapshot(&self, snapshot: &RealtimeSnapshot) -> anyhow::Result<()>;

    async fn registered_domains(&self) -> anyhow::Result<Vec<RegisteredDomain>>;
}
