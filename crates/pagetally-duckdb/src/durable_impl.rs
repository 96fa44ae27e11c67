use async_trait::async_trait;

use pagetally_core::durable::DurableStore;
use pagetally_core::model::{Browsing, PageInfo, RealtimeSnapshot, RegisteredDomain, WebFlow};

use crate::DuckDbBackend;

#[async_trait]
impl DurableStore for DuckDbBackend {
    async fn merge_webflow(&self, flow: &WebFlow) -> anyhow::Result<()> {
        DuckDbBackend::merge_webflow(self, flow).await
    }

    async fn merge_browsing(&self, browsing: &Browsing) -> anyhow::Result<()> {
        DuckDbBackend::merge_browsing(self, browsing).await
    }

    async fn visitor_seen_before(&self, domain: &str, uid: &str) -> anyhow::Result<bool> {
        DuckDbBackend::visitor_seen_before(self, domain, uid).await
    }

    async fn save_page_info(&self, page: &PageInfo) -> anyhow::Result<()> {
        DuckDbBackend::save_page_info(self, page).await
    }

    async fn save_realtime_snapshot(&self, snapshot: &RealtimeSnapshot) -> anyhow::Result<()> {
        DuckDbBackend::save_realtime_snapshot(self, snapshot).await
    }

    async fn registered_domains(&self) -> anyhow::Result<Vec<RegisteredDomain>> {
        DuckDbBackend::registered_domains(self).await
    }
}
