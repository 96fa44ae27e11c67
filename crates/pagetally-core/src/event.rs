use serde::{Deserialize, Serialize};

use crate::model::{Browsing, PageInfo, WebFlow};

/// The payload the tracking script sends when a page is opened.
///
/// `w` and `b` are seeds: whatever counters the client already filled in are
/// added on top of the server-side counting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageView {
    #[serde(rename = "p", default)]
    pub page: PageInfo,
    #[serde(rename = "w", default)]
    pub webflow: WebFlow,
    #[serde(rename = "b", default)]
    pub browsing: Browsing,
}

/// The payload sent when a page is closed. It is always counted on the
/// server's current day; a client-sent `date` is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageClose {
    pub domain: String,
    pub url: String,
    pub uid: String,
    pub ip: String,
    /// Seconds the page stayed open.
    pub duration: i64,
}

/// A normalised page view, ready for deduplication and counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowUpdate {
    pub webflow: WebFlow,
    pub browsing: Browsing,
}

/// Everything that travels through the ingestion queue.
#[derive(Debug, Clone)]
pub enum IngestEvent {
    PageView(Box<PageView>),
    FlowUpdate(Box<FlowUpdate>),
    PageClose(PageClose),
}

impl IngestEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestEvent::PageView(_) => "page_view",
            IngestEvent::FlowUpdate(_) => "flow_update",
            IngestEvent::PageClose(_) => "page_close",
        }
    }
}
