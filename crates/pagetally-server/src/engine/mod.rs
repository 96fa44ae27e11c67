//! The aggregation engine: ingestion queue, dedup, in-memory tables, flush
//! pipeline and the daily/realtime background jobs.
//!
//! One [`Aggregator`] is built at startup and shared through `AppState`.

pub mod dedup;
pub mod dispatcher;
pub mod flush;
pub mod realtime;
pub mod retry;
pub mod rollover;
pub mod table;
pub mod top;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use pagetally_core::clock::Clock;
use pagetally_core::config::Config;
use pagetally_core::durable::DurableStore;
use pagetally_core::error::IngestError;
use pagetally_core::event::{FlowUpdate, IngestEvent, PageClose, PageView};
use pagetally_core::keys::StoreKey;
use pagetally_core::model::{Browsing, PageInfo, WebFlow};
use pagetally_core::store::{Expiry, SharedStore};
use pagetally_core::visitor::domain_from_url;

use self::dedup::Dedup;
use self::dispatcher::{shutdown_signalled, Dispatcher};
use self::realtime::RealtimeCounters;
use self::table::AggregationTable;

/// How long a URL's page metadata stays cached in the shared store.
const PAGE_INFO_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Ingestion counters exposed by `GET /api/ingest/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestStats {
    pub requests: u64,
    pub queued: usize,
    pub queue_capacity: usize,
    pub pending_webflows: usize,
    pub pending_browsings: usize,
    pub pending_realtime_domains: usize,
}

pub struct Aggregator {
    pub(crate) config: Arc<Config>,
    pub(crate) store: Arc<dyn SharedStore>,
    pub(crate) durable: Arc<dyn DurableStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) dedup: Dedup,
    pub(crate) webflows: AggregationTable<WebFlow>,
    pub(crate) browsings: AggregationTable<Browsing>,
    pub(crate) realtime: RealtimeCounters,
    dispatcher: Dispatcher,
    consumer: Mutex<Option<JoinHandle<()>>>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
    /// Latest day handed to the durable store by a rollover. Deltas for this
    /// day or earlier bypass the shared store.
    rolled_through: std::sync::Mutex<Option<NaiveDate>>,
    /// Held shared by every shared-store merge; a rollover takes it
    /// exclusively to wait for merges that started before it.
    persist_gate: RwLock<()>,
}

impl Aggregator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn SharedStore>,
        durable: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: Dispatcher::new(config.queue_capacity),
            dedup: Dedup::new(
                Arc::clone(&store),
                Arc::clone(&durable),
                config.realtime_retry(),
            ),
            config,
            store,
            durable,
            clock,
            webflows: AggregationTable::new(),
            browsings: AggregationTable::new(),
            realtime: RealtimeCounters::new(),
            consumer: Mutex::new(None),
            tickers: Mutex::new(Vec::new()),
            rolled_through: std::sync::Mutex::new(None),
            persist_gate: RwLock::new(()),
        })
    }

    /// Spawn the queue consumer and the flush, snapshot and rollover loops.
    /// Calling it a second time does nothing.
    pub async fn start(self: &Arc<Self>) {
        let Some(rx) = self.dispatcher.take_receiver() else {
            warn!("Aggregator already started");
            return;
        };
        let consumer = tokio::spawn(Arc::clone(self).run_consumer(rx));
        *self.consumer.lock().await = Some(consumer);

        let mut tickers = self.tickers.lock().await;
        tickers.push(tokio::spawn(Arc::clone(self).run_flush_loop()));
        tickers.push(tokio::spawn(Arc::clone(self).run_snapshot_loop()));
        tickers.push(tokio::spawn(Arc::clone(self).run_rollover_loop()));
        info!(
            queue_capacity = self.dispatcher.capacity(),
            flush_threshold = self.config.flush_threshold,
            "Aggregator started"
        );
    }

    /// Stop ingestion, finish every queued and in-flight event, stop the
    /// background loops, then flush everything still held in memory.
    ///
    /// A process-local shared store would not survive the restart, so in
    /// that case yesterday and today are rolled into the durable store
    /// instead.
    pub async fn shutdown(self: &Arc<Self>) {
        self.dispatcher.close();
        let consumer = self.consumer.lock().await.take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                warn!(error = %e, "Ingestion consumer ended abnormally");
            }
        }
        let tickers = std::mem::take(&mut *self.tickers.lock().await);
        for ticker in tickers {
            if let Err(e) = ticker.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        if self.store.is_process_local() {
            let today = self.clock.today();
            if let Some(yesterday) = today.pred_opt() {
                self.rollover(yesterday).await;
            }
            self.rollover(today).await;
        } else {
            self.flush_everything().await;
        }
        info!("Aggregator stopped");
    }

    pub async fn submit_page_view(&self, view: PageView) -> Result<(), IngestError> {
        self.dispatcher
            .submit(IngestEvent::PageView(Box::new(view)))
            .await
    }

    pub async fn submit_flow_update(&self, update: FlowUpdate) -> Result<(), IngestError> {
        self.dispatcher
            .submit(IngestEvent::FlowUpdate(Box::new(update)))
            .await
    }

    pub async fn submit_page_close(&self, close: PageClose) -> Result<(), IngestError> {
        self.dispatcher.submit(IngestEvent::PageClose(close)).await
    }

    /// Current local calendar day as seen by the aggregator's clock.
    pub fn today(&self) -> chrono::NaiveDate {
        self.clock.today()
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.dispatcher.is_closed()
    }

    pub async fn stats(&self) -> IngestStats {
        IngestStats {
            requests: self.dispatcher.request_count(),
            queued: self.dispatcher.queued(),
            queue_capacity: self.dispatcher.capacity(),
            pending_webflows: self.webflows.len().await,
            pending_browsings: self.browsings.len().await,
            pending_realtime_domains: self.realtime.pending_domains().await,
        }
    }

    /// Single consumer: every dequeued event gets its own task. On shutdown
    /// the events already buffered are still handled, and the loop returns
    /// once all handlers have finished.
    async fn run_consumer(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<IngestEvent>) {
        let mut shutdown = self.dispatcher.subscribe();
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        handlers.spawn(Arc::clone(&self).handle(event));
                    }
                    None => break,
                },
                _ = shutdown_signalled(&mut shutdown) => break,
            }
            while handlers.try_join_next().is_some() {}
        }

        rx.close();
        let mut drained = 0usize;
        while let Some(event) = rx.recv().await {
            drained += 1;
            handlers.spawn(Arc::clone(&self).handle(event));
        }
        while handlers.join_next().await.is_some() {}
        debug!(drained, "Ingestion consumer finished");
    }

    /// Handle one event to completion.
    pub async fn handle(self: Arc<Self>, event: IngestEvent) {
        debug!(kind = event.kind(), "Handling event");
        match event {
            IngestEvent::PageView(view) => self.handle_page_view(*view).await,
            IngestEvent::FlowUpdate(update) => self.handle_flow_update(*update).await,
            IngestEvent::PageClose(close) => self.handle_page_close(close).await,
        }
    }

    async fn handle_page_view(self: Arc<Self>, view: PageView) {
        let date = self.clock.today();
        let PageView {
            mut page,
            mut webflow,
            mut browsing,
        } = view;

        if webflow.url.is_empty() {
            webflow.url = page.url.clone();
        }
        let domain = [&page.domain, &webflow.domain, &browsing.domain]
            .into_iter()
            .find(|d| !d.is_empty())
            .cloned()
            .or_else(|| domain_from_url(&webflow.url))
            .unwrap_or_default();
        if webflow.url.is_empty() {
            warn!(domain = %domain, "Page view without URL dropped");
            return;
        }

        page.url = webflow.url.clone();
        page.domain = domain.clone();
        webflow.domain = domain.clone();
        webflow.date = Some(date);
        browsing.domain = domain;
        browsing.date = Some(date);

        self.record_page_info(&page, date).await;
        self.handle_flow_update(FlowUpdate { webflow, browsing }).await;
    }

    /// Remember a URL's metadata once per day.
    async fn record_page_info(&self, page: &PageInfo, date: chrono::NaiveDate) {
        let key = StoreKey::PageInfo {
            date,
            url: &page.url,
        }
        .build();
        match self.store.get(&key).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Page info lookup failed");
                return;
            }
        }
        let encoded = match serde_json::to_string(page) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(url = %page.url, error = %e, "Page info not serializable");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set(&key, &encoded, Some(Expiry::After(PAGE_INFO_TTL)))
            .await
        {
            warn!(key = %key, error = %e, "Failed to cache page info");
        }
        if let Err(e) = self.durable.save_page_info(page).await {
            warn!(url = %page.url, error = %e, "Failed to save page info");
        }
    }

    /// Count a normalised page view.
    ///
    /// PV always counts; IP, UV/depth and visits count only when the matching
    /// dedup check says this is the first time. The client's seed counters
    /// are added on top, with negative seeds treated as zero.
    async fn handle_flow_update(self: Arc<Self>, update: FlowUpdate) {
        let FlowUpdate {
            mut webflow,
            mut browsing,
        } = update;
        webflow = webflow.without_negative_counters();
        browsing = browsing.without_negative_counters();
        let date = webflow.date.unwrap_or_else(|| self.clock.today());
        webflow.date = Some(date);
        let url = webflow.url.clone();
        let domain = webflow.domain.clone();
        let uid = browsing.uid.clone();
        let ip = browsing.ip.clone();

        webflow.pv = webflow.pv.saturating_add(1);
        if !ip.is_empty() && !self.dedup.ip_visited_today(&url, date, &ip).await {
            webflow.ip = webflow.ip.saturating_add(1);
        }

        if uid.is_empty() {
            warn!(url = %url, "Page view without visitor id; visitor counters skipped");
        } else {
            browsing.date = Some(date);
            browsing.domain = domain.clone();
            browsing.pv = browsing.pv.saturating_add(1);
            browsing.pageopend = browsing.pageopend.saturating_add(1);
            if !self.dedup.visitor_visited_today(&url, date, &uid).await {
                webflow.uv = webflow.uv.saturating_add(1);
                browsing.depth = browsing.depth.saturating_add(1);
            }
            if !self.dedup.visitor_visited_recently(&url, date, &uid).await {
                webflow.visits = webflow.visits.saturating_add(1);
                browsing.visits = browsing.visits.saturating_add(1);
            }
            browsing.nv = i64::from(self.dedup.is_new_visitor(&domain, date, &uid).await);
        }

        self.realtime.record(&domain, &ip, &uid, 1).await;
        self.merge_webflow(webflow).await;
        if !uid.is_empty() {
            self.merge_browsing(browsing).await;
        }
    }

    async fn handle_page_close(self: Arc<Self>, close: PageClose) {
        let date = self.clock.today();
        let domain = if close.domain.is_empty() {
            domain_from_url(&close.url).unwrap_or_default()
        } else {
            close.domain.clone()
        };
        let duration = close.duration.max(0);

        self.merge_webflow(WebFlow {
            domain: domain.clone(),
            url: close.url.clone(),
            date: Some(date),
            duration,
            ..Default::default()
        })
        .await;

        if !close.uid.is_empty() {
            self.merge_browsing(Browsing {
                uid: close.uid.clone(),
                domain: domain.clone(),
                date: Some(date),
                duration,
                pageopend: -1,
                ..Default::default()
            })
            .await;
        }

        self.realtime.record(&domain, &close.ip, &close.uid, -1).await;
    }

    /// Merge into the webflow table and kick off a background flush when the
    /// table reaches the threshold.
    pub(crate) async fn merge_webflow(self: &Arc<Self>, delta: WebFlow) {
        let size = self.webflows.merge(delta).await;
        if size >= self.config.flush_threshold {
            debug!(size, "Webflow table reached flush threshold");
            tokio::spawn(Arc::clone(self).flush_webflows_owned());
        }
    }

    pub(crate) async fn merge_browsing(self: &Arc<Self>, delta: Browsing) {
        let size = self.browsings.merge(delta).await;
        if size >= self.config.flush_threshold {
            debug!(size, "Browsing table reached flush threshold");
            tokio::spawn(Arc::clone(self).flush_browsings_owned());
        }
    }

    async fn run_flush_loop(self: Arc<Self>) {
        let mut shutdown = self.dispatcher.subscribe();
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_tick().await,
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
    }

    async fn run_snapshot_loop(self: Arc<Self>) {
        let mut shutdown = self.dispatcher.subscribe();
        let mut ticker = tokio::time::interval(self.config.snapshot_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.snapshot_realtime().await;
                }
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
    }

    /// Sleep until local midnight, roll the finished day over, repeat.
    async fn run_rollover_loop(self: Arc<Self>) {
        let mut shutdown = self.dispatcher.subscribe();
        loop {
            let day = self.clock.today();
            let wait = (pagetally_core::clock::next_midnight(day) - self.clock.now())
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(1))
                .max(std::time::Duration::from_secs(1));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.rollover(day).await;
                }
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
    }
}
