use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use pagetally_core::clock::{Clock, ManualClock, SystemClock};
use pagetally_core::config::{Config, RetryPolicy};
use pagetally_core::error::{IngestError, StoreError};
use pagetally_core::event::{IngestEvent, PageClose, PageView};
use pagetally_core::keys::StoreKey;
use pagetally_core::model::{Browsing, FlowCounters, PageInfo, WebFlow};
use pagetally_core::store::{
    Expiry, MemoryStore, SharedStore, StoreResult, Watch, WriteOp,
};
use pagetally_duckdb::DuckDbBackend;
use pagetally_server::engine::Aggregator;

const DOMAIN: &str = "news.example";

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 14).expect("valid date")
}

struct Harness {
    aggregator: Arc<Aggregator>,
    store: Arc<MemoryStore>,
    db: Arc<DuckDbBackend>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    harness_with(Config::default(), |store| store as Arc<dyn SharedStore>)
}

fn harness_with(
    config: Config,
    wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn SharedStore>,
) -> Harness {
    let clock = Arc::new(ManualClock::at_local_noon(day()));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let aggregator = Aggregator::new(
        Arc::new(config),
        wrap(Arc::clone(&store)),
        db.clone(),
        clock.clone(),
    );
    Harness {
        aggregator,
        store,
        db,
        clock,
    }
}

fn view(url: &str, uid: &str, ip: &str) -> IngestEvent {
    IngestEvent::PageView(Box::new(PageView {
        page: PageInfo {
            domain: DOMAIN.to_string(),
            url: url.to_string(),
            title: format!("Title of {url}"),
            ..Default::default()
        },
        browsing: Browsing {
            uid: uid.to_string(),
            ip: ip.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }))
}

fn close(url: &str, uid: &str, ip: &str, duration: i64) -> IngestEvent {
    IngestEvent::PageClose(PageClose {
        domain: DOMAIN.to_string(),
        url: url.to_string(),
        uid: uid.to_string(),
        ip: ip.to_string(),
        duration,
    })
}

async fn flow(store: &MemoryStore, date: NaiveDate, url: &str) -> FlowCounters {
    let key = StoreKey::Flow {
        date,
        domain: DOMAIN,
        url,
    }
    .build();
    let raw = store
        .hash_get(&key, &FlowCounters::FIELDS)
        .await
        .expect("read flow");
    let mut values = [0i64; 6];
    for (slot, v) in values.iter_mut().zip(raw) {
        *slot = v.map(|s| s.parse().expect("number")).unwrap_or(0);
    }
    FlowCounters::from_values(values)
}

async fn browsing(store: &MemoryStore, date: NaiveDate, uid: &str) -> Option<Browsing> {
    let key = StoreKey::Browsing { date, uid }.build();
    let raw = store.hash_get(&key, &[DOMAIN]).await.expect("read browsing");
    raw.into_iter()
        .next()
        .flatten()
        .map(|s| serde_json::from_str(&s).expect("browsing json"))
}

impl Harness {
    async fn handle(&self, event: IngestEvent) {
        Arc::clone(&self.aggregator).handle(event).await;
    }

    async fn durable_flow(&self, date: NaiveDate, url: &str) -> Option<WebFlow> {
        self.db
            .webflow_for(DOMAIN, url, date)
            .await
            .expect("query web_flow")
    }
}

fn seeded_view(url: &str, uid: &str, webflow: WebFlow, browsing: Browsing) -> IngestEvent {
    IngestEvent::PageView(Box::new(PageView {
        page: PageInfo {
            domain: DOMAIN.to_string(),
            url: url.to_string(),
            ..Default::default()
        },
        webflow,
        browsing: Browsing {
            uid: uid.to_string(),
            ip: "10.0.0.9".to_string(),
            ..browsing
        },
    }))
}

// ============================================================
// Counting
// ============================================================

#[tokio::test]
async fn n_views_count_n_page_views_but_one_ip_uv_and_visit() {
    let h = harness();
    for _ in 0..5 {
        h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    }
    h.aggregator.flush_everything().await;

    let counters = flow(&h.store, day(), "https://news.example/a").await;
    assert_eq!(counters.pv, 5);
    assert_eq!(counters.ip, 1);
    assert_eq!(counters.uv, 1);
    assert_eq!(counters.visits, 1);

    let b = browsing(&h.store, day(), "v1").await.expect("browsing");
    assert_eq!(b.pv, 5);
    assert_eq!(b.depth, 1);
    assert_eq!(b.visits, 1);
    assert_eq!(b.pageopend, 5);
    assert_eq!(b.nv, 1);
}

#[tokio::test]
async fn visits_count_again_after_thirty_minutes_but_uv_does_not() {
    let h = harness();
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.clock.advance(chrono::Duration::minutes(10));
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.clock.advance(chrono::Duration::minutes(21));
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.aggregator.flush_everything().await;

    let counters = flow(&h.store, day(), "https://news.example/a").await;
    assert_eq!(counters.pv, 3);
    assert_eq!(counters.uv, 1);
    assert_eq!(counters.visits, 2);
}

#[tokio::test]
async fn depth_counts_distinct_urls_and_ip_is_per_url() {
    let h = harness();
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.handle(view("https://news.example/b", "v1", "10.0.0.1")).await;
    h.handle(view("https://news.example/b", "v2", "10.0.0.1")).await;
    h.aggregator.flush_everything().await;

    let b = browsing(&h.store, day(), "v1").await.expect("browsing");
    assert_eq!(b.depth, 2);
    let second = flow(&h.store, day(), "https://news.example/b").await;
    assert_eq!(second.ip, 1);
    assert_eq!(second.uv, 2);
}

#[tokio::test]
async fn closing_and_reopening_counts_uv_and_depth_once() {
    let h = harness();
    h.handle(close("https://news.example/a", "v1", "10.0.0.1", 3)).await;
    for _ in 0..3 {
        h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
        h.handle(close("https://news.example/a", "v1", "10.0.0.1", 3)).await;
    }
    h.aggregator.flush_everything().await;

    let counters = flow(&h.store, day(), "https://news.example/a").await;
    assert_eq!(counters.pv, 3);
    assert_eq!(counters.uv, 1);
    assert_eq!(counters.duration, 12);
    let b = browsing(&h.store, day(), "v1").await.expect("browsing");
    assert_eq!(b.depth, 1);
}

#[tokio::test]
async fn returning_visitor_is_not_new() {
    let h = harness();
    h.db.merge_browsing(&Browsing {
        uid: "old".to_string(),
        domain: DOMAIN.to_string(),
        date: NaiveDate::from_ymd_opt(2024, 5, 1),
        pv: 1,
        ..Default::default()
    })
    .await
    .expect("seed history");

    h.handle(view("https://news.example/a", "old", "10.0.0.1")).await;
    h.handle(view("https://news.example/a", "new", "10.0.0.2")).await;
    h.handle(view("https://news.example/b", "new", "10.0.0.2")).await;
    h.aggregator.flush_everything().await;

    assert_eq!(browsing(&h.store, day(), "old").await.expect("old").nv, 0);
    assert_eq!(browsing(&h.store, day(), "new").await.expect("new").nv, 1);
}

#[tokio::test]
async fn page_close_adds_duration_and_closes_the_page() {
    let h = harness();
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.aggregator.flush_everything().await;

    let rt_pv = StoreKey::RealtimePv { domain: DOMAIN }.build();
    let rt_ip = StoreKey::RealtimeIp { domain: DOMAIN }.build();
    assert_eq!(h.store.get(&rt_pv).await.expect("pv").as_deref(), Some("1"));
    assert_eq!(h.store.hash_len(&rt_ip).await.expect("ip"), 1);

    h.handle(close("https://news.example/a", "v1", "10.0.0.1", 42)).await;
    h.aggregator.flush_everything().await;

    assert_eq!(flow(&h.store, day(), "https://news.example/a").await.duration, 42);
    let b = browsing(&h.store, day(), "v1").await.expect("browsing");
    assert_eq!(b.duration, 42);
    assert_eq!(b.pageopend, 0);
    assert_eq!(h.store.get(&rt_pv).await.expect("pv").as_deref(), Some("0"));
    assert_eq!(h.store.hash_len(&rt_ip).await.expect("ip"), 0);
}

#[tokio::test]
async fn realtime_page_views_never_go_below_zero() {
    let h = harness();
    h.handle(close("https://news.example/a", "v1", "10.0.0.1", 5)).await;
    h.aggregator.flush_everything().await;

    let rt_pv = StoreKey::RealtimePv { domain: DOMAIN }.build();
    assert_eq!(h.store.get(&rt_pv).await.expect("pv").as_deref(), Some("0"));
    let rt_uv = StoreKey::RealtimeUv { domain: DOMAIN }.build();
    assert_eq!(h.store.hash_len(&rt_uv).await.expect("uv"), 0);

    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.aggregator.flush_everything().await;
    assert_eq!(h.store.get(&rt_pv).await.expect("pv").as_deref(), Some("1"));
    assert_eq!(h.store.hash_len(&rt_uv).await.expect("uv"), 1);
}

// ============================================================
// Flush pipeline
// ============================================================

#[tokio::test]
async fn reaching_the_threshold_flushes_in_the_background() {
    let h = harness();
    for i in 0..501 {
        h.handle(view(&format!("https://news.example/{i}"), "v1", "10.0.0.1"))
            .await;
    }

    let mut pending = usize::MAX;
    for _ in 0..200 {
        pending = h.aggregator.stats().await.pending_webflows;
        if pending <= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(pending <= 1, "{pending} webflows still pending");

    let seen = StoreKey::SeenUrls { date: day() }.build();
    assert!(h.store.set_card(&seen).await.expect("card") >= 500);
}

/// Delegates to a [`MemoryStore`] but makes some transactions on flow keys
/// lose a real write race first.
struct RacingStore {
    inner: Arc<MemoryStore>,
    races_left: AtomicU32,
    always_conflict: AtomicBool,
}

impl RacingStore {
    fn new(inner: Arc<MemoryStore>, races: u32) -> Self {
        Self {
            inner,
            races_left: AtomicU32::new(races),
            always_conflict: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SharedStore for RacingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str, expiry: Option<Expiry>) -> StoreResult<()> {
        self.inner.set(key, value, expiry).await
    }
    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        self.inner.delete(keys).await
    }
    async fn expire(&self, key: &str, expiry: Expiry) -> StoreResult<bool> {
        self.inner.expire(key, expiry).await
    }
    async fn hash_get(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>> {
        self.inner.hash_get(key, fields).await
    }
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.inner.hash_get_all(key).await
    }
    async fn hash_len(&self, key: &str) -> StoreResult<u64> {
        self.inner.hash_len(key).await
    }
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.set_add(key, member).await
    }
    async fn set_is_member(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.set_is_member(key, member).await
    }
    async fn set_card(&self, key: &str) -> StoreResult<u64> {
        self.inner.set_card(key).await
    }
    async fn set_pop(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        self.inner.set_pop(key, count).await
    }
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.inner.set_members(key).await
    }
    async fn sort_by_hash_field(
        &self,
        set_key: &str,
        weight_pattern: &str,
        field: &str,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        self.inner
            .sort_by_hash_field(set_key, weight_pattern, field, limit)
            .await
    }
    async fn watch(&self, key: &str) -> StoreResult<Watch> {
        self.inner.watch(key).await
    }
    async fn exec(&self, watches: &[Watch], ops: Vec<WriteOp>) -> StoreResult<()> {
        let racing = watches.iter().find(|w| w.key.starts_with("tally:flow:"));
        if let Some(watch) = racing {
            if self.always_conflict.load(Ordering::SeqCst) {
                return Err(StoreError::Conflict);
            }
            let race = self
                .races_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if race {
                // Another writer rewrites the same values in between.
                let current = self.inner.hash_get_all(&watch.key).await?;
                let fields: Vec<(String, String)> = if current.is_empty() {
                    vec![("PV".to_string(), "0".to_string())]
                } else {
                    current.into_iter().collect()
                };
                self.inner
                    .exec(
                        &[],
                        vec![WriteOp::HashSet {
                            key: watch.key.clone(),
                            fields,
                        }],
                    )
                    .await?;
            }
        }
        self.inner.exec(watches, ops).await
    }
}

#[tokio::test]
async fn lost_races_are_retried_without_double_counting() {
    let racing: Arc<std::sync::OnceLock<Arc<RacingStore>>> = Arc::new(std::sync::OnceLock::new());
    let slot = Arc::clone(&racing);
    let h = harness_with(Config::default(), move |inner| {
        let store = Arc::new(RacingStore::new(inner, 5));
        let _ = slot.set(Arc::clone(&store));
        store as Arc<dyn SharedStore>
    });

    for _ in 0..3 {
        h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    }
    h.aggregator.flush_everything().await;
    h.handle(view("https://news.example/a", "v2", "10.0.0.2")).await;
    h.aggregator.flush_everything().await;

    let store = racing.get().expect("racing store");
    assert_eq!(store.races_left.load(Ordering::SeqCst), 0);
    let counters = flow(&h.store, day(), "https://news.example/a").await;
    assert_eq!(counters.pv, 4);
    assert_eq!(counters.uv, 2);
    assert_eq!(counters.ip, 2);
}

#[tokio::test]
async fn exhausted_merge_requeues_the_original_delta() {
    let racing: Arc<std::sync::OnceLock<Arc<RacingStore>>> = Arc::new(std::sync::OnceLock::new());
    let slot = Arc::clone(&racing);
    let config = Config {
        retry: RetryPolicy {
            burst: 2,
            pause: Duration::from_millis(1),
            max_pauses: 1,
            requeue_delay: Duration::from_millis(1),
        },
        ..Config::default()
    };
    let h = harness_with(config, move |inner| {
        let store = Arc::new(RacingStore::new(inner, 0));
        store.always_conflict.store(true, Ordering::SeqCst);
        let _ = slot.set(Arc::clone(&store));
        store as Arc<dyn SharedStore>
    });
    let store = racing.get().expect("racing store");

    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    assert_eq!(h.aggregator.flush_webflows().await, 1);

    assert_eq!(h.aggregator.stats().await.pending_webflows, 1);
    assert_eq!(flow(&h.store, day(), "https://news.example/a").await.pv, 0);

    store.always_conflict.store(false, Ordering::SeqCst);
    h.aggregator.flush_everything().await;
    assert_eq!(h.aggregator.stats().await.pending_webflows, 0);
    let counters = flow(&h.store, day(), "https://news.example/a").await;
    assert_eq!(counters.pv, 2);
    assert_eq!(counters.uv, 1);
}

// ============================================================
// Rollover, snapshots and reads
// ============================================================

#[tokio::test]
async fn rollover_moves_the_day_into_the_durable_store() {
    let h = harness();
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.handle(view("https://news.example/b", "v1", "10.0.0.1")).await;
    h.handle(view("https://news.example/a", "v2", "10.0.0.2")).await;
    h.handle(view("https://news.example/c", "v2", "10.0.0.2")).await;
    h.handle(close("https://news.example/c", "v2", "10.0.0.2", 30)).await;
    h.aggregator.flush_everything().await;

    h.clock.advance(chrono::Duration::days(1));
    let report = h.aggregator.rollover(day()).await;
    assert_eq!(report.webflows, 3);
    assert_eq!(report.browsings, 2);
    assert_eq!(report.failures, 0);

    let a = h
        .db
        .webflow_for(DOMAIN, "https://news.example/a", day())
        .await
        .expect("query")
        .expect("row");
    assert_eq!(a.pv, 2);
    assert_eq!(a.uv, 2);
    let c = h
        .db
        .webflow_for(DOMAIN, "https://news.example/c", day())
        .await
        .expect("query")
        .expect("row");
    assert_eq!(c.duration, 30);

    let v2 = h
        .db
        .browsing_for("v2", DOMAIN, day())
        .await
        .expect("query")
        .expect("row");
    assert_eq!(v2.depth, 2);
    assert_eq!(v2.duration, 30);
    assert_eq!(v2.pageopend, 1);

    assert!(!h.store.exists(&StoreKey::SeenUrls { date: day() }.build()));
    assert!(!h.store.exists(&StoreKey::SeenVisitors { date: day() }.build()));
    assert!(!h.store.exists(
        &StoreKey::Flow {
            date: day(),
            domain: DOMAIN,
            url: "https://news.example/a"
        }
        .build()
    ));
    assert!(!h.store.exists(&StoreKey::Browsing { date: day(), uid: "v1" }.build()));
}

#[tokio::test]
async fn day_aggregates_outlive_midnight_until_rollover() {
    let h = harness();
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.aggregator.flush_everything().await;

    h.clock.advance(chrono::Duration::hours(13));
    assert!(h.store.exists(&StoreKey::SeenUrls { date: day() }.build()));
    assert_eq!(flow(&h.store, day(), "https://news.example/a").await.pv, 1);
}

#[tokio::test]
async fn snapshot_records_live_load_of_registered_domains() {
    let h = harness();
    h.db.register_domain(DOMAIN).await.expect("register");
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.handle(view("https://news.example/b", "v2", "10.0.0.1")).await;
    h.aggregator.flush_realtime().await;

    assert_eq!(h.aggregator.snapshot_realtime().await, 1);
    let snapshots = h
        .db
        .realtime_snapshots_since(DOMAIN, "0000-00-00 00:00")
        .await
        .expect("query");
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].pv, 2);
    assert_eq!(snapshots[0].ip, 1);
    assert_eq!(snapshots[0].uv, 2);
}

#[tokio::test]
async fn todays_top_content_is_sorted_by_page_views() {
    let h = harness();
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    for uid in ["v1", "v2", "v3"] {
        h.handle(view("https://news.example/b", uid, "10.0.0.1")).await;
    }
    h.aggregator.flush_everything().await;

    let top = h
        .aggregator
        .top_content_today(DOMAIN, 10)
        .await
        .expect("top content");
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].url, "https://news.example/b");
    assert_eq!(top[0].pv, 3);
    assert_eq!(top[0].title, "Title of https://news.example/b");
    assert_eq!(top[1].pv, 1);

    let one = h
        .aggregator
        .top_content_today(DOMAIN, 1)
        .await
        .expect("top content");
    assert_eq!(one.len(), 1);
    assert!(h
        .aggregator
        .top_content_today("other.example", 10)
        .await
        .expect("top content")
        .is_empty());
}

#[tokio::test]
async fn page_info_is_recorded_once_per_day() {
    let h = harness();
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    let stored = h
        .db
        .page_info("https://news.example/a")
        .await
        .expect("query")
        .expect("row");
    assert_eq!(stored.title, "Title of https://news.example/a");
    assert_eq!(stored.domain, DOMAIN);
    let key = StoreKey::PageInfo {
        date: day(),
        url: "https://news.example/a",
    }
    .build();
    assert!(h.store.exists(&key));
}

// ============================================================
// Seed counters
// ============================================================

#[tokio::test]
async fn negative_seed_counters_are_ignored() {
    let h = harness();
    let webflow = WebFlow {
        pv: -50,
        uv: -3,
        ip: -1,
        visits: -8,
        duration: -20,
        ..Default::default()
    };
    let seeds = Browsing {
        pv: -7,
        depth: -2,
        visits: -4,
        duration: -9,
        ..Default::default()
    };
    h.handle(seeded_view("https://news.example/a", "v1", webflow, seeds))
        .await;
    h.aggregator.flush_everything().await;

    let counters = flow(&h.store, day(), "https://news.example/a").await;
    assert_eq!(counters.pv, 1);
    assert_eq!(counters.uv, 1);
    assert_eq!(counters.ip, 1);
    assert_eq!(counters.visits, 1);
    assert_eq!(counters.duration, 0);
    let b = browsing(&h.store, day(), "v1").await.expect("browsing");
    assert_eq!(b.pv, 1);
    assert_eq!(b.depth, 1);
    assert_eq!(b.visits, 1);
    assert_eq!(b.duration, 0);
}

#[tokio::test]
async fn huge_seed_counters_saturate_instead_of_panicking() {
    let h = harness();
    for uid in ["v1", "v2"] {
        let webflow = WebFlow {
            pv: i64::MAX,
            ..Default::default()
        };
        let seeds = Browsing {
            pv: i64::MAX,
            ..Default::default()
        };
        h.handle(seeded_view("https://news.example/a", uid, webflow, seeds))
            .await;
    }
    h.aggregator.flush_everything().await;
    h.handle(seeded_view(
        "https://news.example/a",
        "v1",
        WebFlow {
            pv: i64::MAX,
            ..Default::default()
        },
        Browsing::default(),
    ))
    .await;
    h.aggregator.flush_everything().await;

    let counters = flow(&h.store, day(), "https://news.example/a").await;
    assert_eq!(counters.pv, i64::MAX);
    assert_eq!(counters.uv, 2);
    let b = browsing(&h.store, day(), "v1").await.expect("browsing");
    assert_eq!(b.pv, i64::MAX);
}

// ============================================================
// Midnight
// ============================================================

#[tokio::test]
async fn rollover_flushes_deltas_still_in_memory() {
    let h = harness();
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    h.handle(close("https://news.example/a", "v1", "10.0.0.1", 7)).await;
    assert_eq!(h.aggregator.stats().await.pending_webflows, 1);

    h.clock.advance(chrono::Duration::hours(13));
    let report = h.aggregator.rollover(day()).await;
    assert_eq!(report.webflows, 1);
    assert_eq!(report.browsings, 1);
    assert_eq!(report.failures, 0);

    let a = h
        .durable_flow(day(), "https://news.example/a")
        .await
        .expect("row");
    assert_eq!(a.pv, 1);
    assert_eq!(a.duration, 7);
    let v1 = h
        .db
        .browsing_for("v1", DOMAIN, day())
        .await
        .expect("query")
        .expect("row");
    assert_eq!(v1.pv, 1);
    assert_eq!(h.aggregator.stats().await.pending_webflows, 0);
    assert!(!h.store.exists(&StoreKey::SeenUrls { date: day() }.build()));
}

#[tokio::test]
async fn late_deltas_for_a_rolled_day_go_to_the_durable_store() {
    let h = harness();
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;
    let noon = h.clock.now();
    h.clock.advance(chrono::Duration::hours(13));
    h.aggregator.rollover(day()).await;
    assert_eq!(h.aggregator.rolled_through(), Some(day()));

    // A close that was stamped before midnight but merged after the rollover.
    h.clock.set(noon);
    h.handle(close("https://news.example/a", "v1", "10.0.0.1", 11)).await;
    h.clock.advance(chrono::Duration::hours(13));
    h.aggregator.flush_everything().await;

    let a = h
        .durable_flow(day(), "https://news.example/a")
        .await
        .expect("row");
    assert_eq!(a.pv, 1);
    assert_eq!(a.duration, 11);
    let v1 = h
        .db
        .browsing_for("v1", DOMAIN, day())
        .await
        .expect("query")
        .expect("row");
    assert_eq!(v1.duration, 11);
    assert_eq!(v1.pageopend, 0);
    assert!(!h.store.exists(
        &StoreKey::Flow {
            date: day(),
            domain: DOMAIN,
            url: "https://news.example/a"
        }
        .build()
    ));
}

#[tokio::test(start_paused = true)]
async fn rollover_loop_hands_the_day_over_after_midnight() {
    let h = harness();
    h.aggregator.start().await;
    h.handle(view("https://news.example/a", "v1", "10.0.0.1")).await;

    tokio::time::sleep(Duration::from_secs(12 * 60 * 60 + 60)).await;

    assert_eq!(h.aggregator.rolled_through(), Some(day()));
    let a = h
        .durable_flow(day(), "https://news.example/a")
        .await
        .expect("row");
    assert_eq!(a.pv, 1);
    assert!(!h.store.exists(&StoreKey::SeenUrls { date: day() }.build()));
    h.aggregator.shutdown().await;
}

// ============================================================
// Dispatcher lifecycle
// ============================================================

fn submitted(event: IngestEvent) -> PageView {
    let IngestEvent::PageView(view) = event else {
        unreachable!("page view expected")
    };
    *view
}

#[tokio::test]
async fn shutdown_hands_the_day_to_the_durable_store_across_restarts() {
    let clock = Arc::new(ManualClock::at_local_noon(day()));
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    for (run, uid) in [(1, "v1"), (2, "v2")] {
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let aggregator = Aggregator::new(
            Arc::new(Config::default()),
            store.clone(),
            db.clone(),
            clock.clone(),
        );
        aggregator.start().await;
        aggregator
            .submit_page_view(submitted(view("https://news.example/a", uid, "10.0.0.1")))
            .await
            .expect("submit");
        aggregator.shutdown().await;

        let row = db
            .webflow_for(DOMAIN, "https://news.example/a", day())
            .await
            .expect("query")
            .expect("row");
        assert_eq!(row.pv, run);
        assert_eq!(row.uv, run);
        assert!(!store.exists(
            &StoreKey::Flow {
                date: day(),
                domain: DOMAIN,
                url: "https://news.example/a"
            }
            .build()
        ));
    }
}

#[tokio::test]
async fn shutdown_drains_queue_and_flushes() {
    let store = Arc::new(MemoryStore::with_clock(Arc::new(SystemClock)));
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let aggregator = Aggregator::new(
        Arc::new(Config::default()),
        store.clone(),
        db.clone(),
        Arc::new(SystemClock),
    );
    aggregator.start().await;

    for uid in ["v1", "v2", "v3"] {
        aggregator
            .submit_page_view(submitted(view("https://news.example/a", uid, "10.0.0.1")))
            .await
            .expect("submit");
    }
    aggregator.shutdown().await;

    let today = aggregator.today();
    let row = db
        .webflow_for(DOMAIN, "https://news.example/a", today)
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.pv, 3);
    assert_eq!(row.uv, 3);

    let stats = aggregator.stats().await;
    assert_eq!(stats.requests, 3);
    assert_eq!(stats.pending_webflows, 0);

    let rejected = aggregator
        .submit_page_close(PageClose {
            url: "https://news.example/a".to_string(),
            ..Default::default()
        })
        .await;
    assert_eq!(rejected, Err(IngestError::ShuttingDown));
}
