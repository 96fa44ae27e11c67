use chrono::NaiveDate;
use pagetally_core::durable::DurableStore;
use pagetally_core::model::{Browsing, PageInfo, RealtimeSnapshot, WebFlow};
use pagetally_duckdb::DuckDbBackend;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).expect("valid date")
}

fn flow(url: &str, date: NaiveDate, pv: i64) -> WebFlow {
    WebFlow {
        domain: "a.example".to_string(),
        url: url.to_string(),
        date: Some(date),
        pv,
        ip: 1,
        uv: 1,
        visits: 1,
        duration: 30,
        bounce: 0,
    }
}

#[tokio::test]
async fn webflow_merge_adds_to_existing_row() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let store: &dyn DurableStore = &db;

    store
        .merge_webflow(&flow("https://a.example/", day(1), 4))
        .await
        .expect("first merge");
    store
        .merge_webflow(&flow("https://a.example/", day(1), 6))
        .await
        .expect("second merge");

    let row = db
        .webflow_for("a.example", "https://a.example/", day(1))
        .await
        .expect("query")
        .expect("row exists");
    assert_eq!(row.pv, 10);
    assert_eq!(row.visits, 2);
    assert_eq!(row.duration, 60);
}

#[tokio::test]
async fn webflow_rows_are_kept_per_day() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    db.merge_webflow(&flow("https://a.example/", day(1), 2))
        .await
        .expect("merge");
    db.merge_webflow(&flow("https://a.example/", day(2), 5))
        .await
        .expect("merge");

    let first = db
        .webflow_for("a.example", "https://a.example/", day(1))
        .await
        .expect("query")
        .expect("row");
    assert_eq!(first.pv, 2);
    let missing = db
        .webflow_for("a.example", "https://a.example/", day(3))
        .await
        .expect("query");
    assert!(missing.is_none());
}

#[tokio::test]
async fn webflow_without_date_is_rejected() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let mut undated = flow("https://a.example/", day(1), 1);
    undated.date = None;
    assert!(db.merge_webflow(&undated).await.is_err());
}

#[tokio::test]
async fn browsing_merge_keeps_new_visitor_flag_and_floors_open_pages() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let first = Browsing {
        uid: "v1".to_string(),
        domain: "a.example".to_string(),
        date: Some(day(1)),
        depth: 2,
        pv: 3,
        visits: 1,
        pageopend: 1,
        nv: 1,
        ip: "10.0.0.1".to_string(),
        ..Default::default()
    };
    let second = Browsing {
        uid: "v1".to_string(),
        domain: "a.example".to_string(),
        date: Some(day(1)),
        pv: 1,
        duration: 45,
        pageopend: -3,
        nv: 0,
        ..Default::default()
    };
    db.merge_browsing(&first).await.expect("merge");
    db.merge_browsing(&second).await.expect("merge");

    let row = db
        .browsing_for("v1", "a.example", day(1))
        .await
        .expect("query")
        .expect("row");
    assert_eq!(row.pv, 4);
    assert_eq!(row.depth, 2);
    assert_eq!(row.duration, 45);
    assert_eq!(row.nv, 1);
    assert_eq!(row.pageopend, 0);
    assert_eq!(row.ip, "10.0.0.1");
}

#[tokio::test]
async fn visitor_history_is_scoped_to_domain() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    assert!(!db.visitor_seen_before("a.example", "v1").await.expect("lookup"));

    db.merge_browsing(&Browsing {
        uid: "v1".to_string(),
        domain: "a.example".to_string(),
        date: Some(day(1)),
        pv: 1,
        ..Default::default()
    })
    .await
    .expect("merge");

    assert!(db.visitor_seen_before("a.example", "v1").await.expect("lookup"));
    assert!(!db.visitor_seen_before("b.example", "v1").await.expect("lookup"));
}

#[tokio::test]
async fn page_info_is_first_or_create() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let page = PageInfo {
        domain: "a.example".to_string(),
        url: "https://a.example/post".to_string(),
        title: "First title".to_string(),
        pagetype: 2,
        ..Default::default()
    };
    db.save_page_info(&page).await.expect("save");
    db.save_page_info(&PageInfo {
        title: "Changed".to_string(),
        ..page.clone()
    })
    .await
    .expect("save again");

    let stored = db
        .page_info("https://a.example/post")
        .await
        .expect("query")
        .expect("row");
    assert_eq!(stored.title, "First title");
    assert_eq!(stored.pagetype, 2);
}

#[tokio::test]
async fn top_content_ranks_by_page_views_over_range() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    db.merge_webflow(&flow("https://a.example/a", day(1), 5))
        .await
        .expect("merge");
    db.merge_webflow(&flow("https://a.example/a", day(2), 5))
        .await
        .expect("merge");
    db.merge_webflow(&flow("https://a.example/b", day(2), 7))
        .await
        .expect("merge");
    db.merge_webflow(&flow("https://a.example/c", day(5), 100))
        .await
        .expect("merge");
    db.save_page_info(&PageInfo {
        domain: "a.example".to_string(),
        url: "https://a.example/b".to_string(),
        title: "B".to_string(),
        ..Default::default()
    })
    .await
    .expect("save");

    let top = db
        .top_content("a.example", day(1), day(3), 10)
        .await
        .expect("query");
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].url, "https://a.example/a");
    assert_eq!(top[0].pv, 10);
    assert_eq!(top[0].title, "");
    assert_eq!(top[1].url, "https://a.example/b");
    assert_eq!(top[1].title, "B");

    let limited = db
        .top_content("a.example", day(1), day(5), 1)
        .await
        .expect("query");
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].url, "https://a.example/c");
}

#[tokio::test]
async fn realtime_snapshots_filter_by_start_minute() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    for (minute, pv) in [("2024-03-01 10:00", 3), ("2024-03-01 10:05", 5)] {
        db.save_realtime_snapshot(&RealtimeSnapshot {
            domain: "a.example".to_string(),
            pv,
            ip: 1,
            uv: 1,
            date: minute.to_string(),
        })
        .await
        .expect("save");
    }

    let after = db
        .realtime_snapshots_since("a.example", "2024-03-01 10:00")
        .await
        .expect("query");
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].pv, 5);

    let other = db
        .realtime_snapshots_since("b.example", "2024-03-01 00:00")
        .await
        .expect("query");
    assert!(other.is_empty());
}

#[tokio::test]
async fn domain_registry_ignores_duplicates() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    db.register_domain("b.example").await.expect("register");
    db.register_domain("a.example").await.expect("register");
    db.register_domain("a.example").await.expect("register again");

    let domains: Vec<String> = DurableStore::registered_domains(&db)
        .await
        .expect("list")
        .into_iter()
        .map(|d| d.domain)
        .collect();
    assert_eq!(domains, vec!["a.example", "b.example"]);
}
