/// DuckDB initialization SQL.
///
/// Executed once at database open time via `Connection::execute_batch`.
/// All statements use `IF NOT EXISTS` so they are safe to re-run on every
/// startup.
///
/// `memory_limit` comes from `Config.duckdb_memory_limit`
/// (env `PAGETALLY_DUCKDB_MEMORY`, default `"1GB"`). Always set an explicit
/// limit: the DuckDB default (80% of system RAM) is not acceptable for a
/// server process.
///
/// The natural keys of `web_flow` and `browsing` are primary keys so the
/// rollover can merge with `INSERT ... ON CONFLICT DO UPDATE`. Each merge runs
/// as its own statement; DuckDB rejects touching the same key twice in one
/// transaction.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- WEB FLOW (one row per url per day)
-- ===========================================
CREATE TABLE IF NOT EXISTS web_flow (
    domain          VARCHAR NOT NULL,
    url             VARCHAR NOT NULL,
    date            DATE NOT NULL,
    pv              BIGINT NOT NULL DEFAULT 0,
    ip              BIGINT NOT NULL DEFAULT 0,
    uv              BIGINT NOT NULL DEFAULT 0,
    visits          BIGINT NOT NULL DEFAULT 0,
    duration        BIGINT NOT NULL DEFAULT 0,   -- seconds
    bounce          BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (domain, url, date)
);

-- ===========================================
-- BROWSING (one row per visitor per domain per day)
-- ===========================================
CREATE TABLE IF NOT EXISTS browsing (
    uid             VARCHAR NOT NULL,
    domain          VARCHAR NOT NULL,
    date            DATE NOT NULL,
    depth           BIGINT NOT NULL DEFAULT 0,
    pv              BIGINT NOT NULL DEFAULT 0,
    visits          BIGINT NOT NULL DEFAULT 0,
    duration        BIGINT NOT NULL DEFAULT 0,
    pageopend       BIGINT NOT NULL DEFAULT 0,
    nv              BIGINT NOT NULL DEFAULT 0,   -- 1 = first seen that day
    ip              VARCHAR NOT NULL DEFAULT '',
    PRIMARY KEY (uid, domain, date)
);

-- ===========================================
-- REALTIME SNAPSHOTS (written by the snapshot ticker)
-- ===========================================
CREATE TABLE IF NOT EXISTS realtime_webflow (
    domain          VARCHAR NOT NULL,
    pv              BIGINT NOT NULL,
    ip              BIGINT NOT NULL,
    uv              BIGINT NOT NULL,
    date            VARCHAR NOT NULL,            -- local 'YYYY-MM-DD HH:MM'
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_realtime_domain_date ON realtime_webflow(domain, date);

-- ===========================================
-- DOMAIN REGISTRY
-- ===========================================
CREATE TABLE IF NOT EXISTS domain_registry (
    domain          VARCHAR PRIMARY KEY,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- ===========================================
-- PAGE INFO (first-or-create by url)
-- ===========================================
CREATE TABLE IF NOT EXISTS page_info (
    url             VARCHAR PRIMARY KEY,
    domain          VARCHAR NOT NULL,
    title           VARCHAR NOT NULL DEFAULT '',
    keywords        VARCHAR NOT NULL DEFAULT '',
    description     VARCHAR NOT NULL DEFAULT '',
    filetype        TINYINT NOT NULL DEFAULT 0,
    publishedtype   TINYINT NOT NULL DEFAULT 0,
    pagetype        TINYINT NOT NULL DEFAULT 0,
    catalogs        VARCHAR NOT NULL DEFAULT '',
    contentid       VARCHAR NOT NULL DEFAULT '',
    publishdate     VARCHAR NOT NULL DEFAULT '',
    author          VARCHAR NOT NULL DEFAULT '',
    source          VARCHAR NOT NULL DEFAULT '',
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#
    )
}
