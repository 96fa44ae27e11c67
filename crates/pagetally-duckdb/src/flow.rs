use anyhow::{anyhow, Result};
use chrono::NaiveDate;

use pagetally_core::clock::format_date;
use pagetally_core::model::{Browsing, WebFlow};

use crate::DuckDbBackend;

fn require_date(date: Option<NaiveDate>, what: &str) -> Result<String> {
    date.map(format_date)
        .ok_or_else(|| anyhow!("{what} record has no date"))
}

impl DuckDbBackend {
    /// Add a day's flow counters to the `(domain, url, date)` row, creating it
    /// if it does not exist yet.
    pub async fn merge_webflow(&self, flow: &WebFlow) -> Result<()> {
        let date = require_date(flow.date, "web_flow")?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO web_flow (domain, url, date, pv, ip, uv, visits, duration, bounce)
               VALUES (?1, ?2, CAST(?3 AS DATE), ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT (domain, url, date) DO UPDATE SET
                   pv = web_flow.pv + EXCLUDED.pv,
                   ip = web_flow.ip + EXCLUDED.ip,
                   uv = web_flow.uv + EXCLUDED.uv,
                   visits = web_flow.visits + EXCLUDED.visits,
                   duration = web_flow.duration + EXCLUDED.duration,
                   bounce = web_flow.bounce + EXCLUDED.bounce"#,
            duckdb::params![
                flow.domain,
                flow.url,
                date,
                flow.pv,
                flow.ip,
                flow.uv,
                flow.visits,
                flow.duration,
                flow.bounce,
            ],
        )?;
        Ok(())
    }

    /// Add a visitor's day counters to the `(uid, domain, date)` row.
    ///
    /// `nv` keeps the larger value and `ip` keeps the first non-empty one.
    pub async fn merge_browsing(&self, browsing: &Browsing) -> Result<()> {
        let date = require_date(browsing.date, "browsing")?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO browsing (uid, domain, date, depth, pv, visits, duration, pageopend, nv, ip)
               VALUES (?1, ?2, CAST(?3 AS DATE), ?4, ?5, ?6, ?7, ?8, ?9, ?10)
               ON CONFLICT (uid, domain, date) DO UPDATE SET
                   depth = browsing.depth + EXCLUDED.depth,
                   pv = browsing.pv + EXCLUDED.pv,
                   visits = browsing.visits + EXCLUDED.visits,
                   duration = browsing.duration + EXCLUDED.duration,
                   pageopend = GREATEST(browsing.pageopend + EXCLUDED.pageopend, 0),
                   nv = GREATEST(browsing.nv, EXCLUDED.nv),
                   ip = CASE WHEN browsing.ip = '' THEN EXCLUDED.ip ELSE browsing.ip END"#,
            duckdb::params![
                browsing.uid,
                browsing.domain,
                date,
                browsing.depth,
                browsing.pv,
                browsing.visits,
                browsing.duration,
                browsing.pageopend,
                browsing.nv,
                browsing.ip,
            ],
        )?;
        Ok(())
    }

    /// Whether `uid` has any browsing history on `domain`.
    pub async fn visitor_seen_before(&self, domain: &str, uid: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT COUNT(*) FROM browsing WHERE domain = ?1 AND uid = ?2")?;
        let count: i64 = stmt.query_row(duckdb::params![domain, uid], |row| row.get(0))?;
        Ok(count > 0)
    }

    pub async fn webflow_for(
        &self,
        domain: &str,
        url: &str,
        date: NaiveDate,
    ) -> Result<Option<WebFlow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT pv, ip, uv, visits, duration, bounce
               FROM web_flow
               WHERE domain = ?1 AND url = ?2 AND date = CAST(?3 AS DATE)"#,
        )?;
        let mut rows = stmt.query_map(duckdb::params![domain, url, format_date(date)], |row| {
            Ok(WebFlow {
                domain: domain.to_string(),
                url: url.to_string(),
                date: Some(date),
                pv: row.get(0)?,
                ip: row.get(1)?,
                uv: row.get(2)?,
                visits: row.get(3)?,
                duration: row.get(4)?,
                bounce: row.get(5)?,
            })
        })?;
        let found = rows.next().transpose()?;
        Ok(found)
    }

    pub async fn browsing_for(
        &self,
        uid: &str,
        domain: &str,
        date: NaiveDate,
    ) -> Result<Option<Browsing>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT depth, pv, visits, duration, pageopend, nv, ip
               FROM browsing
               WHERE uid = ?1 AND domain = ?2 AND date = CAST(?3 AS DATE)"#,
        )?;
        let mut rows = stmt.query_map(duckdb::params![uid, domain, format_date(date)], |row| {
            Ok(Browsing {
                uid: uid.to_string(),
                domain: domain.to_string(),
                date: Some(date),
                depth: row.get(0)?,
                pv: row.get(1)?,
                visits: row.get(2)?,
                duration: row.get(3)?,
                pageopend: row.get(4)?,
                nv: row.get(5)?,
                ip: row.get(6)?,
            })
        })?;
        let found = rows.next().transpose()?;
        Ok(found)
    }
}
