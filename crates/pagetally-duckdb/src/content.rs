use anyhow::Result;
use chrono::NaiveDate;

use pagetally_core::clock::format_date;
use pagetally_core::model::{PageInfo, TopContent};

use crate::DuckDbBackend;

impl DuckDbBackend {
    /// Store page metadata unless the URL already has a row.
    pub async fn save_page_info(&self, page: &PageInfo) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO page_info (
                   url, domain, title, keywords, description,
                   filetype, publishedtype, pagetype,
                   catalogs, contentid, publishdate, author, source
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
               ON CONFLICT (url) DO NOTHING"#,
            duckdb::params![
                page.url,
                page.domain,
                page.title,
                page.keywords,
                page.description,
                page.filetype,
                page.publishedtype,
                page.pagetype,
                page.catalogs,
                page.contentid,
                page.publishdate,
                page.author,
                page.source,
            ],
        )?;
        Ok(())
    }

    pub async fn page_info(&self, url: &str) -> Result<Option<PageInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT url, domain, title, keywords, description,
                      filetype, publishedtype, pagetype,
                      catalogs, contentid, publishdate, author, source
               FROM page_info WHERE url = ?1"#,
        )?;
        let mut rows = stmt.query_map(duckdb::params![url], |row| {
            Ok(PageInfo {
                url: row.get(0)?,
                domain: row.get(1)?,
                title: row.get(2)?,
                keywords: row.get(3)?,
                description: row.get(4)?,
                filetype: row.get(5)?,
                publishedtype: row.get(6)?,
                pagetype: row.get(7)?,
                catalogs: row.get(8)?,
                contentid: row.get(9)?,
                publishdate: row.get(10)?,
                author: row.get(11)?,
                source: row.get(12)?,
            })
        })?;
        let found = rows.next().transpose()?;
        Ok(found)
    }

    /// Pages of `domain` ranked by total page views over `[start, end]`.
    ///
    /// Titles come from `page_info` and are empty when no metadata was
    /// recorded for a URL.
    pub async fn top_content(
        &self,
        domain: &str,
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    ) -> Result<Vec<TopContent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT f.url,
                      COALESCE(MAX(p.title), '') AS title,
                      SUM(f.pv)::BIGINT AS pv,
                      SUM(f.ip)::BIGINT AS ip,
                      SUM(f.uv)::BIGINT AS uv,
                      SUM(f.visits)::BIGINT AS visits,
                      SUM(f.duration)::BIGINT AS duration
               FROM web_flow f
               LEFT JOIN page_info p ON p.url = f.url
               WHERE f.domain = ?1
                 AND f.date >= CAST(?2 AS DATE)
                 AND f.date <= CAST(?3 AS DATE)
               GROUP BY f.url
               ORDER BY pv DESC, f.url ASC
               LIMIT ?4"#,
        )?;
        let rows = stmt.query_map(
            duckdb::params![domain, format_date(start), format_date(end), limit as i64],
            |row| {
                Ok(TopContent {
                    url: row.get(0)?,
                    title: row.get(1)?,
                    pv: row.get(2)?,
                    ip: row.get(3)?,
                    uv: row.get(4)?,
                    visits: row.get(5)?,
                    duration: row.get(6)?,
                })
            },
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}
