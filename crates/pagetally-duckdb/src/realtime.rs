use anyhow::Result;

use pagetally_core::model::{RealtimeSnapshot, RegisteredDomain};

use crate::DuckDbBackend;

impl DuckDbBackend {
    pub async fn save_realtime_snapshot(&self, snapshot: &RealtimeSnapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO realtime_webflow (domain, pv, ip, uv, date) VALUES (?1, ?2, ?3, ?4, ?5)",
            duckdb::params![
                snapshot.domain,
                snapshot.pv,
                snapshot.ip,
                snapshot.uv,
                snapshot.date,
            ],
        )?;
        Ok(())
    }

    /// Snapshots of `domain` taken strictly after `since`
    /// (`YYYY-MM-DD HH:MM`), oldest first.
    pub async fn realtime_snapshots_since(
        &self,
        domain: &str,
        since: &str,
    ) -> Result<Vec<RealtimeSnapshot>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT domain, pv, ip, uv, date
               FROM realtime_webflow
               WHERE domain = ?1 AND date > ?2
               ORDER BY date ASC, created_at ASC"#,
        )?;
        let rows = stmt.query_map(duckdb::params![domain, since], |row| {
            Ok(RealtimeSnapshot {
                domain: row.get(0)?,
                pv: row.get(1)?,
                ip: row.get(2)?,
                uv: row.get(3)?,
                date: row.get(4)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Add a domain to the registry. Registering twice is a no-op.
    pub async fn register_domain(&self, domain: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO domain_registry (domain) VALUES (?1) ON CONFLICT (domain) DO NOTHING",
            duckdb::params![domain],
        )?;
        Ok(())
    }

    pub async fn registered_domains(&self) -> Result<Vec<RegisteredDomain>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT domain FROM domain_registry ORDER BY domain")?;
        let rows = stmt.query_map([], |row| {
            Ok(RegisteredDomain {
                domain: row.get(0)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}
