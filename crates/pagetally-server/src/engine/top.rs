use std::collections::HashMap;

use pagetally_core::keys::{flow_pattern, parse_flow_member, StoreKey};
use pagetally_core::model::{FlowCounters, PageInfo, TopContent};
use pagetally_core::store::{parse_count, StoreResult};

use super::Aggregator;

impl Aggregator {
    /// Today's most viewed pages of `domain`, read live from the shared
    /// store (the durable store only has finished days).
    pub async fn top_content_today(&self, domain: &str, limit: usize) -> StoreResult<Vec<TopContent>> {
        let date = self.clock.today();
        let members = self
            .store
            .sort_by_hash_field(
                &StoreKey::SeenUrls { date }.build(),
                &flow_pattern(date),
                "PV",
                0,
            )
            .await?;

        let mut top = Vec::new();
        for member in members {
            if top.len() >= limit {
                break;
            }
            let Some((member_domain, url)) = parse_flow_member(&member) else {
                continue;
            };
            if member_domain != domain {
                continue;
            }
            let key = StoreKey::Flow {
                date,
                domain,
                url: &url,
            }
            .build();
            let stored = self.store.hash_get(&key, &FlowCounters::FIELDS).await?;
            let mut values = [0i64; 6];
            for (slot, raw) in values.iter_mut().zip(stored.iter()) {
                *slot = parse_count(&key, raw.as_deref())?;
            }
            let counters = FlowCounters::from_values(values);

            let title = match self
                .store
                .get(&StoreKey::PageInfo { date, url: &url }.build())
                .await?
            {
                Some(raw) => serde_json::from_str::<PageInfo>(&raw)
                    .map(|page| page.title)
                    .unwrap_or_default(),
                None => String::new(),
            };

            top.push(TopContent {
                url,
                title,
                pv: counters.pv,
                ip: counters.ip,
                uv: counters.uv,
                visits: counters.visits,
                duration: counters.duration,
            });
        }
        Ok(top)
    }
}

/// Combine today's live rows with rows already settled in the durable store
/// (written by a rollover at shutdown or by late deltas). Counters of the
/// same URL are summed; ranking is by page views, then URL.
pub fn merge_top_content(
    live: Vec<TopContent>,
    settled: Vec<TopContent>,
    limit: usize,
) -> Vec<TopContent> {
    let mut by_url: HashMap<String, TopContent> = HashMap::new();
    for row in live.into_iter().chain(settled) {
        match by_url.get_mut(&row.url) {
            Some(acc) => {
                acc.pv = acc.pv.saturating_add(row.pv);
                acc.ip = acc.ip.saturating_add(row.ip);
                acc.uv = acc.uv.saturating_add(row.uv);
                acc.visits = acc.visits.saturating_add(row.visits);
                acc.duration = acc.duration.saturating_add(row.duration);
                if acc.title.is_empty() {
                    acc.title = row.title;
                }
            }
            None => {
                by_url.insert(row.url.clone(), row);
            }
        }
    }
    let mut merged: Vec<TopContent> = by_url.into_values().collect();
    merged.sort_by(|a, b| b.pv.cmp(&a.pv).then_with(|| a.url.cmp(&b.url)));
    merged.truncate(limit);
    merged
}
