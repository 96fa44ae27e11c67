//! Per-domain open-page counters waiting to be flushed.

use std::collections::HashMap;

use tokio::sync::Mutex;

/// Pending deltas for one family of member counters (IP or visitor):
/// `domain -> member -> delta`.
pub type MemberDeltas = HashMap<String, HashMap<String, i64>>;

/// Local deltas of the live counters. PV, IP and UV each sit behind their
/// own lock.
#[derive(Default)]
pub struct RealtimeCounters {
    pv: Mutex<HashMap<String, i64>>,
    ip: Mutex<MemberDeltas>,
    uv: Mutex<MemberDeltas>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberFamily {
    Ip,
    Uv,
}

impl RealtimeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_pv(&self, domain: &str, delta: i64) {
        let mut pv = self.pv.lock().await;
        let total = pv.entry(domain.to_string()).or_insert(0);
        *total += delta;
        if *total == 0 {
            pv.remove(domain);
        }
    }

    /// Accumulate `delta` for `member`. A member whose pending delta nets to
    /// zero is dropped: there is nothing to send.
    pub async fn add_member(&self, family: MemberFamily, domain: &str, member: &str, delta: i64) {
        let mut deltas = match family {
            MemberFamily::Ip => self.ip.lock().await,
            MemberFamily::Uv => self.uv.lock().await,
        };
        let members = deltas.entry(domain.to_string()).or_default();
        let total = members.entry(member.to_string()).or_insert(0);
        *total += delta;
        if *total == 0 {
            members.remove(member);
        }
        if members.is_empty() {
            deltas.remove(domain);
        }
    }

    /// Count a page opening (`+1`) or closing (`-1`) across all three
    /// families.
    pub async fn record(&self, domain: &str, ip: &str, uid: &str, delta: i64) {
        self.add_pv(domain, delta).await;
        if !ip.is_empty() {
            self.add_member(MemberFamily::Ip, domain, ip, delta).await;
        }
        if !uid.is_empty() {
            self.add_member(MemberFamily::Uv, domain, uid, delta).await;
        }
    }

    pub async fn take_pv(&self) -> HashMap<String, i64> {
        std::mem::take(&mut *self.pv.lock().await)
    }

    pub async fn take_members(&self, family: MemberFamily) -> MemberDeltas {
        match family {
            MemberFamily::Ip => std::mem::take(&mut *self.ip.lock().await),
            MemberFamily::Uv => std::mem::take(&mut *self.uv.lock().await),
        }
    }

    /// Number of domains with pending deltas in any family.
    pub async fn pending_domains(&self) -> usize {
        let mut domains: std::collections::HashSet<String> =
            self.pv.lock().await.keys().cloned().collect();
        domains.extend(self.ip.lock().await.keys().cloned());
        domains.extend(self.uv.lock().await.keys().cloned());
        domains.len()
    }
}
