//! Aggregate records and their merge rules.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A record that can absorb another partial record for the same identity.
///
/// Absorbing is the only way aggregates change: numeric fields add, so
/// absorbing deltas in any order yields the same totals.
pub trait Absorb {
    type Key: std::hash::Hash + Eq + Clone + Send + std::fmt::Debug + 'static;

    fn key(&self) -> Self::Key;
    fn absorb(&mut self, delta: &Self);
}

/// Traffic counters for one URL on one calendar day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebFlow {
    #[serde(alias = "dm")]
    pub domain: String,
    pub url: String,
    pub date: Option<NaiveDate>,
    pub pv: i64,
    pub ip: i64,
    pub uv: i64,
    pub visits: i64,
    /// Seconds spent on the page.
    pub duration: i64,
    pub bounce: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub url: String,
    pub date: Option<NaiveDate>,
}

/// Numeric part of a [`WebFlow`], as kept in the shared store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    pub pv: i64,
    pub ip: i64,
    pub uv: i64,
    pub visits: i64,
    pub duration: i64,
    pub bounce: i64,
}

impl FlowCounters {
    pub const FIELDS: [&'static str; 6] = ["PV", "IP", "UV", "Visits", "Duration", "Bounce"];

    pub fn from_values(values: [i64; 6]) -> Self {
        let [pv, ip, uv, visits, duration, bounce] = values;
        Self {
            pv,
            ip,
            uv,
            visits,
            duration,
            bounce,
        }
    }

    pub fn values(&self) -> [i64; 6] {
        [
            self.pv,
            self.ip,
            self.uv,
            self.visits,
            self.duration,
            self.bounce,
        ]
    }

    pub fn plus(self, other: FlowCounters) -> FlowCounters {
        let a = self.values();
        let b = other.values();
        let mut sum = [0i64; 6];
        for (i, slot) in sum.iter_mut().enumerate() {
            *slot = a[i].saturating_add(b[i]);
        }
        FlowCounters::from_values(sum)
    }
}

impl WebFlow {
    pub fn counters(&self) -> FlowCounters {
        FlowCounters {
            pv: self.pv,
            ip: self.ip,
            uv: self.uv,
            visits: self.visits,
            duration: self.duration,
            bounce: self.bounce,
        }
    }

    /// Client-sent seed counters with negative values dropped to zero.
    pub fn without_negative_counters(self) -> Self {
        let c = self.counters();
        self.with_counters(FlowCounters::from_values(c.values().map(|v| v.max(0))))
    }

    pub fn with_counters(mut self, c: FlowCounters) -> Self {
        self.pv = c.pv;
        self.ip = c.ip;
        self.uv = c.uv;
        self.visits = c.visits;
        self.duration = c.duration;
        self.bounce = c.bounce;
        self
    }
}

impl Absorb for WebFlow {
    type Key = FlowKey;

    fn key(&self) -> FlowKey {
        FlowKey {
            url: self.url.clone(),
            date: self.date,
        }
    }

    fn absorb(&mut self, delta: &Self) {
        let sum = self.counters().plus(delta.counters());
        *self = std::mem::take(self).with_counters(sum);
        if self.domain.is_empty() && !delta.domain.is_empty() {
            self.domain = delta.domain.clone();
        }
    }
}

/// Behaviour counters for one visitor on one calendar day on one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Browsing {
    pub uid: String,
    pub domain: String,
    pub date: Option<NaiveDate>,
    /// Distinct URLs visited.
    pub depth: i64,
    pub pv: i64,
    pub visits: i64,
    pub duration: i64,
    /// Pages currently open; +1 per view, -1 per close.
    pub pageopend: i64,
    /// 1 when the visitor was first seen on this domain today.
    pub nv: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrowsingKey {
    pub uid: String,
    pub date: Option<NaiveDate>,
    pub domain: String,
}

impl Absorb for Browsing {
    type Key = BrowsingKey;

    fn key(&self) -> BrowsingKey {
        BrowsingKey {
            uid: self.uid.clone(),
            date: self.date,
            domain: self.domain.clone(),
        }
    }

    fn absorb(&mut self, delta: &Self) {
        self.depth = self.depth.saturating_add(delta.depth);
        self.pv = self.pv.saturating_add(delta.pv);
        self.visits = self.visits.saturating_add(delta.visits);
        self.duration = self.duration.saturating_add(delta.duration);
        self.pageopend = self.pageopend.saturating_add(delta.pageopend);
        self.nv = self.nv.max(delta.nv);
        if self.domain.is_empty() && !delta.domain.is_empty() {
            self.domain = delta.domain.clone();
        }
        if self.ip.is_empty() && !delta.ip.is_empty() {
            self.ip = delta.ip.clone();
        }
    }
}

impl Browsing {
    /// Client-sent seed counters with negative values dropped to zero and
    /// `nv` kept to 0 or 1.
    pub fn without_negative_counters(mut self) -> Self {
        for counter in [
            &mut self.depth,
            &mut self.pv,
            &mut self.visits,
            &mut self.duration,
            &mut self.pageopend,
        ] {
            *counter = (*counter).max(0);
        }
        self.nv = self.nv.clamp(0, 1);
        self
    }

    /// Numeric merge used against the stored copy in the shared store.
    /// `pageopend` never persists below zero.
    pub fn merged_with_stored(&self, stored: &Browsing) -> Browsing {
        let mut merged = stored.clone();
        merged.uid = self.uid.clone();
        merged.date = self.date;
        merged.domain = self.domain.clone();
        merged.absorb(self);
        merged.pageopend = merged.pageopend.max(0);
        merged
    }
}

/// Page metadata sent by the tracking script with every page view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageInfo {
    #[serde(rename = "dm")]
    pub domain: String,
    pub url: String,
    pub title: String,
    pub keywords: String,
    pub description: String,
    pub filetype: i8,
    pub publishedtype: i8,
    pub pagetype: i8,
    pub catalogs: String,
    pub contentid: String,
    pub publishdate: String,
    pub author: String,
    pub source: String,
}

/// One sample of a domain's live load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeSnapshot {
    pub domain: String,
    pub pv: i64,
    pub ip: i64,
    pub uv: i64,
    /// Local time, `YYYY-MM-DD HH:MM`.
    pub date: String,
}

/// One row of a "most viewed pages" ranking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopContent {
    pub url: String,
    pub title: String,
    pub pv: i64,
    pub ip: i64,
    pub uv: i64,
    pub visits: i64,
    pub duration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredDomain {
    pub domain: String,
}
