//! Shared-store key naming.
//!
//! Keys look like `tally:<dimension>:<date>[:<identity>...]`. Only the last
//! component is written raw; every earlier component is escaped so it cannot
//! contain `:`, which keeps distinct entities on distinct keys even when URLs
//! or visitor ids contain colons.

use std::fmt;

use chrono::NaiveDate;

pub const PREFIX: &str = "tally";

/// Escape a non-final key component (`%` → `%25`, `:` → `%3A`).
pub fn escape(component: &str) -> String {
    if !component.contains([':', '%']) {
        return component.to_string();
    }
    component.replace('%', "%25").replace(':', "%3A")
}

pub fn unescape(component: &str) -> String {
    if !component.contains('%') {
        return component.to_string();
    }
    component.replace("%3A", ":").replace("%25", "%")
}

/// Every key pagetally reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKey<'a> {
    /// Set of flow members (see [`flow_member`]) seen on `date`.
    SeenUrls { date: NaiveDate },
    /// Set of visitor ids seen on `date`.
    SeenVisitors { date: NaiveDate },
    /// JSON page metadata for a URL, recorded once per day.
    PageInfo { date: NaiveDate, url: &'a str },
    /// Hash of flow counters for one URL on one day.
    Flow {
        date: NaiveDate,
        domain: &'a str,
        url: &'a str,
    },
    /// Hash `domain -> JSON browsing record` for one visitor on one day.
    Browsing { date: NaiveDate, uid: &'a str },
    /// Set of URLs an IP visited on `date`.
    IpVisited { date: NaiveDate, ip: &'a str },
    /// Set of URLs a visitor visited on `date`.
    VisitorVisited { date: NaiveDate, uid: &'a str },
    /// Marker for a visitor's view of a URL within the last 30 minutes.
    RecentVisit {
        date: NaiveDate,
        uid: &'a str,
        url: &'a str,
    },
    /// Set of visitor ids already classified as new/returning for a domain.
    NewVisitorChecked { date: NaiveDate, domain: &'a str },
    /// Scalar count of currently open pages on a domain.
    RealtimePv { domain: &'a str },
    /// Hash `ip -> open pages` for a domain.
    RealtimeIp { domain: &'a str },
    /// Hash `uid -> open pages` for a domain.
    RealtimeUv { domain: &'a str },
}

impl fmt::Display for StoreKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StoreKey::SeenUrls { date } => write!(f, "{PREFIX}:url:{date}"),
            StoreKey::SeenVisitors { date } => write!(f, "{PREFIX}:uid:{date}"),
            StoreKey::PageInfo { date, url } => write!(f, "{PREFIX}:pageinfo:{date}:{url}"),
            StoreKey::Flow { date, domain, url } => {
                write!(f, "{PREFIX}:flow:{date}:{}", flow_member(domain, url))
            }
            StoreKey::Browsing { date, uid } => write!(f, "{PREFIX}:browsing:{date}:{uid}"),
            StoreKey::IpVisited { date, ip } => write!(f, "{PREFIX}:ip:{date}:{ip}"),
            StoreKey::VisitorVisited { date, uid } => write!(f, "{PREFIX}:visitor:{date}:{uid}"),
            StoreKey::RecentVisit { date, uid, url } => {
                write!(f, "{PREFIX}:visit:{date}:{}:{url}", escape(uid))
            }
            StoreKey::NewVisitorChecked { date, domain } => {
                write!(f, "{PREFIX}:newvisitor:{date}:{domain}")
            }
            StoreKey::RealtimePv { domain } => write!(f, "{PREFIX}:rt:pv:{domain}"),
            StoreKey::RealtimeIp { domain } => write!(f, "{PREFIX}:rt:ip:{domain}"),
            StoreKey::RealtimeUv { domain } => write!(f, "{PREFIX}:rt:uv:{domain}"),
        }
    }
}

impl StoreKey<'_> {
    pub fn build(&self) -> String {
        self.to_string()
    }
}

/// Member stored in the day's seen-URL set: the escaped domain, `:`, the URL.
pub fn flow_member(domain: &str, url: &str) -> String {
    format!("{}:{url}", escape(domain))
}

/// Split a seen-URL member back into `(domain, url)`.
pub fn parse_flow_member(member: &str) -> Option<(String, String)> {
    let (domain, url) = member.split_once(':')?;
    if domain.is_empty() || url.is_empty() {
        return None;
    }
    Some((unescape(domain), url.to_string()))
}

/// Pattern (with `*` standing for a seen-URL member) addressing the flow hashes
/// of `date`; used by sorted retrieval over the seen-URL set.
pub fn flow_pattern(date: NaiveDate) -> String {
    format!("{PREFIX}:flow:{date}:*")
}
