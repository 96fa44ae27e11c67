//! Shared key-value store abstraction.
//!
//! The aggregation core talks to the shared store only through
//! [`SharedStore`]. The trait mirrors the primitives of a Redis-like service:
//! scalars, hashes and sets with expiry, plus optimistic transactions built on
//! versioned watches. [`memory::MemoryStore`] is the in-process backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

pub mod memory;

pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Expire at an absolute instant.
    At(DateTime<Utc>),
    /// Expire after a duration measured from the write.
    After(Duration),
}

/// Version token returned by [`SharedStore::watch`].
///
/// A transaction committed with this token aborts with
/// [`StoreError::Conflict`] if the key was written after the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watch {
    pub key: String,
    pub version: u64,
}

/// A single write inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set {
        key: String,
        value: String,
    },
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HashDelete {
        key: String,
        fields: Vec<String>,
    },
    SetAdd {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        expiry: Expiry,
    },
    Delete {
        key: String,
    },
}

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, expiry: Option<Expiry>) -> StoreResult<()>;

    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    /// Set or refresh the expiry of an existing key. Returns `false` if the
    /// key does not exist.
    async fn expire(&self, key: &str, expiry: Expiry) -> StoreResult<bool>;

    /// Read several hash fields; missing fields (or a missing key) are `None`.
    async fn hash_get(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>>;

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hash_len(&self, key: &str) -> StoreResult<u64>;

    /// Add a member to a set. Returns `true` if it was not already present.
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn set_is_member(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn set_card(&self, key: &str) -> StoreResult<u64>;

    /// Remove and return up to `count` arbitrary members.
    async fn set_pop(&self, key: &str, count: usize) -> StoreResult<Vec<String>>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Sort the members of a set by an integer hash field of derived keys.
    ///
    /// For every member, `*` in `weight_pattern` is replaced by the member to
    /// form a hash key whose `field` is the weight (missing = 0). Returns the
    /// members heaviest first, at most `limit` of them (`0` = all).
    async fn sort_by_hash_field(
        &self,
        set_key: &str,
        weight_pattern: &str,
        field: &str,
        limit: usize,
    ) -> StoreResult<Vec<String>>;

    /// Start watching `key` for an optimistic transaction.
    async fn watch(&self, key: &str) -> StoreResult<Watch>;

    /// Apply `ops` atomically if none of the watched keys changed since their
    /// watch; otherwise apply nothing and return [`StoreError::Conflict`].
    async fn exec(&self, watches: &[Watch], ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Whether the data lives only as long as this process. Such a store
    /// loses everything on restart, so shutdown must hand it to the durable
    /// store.
    fn is_process_local(&self) -> bool {
        false
    }
}

/// Parse an integer stored as a string; absent values count as zero.
pub fn parse_count(key: &str, raw: Option<&str>) -> StoreResult<i64> {
    match raw {
        None => Ok(0),
        Some(v) => v.trim().parse().map_err(|_| StoreError::InvalidValue {
            key: key.to_string(),
            value: v.to_string(),
        }),
    }
}
