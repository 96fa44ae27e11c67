use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Expiry, SharedStore, StoreResult, Watch, WriteOp};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
    /// Store-wide write counter at this key's last write.
    version: u64,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
            version: 0,
        }
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// How often expired keys are swept out in bulk.
const SWEEP_INTERVAL: chrono::Duration = chrono::Duration::seconds(60);

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Versions come from one counter, so a key deleted and recreated
    /// between watch and exec never gets its old version back.
    next_version: u64,
    next_sweep: Option<DateTime<Utc>>,
}

impl Inner {
    fn bump(&mut self, key: &str) {
        self.next_version += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.version = self.next_version;
        }
    }

    /// Drop every expired key, at most once per [`SWEEP_INTERVAL`].
    fn sweep(&mut self, now: DateTime<Utc>) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        self.entries.retain(|_, e| !e.expired(now));
        self.next_sweep = Some(now + SWEEP_INTERVAL);
    }

    /// Drop `key` if it has expired at `now`.
    fn purge(&mut self, key: &str, now: DateTime<Utc>) {
        if self.entries.get(key).is_some_and(|e| e.expired(now)) {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut Entry> {
        self.purge(key, now);
        self.entries.get_mut(key)
    }

    /// Version of a live key; absent keys are version 0.
    fn version(&mut self, key: &str, now: DateTime<Utc>) -> u64 {
        self.live(key, now).map(|e| e.version).unwrap_or(0)
    }

    fn hash_mut(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<&mut HashMap<String, String>> {
        self.purge(key, now);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(h) => Ok(h),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_mut(&mut self, key: &str, now: DateTime<Utc>) -> StoreResult<&mut HashSet<String>> {
        self.purge(key, now);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
        match &mut entry.value {
            Value::Set(s) => Ok(s),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Remove a hash or set that became empty, the way Redis does.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(h)) => h.is_empty(),
            Some(Value::Set(s)) => s.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn apply(&mut self, op: WriteOp, now: DateTime<Utc>) -> StoreResult<()> {
        match op {
            WriteOp::Set { key, value } => {
                self.entries.insert(key.clone(), Entry::new(Value::Str(value)));
                self.bump(&key);
            }
            WriteOp::HashSet { key, fields } => {
                let hash = self.hash_mut(&key, now)?;
                hash.extend(fields);
                self.drop_if_empty(&key);
                self.bump(&key);
            }
            WriteOp::HashDelete { key, fields } => {
                if let Some(entry) = self.live(&key, now) {
                    match &mut entry.value {
                        Value::Hash(h) => {
                            for f in &fields {
                                h.remove(f);
                            }
                        }
                        _ => return Err(StoreError::WrongType(key)),
                    }
                    self.drop_if_empty(&key);
                    self.bump(&key);
                }
            }
            WriteOp::SetAdd { key, member } => {
                let added = self.set_mut(&key, now)?.insert(member);
                if added {
                    self.bump(&key);
                }
            }
            WriteOp::Expire { key, expiry } => {
                let at = resolve(expiry, now);
                if let Some(entry) = self.live(&key, now) {
                    entry.expires_at = Some(at);
                    self.bump(&key);
                }
            }
            WriteOp::Delete { key } => {
                self.entries.remove(&key);
            }
        }
        Ok(())
    }
}

fn resolve(expiry: Expiry, now: DateTime<Utc>) -> DateTime<Utc> {
    match expiry {
        Expiry::At(at) => at,
        Expiry::After(d) => {
            now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
        }
    }
}

/// In-process [`SharedStore`] with Redis-like semantics.
///
/// Expiry is evaluated against the injected [`Clock`]: a key reads as gone
/// once expired, and expired keys are swept out in bulk on later calls.
/// Every write bumps the key's version, which is what watches compare
/// against. A watch on an absent key only notices a key that still exists
/// at exec time.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock and sweep expired keys if a sweep is due.
    fn lock_at(&self, now: DateTime<Utc>) -> MutexGuard<'_, Inner> {
        let mut inner = self.lock();
        inner.sweep(now);
        inner
    }

    /// Expiry instant of a live key, if it has one.
    pub fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.lock().live(key, now).and_then(|e| e.expires_at)
    }

    pub fn exists(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.lock().live(key, now).is_some()
    }

    /// Number of keys held in memory, expired ones not yet swept included.
    pub fn held_keys(&self) -> usize {
        self.lock().entries.len()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let keys: Vec<String> = inner.entries.keys().cloned().collect();
        for key in keys {
            inner.purge(&key, now);
        }
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();
        match self.lock_at(now).live(key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, expiry: Option<Expiry>) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock_at(now);
        inner.apply(
            WriteOp::Set {
                key: key.to_string(),
                value: value.to_string(),
            },
            now,
        )?;
        if let Some(expiry) = expiry {
            inner.apply(
                WriteOp::Expire {
                    key: key.to_string(),
                    expiry,
                },
                now,
            )?;
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock_at(now);
        for key in keys {
            inner.apply(WriteOp::Delete { key: key.clone() }, now)?;
        }
        Ok(())
    }

    async fn expire(&self, key: &str, expiry: Expiry) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut inner = self.lock_at(now);
        if inner.live(key, now).is_none() {
            return Ok(false);
        }
        inner.apply(
            WriteOp::Expire {
                key: key.to_string(),
                expiry,
            },
            now,
        )?;
        Ok(true)
    }

    async fn hash_get(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>> {
        let now = self.clock.now();
        match self.lock_at(now).live(key, now).map(|e| &e.value) {
            None => Ok(vec![None; fields.len()]),
            Some(Value::Hash(h)) => Ok(fields.iter().map(|f| h.get(*f).cloned()).collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let now = self.clock.now();
        match self.lock_at(now).live(key, now).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hash_len(&self, key: &str) -> StoreResult<u64> {
        let now = self.clock.now();
        match self.lock_at(now).live(key, now).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Hash(h)) => Ok(h.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut inner = self.lock_at(now);
        let added = inner.set_mut(key, now)?.insert(member.to_string());
        if added {
            inner.bump(key);
        }
        Ok(added)
    }

    async fn set_is_member(&self, key: &str, member: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        match self.lock_at(now).live(key, now).map(|e| &e.value) {
            None => Ok(false),
            Some(Value::Set(s)) => Ok(s.contains(member)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_card(&self, key: &str) -> StoreResult<u64> {
        let now = self.clock.now();
        match self.lock_at(now).live(key, now).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Set(s)) => Ok(s.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_pop(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        let now = self.clock.now();
        let mut inner = self.lock_at(now);
        let popped: Vec<String> = match inner.live(key, now).map(|e| &mut e.value) {
            None => return Ok(Vec::new()),
            Some(Value::Set(s)) => {
                let picked: Vec<String> = s.iter().take(count).cloned().collect();
                for m in &picked {
                    s.remove(m);
                }
                picked
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        if !popped.is_empty() {
            inner.drop_if_empty(key);
            inner.bump(key);
        }
        Ok(popped)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now();
        match self.lock_at(now).live(key, now).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn sort_by_hash_field(
        &self,
        set_key: &str,
        weight_pattern: &str,
        field: &str,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let members = self.set_members(set_key).await?;
        let now = self.clock.now();
        let mut inner = self.lock_at(now);
        let mut weighted: Vec<(i64, String)> = members
            .into_iter()
            .map(|m| {
                let weight_key = weight_pattern.replace('*', &m);
                let weight = match inner.live(&weight_key, now).map(|e| &e.value) {
                    Some(Value::Hash(h)) => h
                        .get(field)
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(0),
                    _ => 0,
                };
                (weight, m)
            })
            .collect();
        weighted.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let take = if limit == 0 { weighted.len() } else { limit };
        Ok(weighted.into_iter().take(take).map(|(_, m)| m).collect())
    }

    async fn watch(&self, key: &str) -> StoreResult<Watch> {
        let now = self.clock.now();
        let version = self.lock_at(now).version(key, now);
        Ok(Watch {
            key: key.to_string(),
            version,
        })
    }

    async fn exec(&self, watches: &[Watch], ops: Vec<WriteOp>) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock_at(now);
        for w in watches {
            if inner.version(&w.key, now) != w.version {
                return Err(StoreError::Conflict);
            }
        }
        for op in ops {
            inner.apply(op, now)?;
        }
        Ok(())
    }

    fn is_process_local(&self) -> bool {
        true
    }
}
