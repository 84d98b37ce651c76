//! Thread-Safe Keyspace with Expiry Support
//!
//! This module implements the in-memory store behind every command. A key
//! holds exactly one [`Value`]: a string, a list, or a hash. Any key may
//! also carry an expiry deadline on the monotonic clock.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                StorageEngine                  │
//! │  ┌─────────────────────────────────────────┐  │
//! │  │            Mutex<Keyspace>              │  │
//! │  │  entries: HashMap<Bytes, Value>         │  │
//! │  │  expires: HashMap<Bytes, Instant>       │  │
//! │  └─────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Every public operation takes the one lock exactly once, so operations are
//! linearizable and cross-key operations (`rename`, `flush`, snapshot
//! export) always see a consistent keyspace. Sharding the lock by key hash
//! would raise throughput, but those cross-key operations would then need
//! to lock every shard.
//!
//! ## Expiry
//!
//! A key is expired once `deadline <= now`. Every access checks this first
//! and evicts the key (lazy expiry); [`StorageEngine::cleanup_expired`]
//! applies the same predicate to the whole keyspace for the background
//! sweeper.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest time to live a key can be given (100 years).
///
/// Every deadline within this bound is representable on the monotonic
/// clock and as Unix milliseconds in a snapshot.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(Bytes),
    /// Deque for O(1) push/pop on both ends
    List(VecDeque<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
}

impl Value {
    pub fn key_type(&self) -> KeyType {
        match self {
            Value::String(_) => KeyType::String,
            Value::List(_) => KeyType::List,
            Value::Hash(_) => KeyType::Hash,
        }
    }
}

/// The type of value a key holds, as reported by `TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    String,
    List,
    Hash,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::List => "list",
            KeyType::Hash => "hash",
        }
    }
}

/// Failures reported by type-specific and key-requiring operations.
///
/// The display strings are the error replies sent to clients.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR index out of range")]
    IndexOutOfRange,

    #[error("ERR invalid expire time")]
    InvalidExpireTime,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One live key as captured for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub key: Bytes,
    pub value: Value,
    pub expires_at: Option<Instant>,
}

/// Keyspace statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    /// Keys currently stored (including expired ones not yet evicted)
    pub keys: usize,
    /// Keys carrying an expiry deadline
    pub volatile_keys: usize,
    /// Total keys evicted by expiry since startup
    pub expired: u64,
}

#[inline]
fn is_due(deadline: Instant, now: Instant) -> bool {
    deadline <= now
}

/// Everything guarded by the store lock.
#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<Bytes, Value>,
    /// Only ever holds keys present in `entries`
    expires: HashMap<Bytes, Instant>,
    expired_total: u64,
}

impl Keyspace {
    /// Removes a key and its deadline.
    fn remove(&mut self, key: &[u8]) -> Option<Value> {
        self.expires.remove(key);
        self.entries.remove(key)
    }

    /// Evicts `key` if its deadline has passed.
    fn purge_if_due(&mut self, key: &[u8], now: Instant) {
        if let Some(&deadline) = self.expires.get(key) {
            if is_due(deadline, now) {
                self.remove(key);
                self.expired_total += 1;
            }
        }
    }

    /// Evicts every key whose deadline has passed.
    fn purge_all_due(&mut self, now: Instant) -> u64 {
        let due: Vec<Bytes> = self
            .expires
            .iter()
            .filter(|(_, &deadline)| is_due(deadline, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &due {
            self.remove(key);
        }

        let count = due.len() as u64;
        self.expired_total += count;
        count
    }

    /// The live value of `key`, after the lazy expiry check.
    fn live(&mut self, key: &[u8]) -> Option<&Value> {
        self.purge_if_due(key, Instant::now());
        self.entries.get(key)
    }

    fn live_mut(&mut self, key: &[u8]) -> Option<&mut Value> {
        self.purge_if_due(key, Instant::now());
        self.entries.get_mut(key)
    }

    fn list(&mut self, key: &[u8]) -> StorageResult<Option<&VecDeque<Bytes>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(StorageError::WrongType),
        }
    }

    fn list_mut(&mut self, key: &[u8]) -> StorageResult<Option<&mut VecDeque<Bytes>>> {
        match self.live_mut(key) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(StorageError::WrongType),
        }
    }

    /// The list at `key`, created empty if the key is absent.
    fn list_or_create(&mut self, key: Bytes) -> StorageResult<&mut VecDeque<Bytes>> {
        self.purge_if_due(&key, Instant::now());
        match self
            .entries
            .entry(key)
            .or_insert_with(|| Value::List(VecDeque::new()))
        {
            Value::List(list) => Ok(list),
            _ => Err(StorageError::WrongType),
        }
    }

    fn hash(&mut self, key: &[u8]) -> StorageResult<Option<&HashMap<Bytes, Bytes>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(StorageError::WrongType),
        }
    }

    fn hash_or_create(&mut self, key: Bytes) -> StorageResult<&mut HashMap<Bytes, Bytes>> {
        self.purge_if_due(&key, Instant::now());
        match self
            .entries
            .entry(key)
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(hash) => Ok(hash),
            _ => Err(StorageError::WrongType),
        }
    }
}

/// Resolves a possibly negative list index against `len`.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let actual = if index < 0 { len + index } else { index };
    (0..len).contains(&actual).then_some(actual as usize)
}

/// The shared in-memory store.
///
/// Wrap it in an `Arc` and hand clones to the dispatcher, the expiry
/// sweeper and the snapshot manager.
///
/// # Example
///
/// ```
/// use snapkv::storage::StorageEngine;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("name"), Bytes::from("Ariz"));
/// assert_eq!(engine.get(b"name"), Some(Bytes::from("Ariz")));
///
/// engine.rpush(Bytes::from("queue"), vec![Bytes::from("job")]).unwrap();
/// assert_eq!(engine.llen(b"queue"), Ok(1));
///
/// assert!(engine.expire(b"name", Duration::from_secs(60)).unwrap());
/// ```
#[derive(Debug, Default)]
pub struct StorageEngine {
    keyspace: Mutex<Keyspace>,
}

impl StorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the store lock. A panic while holding it cannot leave a
    /// half-applied operation behind, so a poisoned lock is reused.
    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // KEY OPERATIONS
    // ========================================================================

    /// Removes every key and every expiry.
    pub fn flush(&self) {
        let mut ks = self.keyspace();
        ks.entries.clear();
        ks.expires.clear();
    }

    /// Returns the live keys matching a glob pattern.
    ///
    /// Supported patterns:
    /// - `*` matches any sequence, `?` any single byte
    /// - `[ae]`, `[a-z]`, `[^a]` character classes
    /// - `\x` matches `x` literally
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let mut ks = self.keyspace();
        ks.purge_all_due(Instant::now());
        ks.entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect()
    }

    /// Returns the type of a live key.
    pub fn key_type(&self, key: &[u8]) -> Option<KeyType> {
        self.keyspace().live(key).map(Value::key_type)
    }

    /// Deletes a key of any type.
    ///
    /// Returns `true` if a live key was removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        let mut ks = self.keyspace();
        ks.purge_if_due(key, Instant::now());
        ks.remove(key).is_some()
    }

    /// Deletes several keys under one lock acquisition.
    pub fn delete_many(&self, keys: &[Bytes]) -> u64 {
        let mut ks = self.keyspace();
        let now = Instant::now();
        keys.iter()
            .filter(|key| {
                ks.purge_if_due(key, now);
                ks.remove(key).is_some()
            })
            .count() as u64
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.keyspace().live(key).is_some()
    }

    /// Counts how many of the given keys are live.
    pub fn exists_many(&self, keys: &[Bytes]) -> u64 {
        let mut ks = self.keyspace();
        keys.iter().filter(|key| ks.live(key).is_some()).count() as u64
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let ks = self.keyspace();
        let now = Instant::now();
        let due = ks
            .expires
            .values()
            .filter(|&&deadline| is_due(deadline, now))
            .count();
        ks.entries.len() - due
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets a deadline `ttl` from now on an existing key.
    ///
    /// A zero `ttl` makes the key due immediately. Returns `Ok(false)` if the
    /// key does not exist, and `InvalidExpireTime` if `ttl` exceeds
    /// [`MAX_TTL`].
    pub fn expire(&self, key: &[u8], ttl: Duration) -> StorageResult<bool> {
        if ttl > MAX_TTL {
            return Err(StorageError::InvalidExpireTime);
        }
        let mut ks = self.keyspace();
        let now = Instant::now();
        let deadline = now
            .checked_add(ttl)
            .ok_or(StorageError::InvalidExpireTime)?;
        ks.purge_if_due(key, now);

        let Some(stored_key) = ks.entries.get_key_value(key).map(|(k, _)| k.clone()) else {
            return Ok(false);
        };
        ks.expires.insert(stored_key, deadline);
        Ok(true)
    }

    /// Removes the deadline from a key.
    ///
    /// Returns `true` if the key existed and had a deadline.
    pub fn persist(&self, key: &[u8]) -> bool {
        let mut ks = self.keyspace();
        ks.purge_if_due(key, Instant::now());
        ks.expires.remove(key).is_some()
    }

    /// Remaining time to live in whole seconds.
    ///
    /// - `Some(seconds)` if the key exists and has a deadline
    /// - `Some(-1)` if the key exists without a deadline
    /// - `None` if the key doesn't exist
    pub fn ttl(&self, key: &[u8]) -> Option<i64> {
        let mut ks = self.keyspace();
        let now = Instant::now();
        ks.purge_if_due(key, now);

        if !ks.entries.contains_key(key) {
            return None;
        }
        Some(match ks.expires.get(key) {
            Some(&deadline) => deadline.saturating_duration_since(now).as_secs() as i64,
            None => -1,
        })
    }

    /// Moves the value, type and deadline of `old` to `new`.
    ///
    /// Whatever `new` held before is discarded.
    pub fn rename(&self, old: &[u8], new: Bytes) -> StorageResult<()> {
        let mut ks = self.keyspace();
        ks.purge_if_due(old, Instant::now());

        let deadline = ks.expires.get(old).copied();
        let value = ks.remove(old).ok_or(StorageError::NoSuchKey)?;

        ks.remove(&new);
        if let Some(deadline) = deadline {
            ks.expires.insert(new.clone(), deadline);
        }
        ks.entries.insert(new, value);
        Ok(())
    }

    /// Evicts every expired key.
    ///
    /// Called by the background expiry sweeper; returns the number of keys
    /// removed.
    pub fn cleanup_expired(&self) -> u64 {
        self.keyspace().purge_all_due(Instant::now())
    }

    pub fn stats(&self) -> StorageStats {
        let ks = self.keyspace();
        StorageStats {
            keys: ks.entries.len(),
            volatile_keys: ks.expires.len(),
            expired: ks.expired_total,
        }
    }

    // ========================================================================
    // STRING OPERATIONS
    // ========================================================================

    /// Stores a string, replacing any value of any type and clearing its
    /// deadline.
    pub fn set(&self, key: Bytes, value: Bytes) {
        let mut ks = self.keyspace();
        ks.expires.remove(&key);
        ks.entries.insert(key, Value::String(value));
    }

    /// Returns the string stored at `key`.
    ///
    /// Absent, expired and non-string keys all read as `None`.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        match self.keyspace().live(key) {
            Some(Value::String(value)) => Some(value.clone()),
            _ => None,
        }
    }

    // ========================================================================
    // LIST OPERATIONS
    // ========================================================================

    /// Pushes values one by one onto the head of a list, creating it if
    /// needed. `LPUSH key a b c` leaves `c` at the head.
    ///
    /// Returns the length of the list after the push.
    pub fn lpush(&self, key: Bytes, values: Vec<Bytes>) -> StorageResult<usize> {
        let mut ks = self.keyspace();
        let list = ks.list_or_create(key)?;
        for value in values {
            list.push_front(value);
        }
        Ok(list.len())
    }

    /// Pushes values onto the tail of a list, creating it if needed.
    pub fn rpush(&self, key: Bytes, values: Vec<Bytes>) -> StorageResult<usize> {
        let mut ks = self.keyspace();
        let list = ks.list_or_create(key)?;
        list.extend(values);
        Ok(list.len())
    }

    /// Removes and returns the head of a list.
    pub fn lpop(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.pop(key, VecDeque::pop_front)
    }

    /// Removes and returns the tail of a list.
    pub fn rpop(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.pop(key, VecDeque::pop_back)
    }

    fn pop(
        &self,
        key: &[u8],
        take: fn(&mut VecDeque<Bytes>) -> Option<Bytes>,
    ) -> StorageResult<Option<Bytes>> {
        let mut ks = self.keyspace();
        let (value, now_empty) = match ks.list_mut(key)? {
            Some(list) => {
                let value = take(list);
                (value, list.is_empty())
            }
            None => return Ok(None),
        };

        // Empty lists are never kept
        if now_empty {
            ks.remove(key);
        }
        Ok(value)
    }

    /// Length of a list, 0 if absent.
    pub fn llen(&self, key: &[u8]) -> StorageResult<usize> {
        Ok(self.keyspace().list(key)?.map_or(0, VecDeque::len))
    }

    /// Element at `index`; negative indices count from the tail.
    pub fn lindex(&self, key: &[u8], index: i64) -> StorageResult<Option<Bytes>> {
        let mut ks = self.keyspace();
        Ok(ks
            .list(key)?
            .and_then(|list| resolve_index(index, list.len()).map(|i| list[i].clone())))
    }

    /// Inclusive range of elements; indices are clamped to the list.
    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> StorageResult<Vec<Bytes>> {
        let mut ks = self.keyspace();
        let list = match ks.list(key)? {
            Some(list) => list,
            None => return Ok(Vec::new()),
        };

        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(list
            .range(start as usize..=stop as usize)
            .cloned()
            .collect())
    }

    /// Overwrites the element at `index`.
    pub fn lset(&self, key: &[u8], index: i64, value: Bytes) -> StorageResult<()> {
        let mut ks = self.keyspace();
        let list = ks.list_mut(key)?.ok_or(StorageError::NoSuchKey)?;
        let i = resolve_index(index, list.len()).ok_or(StorageError::IndexOutOfRange)?;
        list[i] = value;
        Ok(())
    }

    /// Removes elements equal to `value`.
    ///
    /// - count > 0: up to `count` matches, scanning head to tail
    /// - count < 0: up to `|count|` matches, scanning tail to head
    /// - count = 0: every match
    ///
    /// Returns the number of removed elements.
    pub fn lrem(&self, key: &[u8], count: i64, value: &[u8]) -> StorageResult<usize> {
        let mut ks = self.keyspace();
        let list = match ks.list_mut(key)? {
            Some(list) => list,
            None => return Ok(0),
        };

        let limit = if count == 0 {
            usize::MAX
        } else {
            usize::try_from(count.unsigned_abs()).unwrap_or(usize::MAX)
        };

        let mut removed = 0usize;
        if count >= 0 {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                }
            }
        }

        if list.is_empty() {
            ks.remove(key);
        }
        Ok(removed)
    }

    // ========================================================================
    // HASH OPERATIONS
    // ========================================================================

    /// Sets a hash field, creating the hash if needed.
    ///
    /// Returns `true` if the field is new.
    pub fn hset(&self, key: Bytes, field: Bytes, value: Bytes) -> StorageResult<bool> {
        let mut ks = self.keyspace();
        Ok(ks.hash_or_create(key)?.insert(field, value).is_none())
    }

    /// Sets several fields at once; nothing is written on a type error.
    pub fn hmset(&self, key: Bytes, pairs: Vec<(Bytes, Bytes)>) -> StorageResult<()> {
        let mut ks = self.keyspace();
        ks.hash_or_create(key)?.extend(pairs);
        Ok(())
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> StorageResult<Option<Bytes>> {
        let mut ks = self.keyspace();
        Ok(ks.hash(key)?.and_then(|hash| hash.get(field).cloned()))
    }

    pub fn hexists(&self, key: &[u8], field: &[u8]) -> StorageResult<bool> {
        let mut ks = self.keyspace();
        Ok(ks.hash(key)?.is_some_and(|hash| hash.contains_key(field)))
    }

    /// Removes a field; the hash is deleted once its last field goes.
    pub fn hdel(&self, key: &[u8], field: &[u8]) -> StorageResult<bool> {
        let mut ks = self.keyspace();
        let (removed, now_empty) = match ks.live_mut(key) {
            None => return Ok(false),
            Some(Value::Hash(hash)) => (hash.remove(field).is_some(), hash.is_empty()),
            Some(_) => return Err(StorageError::WrongType),
        };

        if now_empty {
            ks.remove(key);
        }
        Ok(removed)
    }

    /// All field/value pairs of a hash, in unspecified order.
    pub fn hgetall(&self, key: &[u8]) -> StorageResult<Vec<(Bytes, Bytes)>> {
        let mut ks = self.keyspace();
        Ok(ks.hash(key)?.map_or_else(Vec::new, |hash| {
            hash.iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect()
        }))
    }

    pub fn hkeys(&self, key: &[u8]) -> StorageResult<Vec<Bytes>> {
        let mut ks = self.keyspace();
        Ok(ks
            .hash(key)?
            .map_or_else(Vec::new, |hash| hash.keys().cloned().collect()))
    }

    pub fn hvals(&self, key: &[u8]) -> StorageResult<Vec<Bytes>> {
        let mut ks = self.keyspace();
        Ok(ks
            .hash(key)?
            .map_or_else(Vec::new, |hash| hash.values().cloned().collect()))
    }

    pub fn hlen(&self, key: &[u8]) -> StorageResult<usize> {
        Ok(self.keyspace().hash(key)?.map_or(0, HashMap::len))
    }

    // ========================================================================
    // SNAPSHOT SUPPORT
    // ========================================================================

    /// Captures every live key, value and deadline under one lock
    /// acquisition.
    pub fn export_snapshot(&self) -> Vec<SnapshotRecord> {
        let ks = self.keyspace();
        let now = Instant::now();
        ks.entries
            .iter()
            .filter_map(|(key, value)| {
                let expires_at = ks.expires.get(key).copied();
                if expires_at.is_some_and(|deadline| is_due(deadline, now)) {
                    return None;
                }
                Some(SnapshotRecord {
                    key: key.clone(),
                    value: value.clone(),
                    expires_at,
                })
            })
            .collect()
    }

    /// Replaces the whole keyspace with `records`.
    ///
    /// Records whose deadline has already passed, and empty lists or hashes,
    /// are skipped.
    pub fn import_snapshot(&self, records: Vec<SnapshotRecord>) {
        let now = Instant::now();
        let mut entries = HashMap::with_capacity(records.len());
        let mut expires = HashMap::new();

        for record in records {
            let empty = match &record.value {
                Value::String(_) => false,
                Value::List(list) => list.is_empty(),
                Value::Hash(hash) => hash.is_empty(),
            };
            if empty || record.expires_at.is_some_and(|deadline| is_due(deadline, now)) {
                continue;
            }
            if let Some(deadline) = record.expires_at {
                expires.insert(record.key.clone(), deadline);
            }
            entries.insert(record.key, record.value);
        }

        let mut ks = self.keyspace();
        ks.entries = entries;
        ks.expires = expires;
    }
}

/// Glob matcher used by `KEYS`.
///
/// Iterative: on a mismatch it resumes from the most recent `*`, letting
/// that star absorb one more byte. Each pattern token matches exactly one
/// byte, so remembering only the last star is enough and the cost stays
/// `O(pattern * text)`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Pattern position after the last star, and the text position it has
    // absorbed up to
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if pattern.get(p) == Some(&b'*') {
            p += 1;
            star = Some((p, t));
            continue;
        }

        if p < pattern.len() {
            let (matched, next) = match_token(pattern, p, text[t]);
            if matched {
                p = next;
                t += 1;
                continue;
            }
        }

        match star {
            Some((after_star, absorbed)) => {
                p = after_star;
                t = absorbed + 1;
                star = Some((after_star, t));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&b| b == b'*')
}

/// Matches the single-byte token at `pattern[p]` against `c`.
///
/// Returns whether it matched and where the next token starts.
fn match_token(pattern: &[u8], p: usize, c: u8) -> (bool, usize) {
    match pattern[p] {
        b'?' => (true, p + 1),
        b'[' => {
            let negate = pattern.get(p + 1) == Some(&b'^');
            let class_start = if negate { p + 2 } else { p + 1 };
            // An unterminated class never matches
            let Some(close) = pattern[class_start..].iter().position(|&b| b == b']') else {
                return (false, pattern.len());
            };
            let members = &pattern[class_start..class_start + close];

            let mut matched = false;
            let mut i = 0;
            while i < members.len() {
                if i + 2 < members.len() && members[i + 1] == b'-' {
                    matched |= (members[i]..=members[i + 2]).contains(&c);
                    i += 3;
                } else {
                    matched |= members[i] == c;
                    i += 1;
                }
            }

            (matched != negate, class_start + close + 1)
        }
        b'\\' if p + 1 < pattern.len() => (pattern[p + 1] == c, p + 2),
        literal => (literal == c, p + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    fn list_of(items: &[&str]) -> Vec<Bytes> {
        items.iter().map(|s| b(s)).collect()
    }

    #[test]
    fn test_set_and_get() {
        let engine = StorageEngine::new();

        engine.set(b("key"), b("value"));
        assert_eq!(engine.get(b"key"), Some(b("value")));
        assert_eq!(engine.key_type(b"key"), Some(KeyType::String));
    }

    #[test]
    fn test_get_nonexistent() {
        let engine = StorageEngine::new();
        assert_eq!(engine.get(b"nonexistent"), None);
        assert_eq!(engine.key_type(b"nonexistent"), None);
    }

    #[test]
    fn test_get_on_list_reads_as_absent() {
        let engine = StorageEngine::new();
        engine.rpush(b("list"), list_of(&["a"])).unwrap();
        assert_eq!(engine.get(b"list"), None);
    }

    #[test]
    fn test_set_replaces_other_types_and_clears_expiry() {
        let engine = StorageEngine::new();

        engine.hset(b("key"), b("f"), b("v")).unwrap();
        engine.expire(b"key", Duration::from_secs(100)).unwrap();
        engine.set(b("key"), b("plain"));

        assert_eq!(engine.key_type(b"key"), Some(KeyType::String));
        assert_eq!(engine.ttl(b"key"), Some(-1));
        assert_eq!(engine.hlen(b"key"), Err(StorageError::WrongType));
    }

    #[test]
    fn test_delete_removes_every_type() {
        let engine = StorageEngine::new();

        engine.set(b("s"), b("v"));
        engine.rpush(b("l"), list_of(&["a"])).unwrap();
        engine.hset(b("h"), b("f"), b("v")).unwrap();
        engine.expire(b"s", Duration::from_secs(100)).unwrap();

        assert!(engine.delete(b"s"));
        assert!(engine.delete(b"l"));
        assert!(engine.delete(b"h"));
        assert!(!engine.delete(b"s"));

        assert_eq!(engine.get(b"s"), None);
        assert_eq!(engine.llen(b"l"), Ok(0));
        assert_eq!(engine.hget(b"h", b"f"), Ok(None));
        assert_eq!(engine.stats().volatile_keys, 0);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_delete_many_and_exists_many() {
        let engine = StorageEngine::new();
        engine.set(b("k1"), b("v"));
        engine.set(b("k2"), b("v"));

        assert_eq!(engine.exists_many(&[b("k1"), b("k2"), b("k3")]), 2);
        assert_eq!(engine.delete_many(&[b("k1"), b("k3")]), 1);
        assert!(!engine.exists(b"k1"));
        assert!(engine.exists(b"k2"));
    }

    #[test]
    fn test_expiry() {
        let engine = StorageEngine::new();

        engine.set(b("key"), b("value"));
        assert!(engine.expire(b"key", Duration::from_millis(50)).unwrap());
        assert!(engine.exists(b"key"));

        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(engine.get(b"key"), None);
        assert_eq!(engine.key_type(b"key"), None);
        assert_eq!(engine.stats().expired, 1);
    }

    #[test]
    fn test_expire_zero_is_immediate() {
        let engine = StorageEngine::new();

        engine.set(b("key"), b("value"));
        assert!(engine.expire(b"key", Duration::ZERO).unwrap());

        assert_eq!(engine.get(b"key"), None);
        assert!(engine.keys(b"*").is_empty());
    }

    #[test]
    fn test_expire_missing_key() {
        let engine = StorageEngine::new();
        assert!(!engine.expire(b"missing", Duration::from_secs(10)).unwrap());
        assert_eq!(engine.stats().volatile_keys, 0);
    }

    #[test]
    fn test_expire_beyond_max_ttl() {
        let engine = StorageEngine::new();
        engine.set(b("key"), b("value"));

        assert_eq!(
            engine.expire(b"key", Duration::from_secs(u64::MAX)),
            Err(StorageError::InvalidExpireTime)
        );
        assert_eq!(
            engine.expire(b"key", MAX_TTL + Duration::from_secs(1)),
            Err(StorageError::InvalidExpireTime)
        );
        assert_eq!(engine.ttl(b"key"), Some(-1));

        assert_eq!(engine.expire(b"key", MAX_TTL), Ok(true));
        let ttl = engine.ttl(b"key").unwrap();
        assert!(ttl > MAX_TTL.as_secs() as i64 - 5, "ttl was {}", ttl);
    }

    #[test]
    fn test_ttl_and_persist() {
        let engine = StorageEngine::new();

        assert_eq!(engine.ttl(b"nonexistent"), None);

        engine.set(b("key"), b("value"));
        assert_eq!(engine.ttl(b"key"), Some(-1));
        assert!(!engine.persist(b"key"));

        engine.expire(b"key", Duration::from_secs(100)).unwrap();
        let ttl = engine.ttl(b"key").unwrap();
        assert!(ttl > 0 && ttl <= 100);

        assert!(engine.persist(b"key"));
        assert_eq!(engine.ttl(b"key"), Some(-1));
    }

    #[test]
    fn test_rename_moves_value_and_expiry() {
        let engine = StorageEngine::new();

        engine.rpush(b("old"), list_of(&["a", "b"])).unwrap();
        engine.expire(b"old", Duration::from_secs(100)).unwrap();
        engine.set(b("new"), b("overwritten"));

        assert_eq!(engine.rename(b"old", b("new")), Ok(()));

        assert!(!engine.exists(b"old"));
        assert_eq!(engine.key_type(b"new"), Some(KeyType::List));
        assert_eq!(engine.lrange(b"new", 0, -1), Ok(list_of(&["a", "b"])));
        assert!(engine.ttl(b"new").unwrap() > 0);
        assert_eq!(engine.stats().volatile_keys, 1);
    }

    #[test]
    fn test_rename_missing_key() {
        let engine = StorageEngine::new();
        engine.set(b("new"), b("kept"));

        assert_eq!(engine.rename(b"old", b("new")), Err(StorageError::NoSuchKey));
        assert_eq!(engine.get(b"new"), Some(b("kept")));
    }

    #[test]
    fn test_rename_onto_itself() {
        let engine = StorageEngine::new();
        engine.set(b("key"), b("value"));

        assert_eq!(engine.rename(b"key", b("key")), Ok(()));
        assert_eq!(engine.get(b"key"), Some(b("value")));
    }

    #[test]
    fn test_keys_pattern() {
        let engine = StorageEngine::new();

        engine.set(b("hello"), b("1"));
        engine.set(b("hallo"), b("2"));
        engine.rpush(b("hxllo"), list_of(&["3"])).unwrap();
        engine.hset(b("world"), b("f"), b("4")).unwrap();

        assert_eq!(engine.keys(b"*").len(), 4);
        assert_eq!(engine.keys(b"h*llo").len(), 3);
        assert_eq!(engine.keys(b"h[ae]llo").len(), 2);
        assert_eq!(engine.keys(b"w?rld"), vec![b("world")]);
    }

    #[test]
    fn test_flush() {
        let engine = StorageEngine::new();

        engine.set(b("key1"), b("value1"));
        engine.rpush(b("key2"), list_of(&["a"])).unwrap();
        engine.expire(b"key1", Duration::from_secs(100)).unwrap();

        engine.flush();

        assert!(engine.is_empty());
        assert_eq!(engine.stats().volatile_keys, 0);
    }

    #[test]
    fn test_cleanup_expired() {
        let engine = StorageEngine::new();

        engine.set(b("key1"), b("value1"));
        engine.rpush(b("key2"), list_of(&["a"])).unwrap();
        engine.set(b("key3"), b("value3"));
        engine.expire(b"key1", Duration::from_millis(10)).unwrap();
        engine.expire(b"key2", Duration::from_millis(10)).unwrap();

        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(engine.len(), 1);
        assert_eq!(engine.cleanup_expired(), 2);
        assert_eq!(engine.stats().keys, 1);
        assert!(engine.exists(b"key3"));
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let engine = Arc::new(StorageEngine::new());
        let mut handles = vec![];

        for i in 0..10 {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    let key = Bytes::from(format!("key-{}-{}", i, j));
                    engine.set(key.clone(), key.clone());
                    assert_eq!(engine.get(&key), Some(key));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.len(), 1000);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"h*llo", b"hello"));
        assert!(glob_match(b"h*llo", b"hllo"));
        assert!(!glob_match(b"h*llo", b"world"));

        assert!(glob_match(b"h?llo", b"hallo"));
        assert!(!glob_match(b"h?llo", b"hllo"));

        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"h[a-e]llo", b"hcllo"));
        assert!(!glob_match(b"h[^e]llo", b"hello"));
        assert!(glob_match(b"h\\*llo", b"h*llo"));
        assert!(!glob_match(b"h\\*llo", b"hello"));
    }

    #[test]
    fn test_glob_match_many_stars_is_linear() {
        let text = vec![b'a'; 64];
        let pattern = b"*a*a*a*a*a*a*a*a*a*a*a*a*a*a*a*a*a*a*a*a*b";

        let started = Instant::now();
        assert!(!glob_match(pattern, &text));
        assert!(started.elapsed() < Duration::from_millis(100));

        assert!(glob_match(b"*a*a*a*a", &text));
        assert!(glob_match(b"a*[a-c]?*a", &text));
        assert!(!glob_match(b"[", b"["));
        assert!(glob_match(b"**", b""));
    }

    // ========================================================================
    // List Operation Tests
    // ========================================================================

    #[test]
    fn test_lpush_rpush() {
        let engine = StorageEngine::new();

        assert_eq!(engine.lpush(b("mylist"), list_of(&["a"])), Ok(1));
        assert_eq!(engine.lpush(b("mylist"), list_of(&["b"])), Ok(2));
        assert_eq!(engine.rpush(b("mylist"), list_of(&["c"])), Ok(3));
        assert_eq!(engine.lrange(b"mylist", 0, -1), Ok(list_of(&["b", "a", "c"])));

        assert_eq!(engine.lpush(b("mylist"), list_of(&["x", "y"])), Ok(5));
        assert_eq!(engine.lindex(b"mylist", 0), Ok(Some(b("y"))));
        assert_eq!(engine.lindex(b"mylist", 1), Ok(Some(b("x"))));
    }

    #[test]
    fn test_push_onto_wrong_type() {
        let engine = StorageEngine::new();
        engine.set(b("key"), b("value"));

        assert_eq!(engine.lpush(b("key"), list_of(&["a"])), Err(StorageError::WrongType));
        assert_eq!(engine.get(b"key"), Some(b("value")));
    }

    #[test]
    fn test_lpop_rpop() {
        let engine = StorageEngine::new();

        assert_eq!(engine.lpop(b"mylist"), Ok(None));
        assert_eq!(engine.rpop(b"mylist"), Ok(None));

        engine.rpush(b("mylist"), list_of(&["a", "b", "c"])).unwrap();

        assert_eq!(engine.lpop(b"mylist"), Ok(Some(b("a"))));
        assert_eq!(engine.rpop(b"mylist"), Ok(Some(b("c"))));
        assert_eq!(engine.lpop(b"mylist"), Ok(Some(b("b"))));

        // Empty lists are deleted along with their expiry
        assert!(!engine.exists(b"mylist"));
        assert_eq!(engine.llen(b"mylist"), Ok(0));
    }

    #[test]
    fn test_pop_last_element_drops_expiry() {
        let engine = StorageEngine::new();
        engine.rpush(b("mylist"), list_of(&["a"])).unwrap();
        engine.expire(b"mylist", Duration::from_secs(100)).unwrap();

        engine.lpop(b"mylist").unwrap();
        assert_eq!(engine.stats().volatile_keys, 0);
    }

    #[test]
    fn test_lindex() {
        let engine = StorageEngine::new();
        engine.rpush(b("mylist"), list_of(&["a", "b", "c"])).unwrap();

        assert_eq!(engine.lindex(b"mylist", 0), Ok(Some(b("a"))));
        assert_eq!(engine.lindex(b"mylist", 2), Ok(Some(b("c"))));
        assert_eq!(engine.lindex(b"mylist", -1), Ok(Some(b("c"))));
        assert_eq!(engine.lindex(b"mylist", -3), Ok(Some(b("a"))));

        assert_eq!(engine.lindex(b"mylist", 3), Ok(None));
        assert_eq!(engine.lindex(b"mylist", -4), Ok(None));
        assert_eq!(engine.lindex(b"missing", 0), Ok(None));
    }

    #[test]
    fn test_lrange() {
        let engine = StorageEngine::new();
        engine
            .rpush(b("mylist"), list_of(&["a", "b", "c", "d", "e"]))
            .unwrap();

        assert_eq!(engine.lrange(b"mylist", 1, 3), Ok(list_of(&["b", "c", "d"])));
        assert_eq!(engine.lrange(b"mylist", -3, -1), Ok(list_of(&["c", "d", "e"])));
        assert_eq!(
            engine.lrange(b"mylist", -100, 100),
            Ok(list_of(&["a", "b", "c", "d", "e"]))
        );
        assert_eq!(engine.lrange(b"mylist", 3, 1), Ok(vec![]));
        assert_eq!(engine.lrange(b"missing", 0, -1), Ok(vec![]));
    }

    #[test]
    fn test_lset() {
        let engine = StorageEngine::new();
        engine.rpush(b("mylist"), list_of(&["a", "b", "c"])).unwrap();

        assert_eq!(engine.lset(b"mylist", 1, b("B")), Ok(()));
        assert_eq!(engine.lset(b"mylist", -1, b("C")), Ok(()));
        assert_eq!(engine.lrange(b"mylist", 0, -1), Ok(list_of(&["a", "B", "C"])));

        assert_eq!(
            engine.lset(b"mylist", 10, b("X")),
            Err(StorageError::IndexOutOfRange)
        );
        assert_eq!(
            engine.lset(b"nonexistent", 0, b("X")),
            Err(StorageError::NoSuchKey)
        );
    }

    #[test]
    fn test_lrem() {
        let engine = StorageEngine::new();

        engine
            .rpush(b("mylist"), list_of(&["a", "b", "a", "c", "a", "d"]))
            .unwrap();
        assert_eq!(engine.lrem(b"mylist", 2, b"a"), Ok(2));
        assert_eq!(engine.lrange(b"mylist", 0, -1), Ok(list_of(&["b", "c", "a", "d"])));

        engine.flush();
        engine
            .rpush(b("mylist"), list_of(&["a", "b", "a", "c", "a"]))
            .unwrap();
        assert_eq!(engine.lrem(b"mylist", -1, b"a"), Ok(1));
        assert_eq!(engine.lrange(b"mylist", 0, -1), Ok(list_of(&["a", "b", "a", "c"])));
        assert_eq!(engine.lrem(b"mylist", -5, b"a"), Ok(2));
        assert_eq!(engine.lrange(b"mylist", 0, -1), Ok(list_of(&["b", "c"])));

        engine.flush();
        engine.rpush(b("mylist"), list_of(&["a", "x", "a"])).unwrap();
        assert_eq!(engine.lrem(b"mylist", 0, b"a"), Ok(2));
        assert_eq!(engine.lrem(b"mylist", 0, b"x"), Ok(1));
        assert!(!engine.exists(b"mylist"));
    }

    // ========================================================================
    // Hash Operation Tests
    // ========================================================================

    #[test]
    fn test_hset_hget() {
        let engine = StorageEngine::new();

        assert_eq!(engine.hset(b("user"), b("name"), b("Ariz")), Ok(true));
        assert_eq!(engine.hset(b("user"), b("name"), b("Ariz K")), Ok(false));
        assert_eq!(engine.hget(b"user", b"name"), Ok(Some(b("Ariz K"))));
        assert_eq!(engine.hget(b"user", b"age"), Ok(None));
        assert_eq!(engine.key_type(b"user"), Some(KeyType::Hash));
    }

    #[test]
    fn test_hash_listing() {
        let engine = StorageEngine::new();
        engine
            .hmset(b("user"), vec![(b("name"), b("Ariz")), (b("lang"), b("rust"))])
            .unwrap();

        assert_eq!(engine.hlen(b"user"), Ok(2));
        assert_eq!(engine.hexists(b"user", b"lang"), Ok(true));

        let mut fields = engine.hkeys(b"user").unwrap();
        fields.sort();
        assert_eq!(fields, list_of(&["lang", "name"]));

        let mut values = engine.hvals(b"user").unwrap();
        values.sort();
        assert_eq!(values, list_of(&["Ariz", "rust"]));

        let mut pairs = engine.hgetall(b"user").unwrap();
        pairs.sort();
        assert_eq!(pairs, vec![(b("lang"), b("rust")), (b("name"), b("Ariz"))]);
    }

    #[test]
    fn test_hdel_removes_empty_hash() {
        let engine = StorageEngine::new();
        engine.hset(b("user"), b("name"), b("Ariz")).unwrap();

        assert_eq!(engine.hdel(b"user", b"missing"), Ok(false));
        assert_eq!(engine.hdel(b"user", b"name"), Ok(true));
        assert!(!engine.exists(b"user"));
    }

    #[test]
    fn test_hmset_on_wrong_type_writes_nothing() {
        let engine = StorageEngine::new();
        engine.rpush(b("key"), list_of(&["a"])).unwrap();

        assert_eq!(
            engine.hmset(b("key"), vec![(b("f"), b("v"))]),
            Err(StorageError::WrongType)
        );
        assert_eq!(engine.lrange(b"key", 0, -1), Ok(list_of(&["a"])));
    }

    // ========================================================================
    // Snapshot Support Tests
    // ========================================================================

    #[test]
    fn test_export_skips_expired_keys() {
        let engine = StorageEngine::new();
        engine.set(b("live"), b("v"));
        engine.set(b("dead"), b("v"));
        engine.expire(b"dead", Duration::ZERO).unwrap();

        let records = engine.export_snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b("live"));
    }

    #[test]
    fn test_import_replaces_contents() {
        let engine = StorageEngine::new();
        engine.set(b("stale"), b("v"));

        let past = Instant::now();
        engine.import_snapshot(vec![
            SnapshotRecord {
                key: b("s"),
                value: Value::String(b("v")),
                expires_at: Some(Instant::now() + Duration::from_secs(100)),
            },
            SnapshotRecord {
                key: b("gone"),
                value: Value::String(b("v")),
                expires_at: Some(past),
            },
        ]);

        assert!(!engine.exists(b"stale"));
        assert!(!engine.exists(b"gone"));
        assert_eq!(engine.get(b"s"), Some(b("v")));
        assert!(engine.ttl(b"s").unwrap() > 0);
        assert_eq!(engine.stats().keys, 1);
    }
}
