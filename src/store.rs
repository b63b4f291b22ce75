//! Storage capability for bucket state.
//!
//! A [`BucketStore`] owns every bucket. The coordinator never caches state between
//! requests; all reads and writes go through [`BucketStore::try_consume`], which must be
//! atomic per [`BucketKey`] across every process sharing the store.

use crate::bucket::{withdraw, BucketState, ConsumeRequest, Withdrawal};
use crate::clock::Timestamp;
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default prefix for bucket keys.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// Store keys holding one identity's bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Key of the token count.
    pub tokens: String,
    /// Key of the last refill timestamp.
    pub timestamp: String,
}

impl BucketKey {
    /// Keys for `identity` under `prefix`: `{prefix}:{identity}:tokens` and `{prefix}:{identity}:ts`.
    ///
    /// The identity is embedded verbatim; it is only a grouping key.
    pub fn derive(prefix: &str, identity: &str) -> Self {
        Self {
            tokens: format!("{prefix}:{identity}:tokens"),
            timestamp: format!("{prefix}:{identity}:ts"),
        }
    }
}

/// Shared store able to withdraw tokens atomically.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Refill the bucket at `key` and withdraw `request.cost` tokens in one atomic step.
    ///
    /// On success the token count and timestamp are written and both keys expire after
    /// `request.expiry()`. On [`Withdrawal::Denied`] nothing is written.
    async fn try_consume(
        &self,
        key: &BucketKey,
        request: &ConsumeRequest,
    ) -> Result<Withdrawal, StoreError>;

    /// Whether the store is usable right now, as far as the client already knows.
    ///
    /// Must not perform I/O. Returning `false` makes the coordinator skip the store call.
    fn is_available(&self) -> bool {
        true
    }
}

#[async_trait]
impl<S> BucketStore for Arc<S>
where
    S: BucketStore + ?Sized,
{
    async fn try_consume(
        &self,
        key: &BucketKey,
        request: &ConsumeRequest,
    ) -> Result<Withdrawal, StoreError> {
        (**self).try_consume(key, request).await
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: BucketState,
    expires_at: Timestamp,
}

/// Bucket count that always triggers a sweep, whatever the time since the last one.
const SWEEP_MIN_LEN: usize = 1024;

#[derive(Debug, Default)]
struct Buckets {
    // Keyed by `BucketKey::tokens`; the timestamp lives in the same entry.
    entries: HashMap<String, Entry>,
    next_sweep: Option<Timestamp>,
    sweep_len: usize,
}

impl Buckets {
    fn live(&self, key: &BucketKey, now: Timestamp) -> Option<BucketState> {
        self.entries.get(&key.tokens).filter(|e| e.expires_at > now).map(|e| e.state)
    }

    fn purge(&mut self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    /// Drop expired buckets once per expiry period, or early when the map has doubled.
    fn sweep_if_due(&mut self, now: Timestamp, period: Duration) {
        let overdue = self.next_sweep.map_or(true, |at| now >= at);
        if !overdue && self.entries.len() < self.sweep_len.max(SWEEP_MIN_LEN) {
            return;
        }
        self.purge(now);
        self.next_sweep = Some(now + period);
        self.sweep_len = self.entries.len().saturating_mul(2);
    }
}

/// Process-local bucket store.
///
/// Same semantics as a shared store, with atomicity from a single mutex. Expiry is
/// checked against the request time on every read, and expired buckets are swept out of
/// memory during withdrawals at least once per expiry period. Only suitable when one
/// process does all the admitting. Clones share the same buckets.
#[derive(Default, Clone, Debug)]
pub struct InMemoryBucketStore {
    data: Arc<Mutex<Buckets>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the store.
    ///
    /// While offline, `is_available` is false and `try_consume` fails with
    /// [`StoreError::Unavailable`]. Stored buckets are kept.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Current state of a bucket, if it exists and has not expired at `now`.
    pub fn bucket(&self, key: &BucketKey, now: Timestamp) -> Option<BucketState> {
        self.data.lock().expect("bucket store poisoned").live(key, now)
    }

    /// Drop every bucket expired at `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: Timestamp) -> usize {
        self.data.lock().expect("bucket store poisoned").purge(now)
    }

    /// Number of stored buckets, expired or not.
    pub fn len(&self) -> usize {
        self.data.lock().expect("bucket store poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn try_consume(
        &self,
        key: &BucketKey,
        request: &ConsumeRequest,
    ) -> Result<Withdrawal, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory store is offline"));
        }

        let mut buckets = self.data.lock().expect("bucket store poisoned");
        buckets.sweep_if_due(request.now, request.expiry());

        let (outcome, next) = withdraw(buckets.live(key, request.now), request);
        if let Some(state) = next {
            let expires_at = request.now + request.expiry();
            buckets.entries.insert(key.tokens.clone(), Entry { state, expires_at });
        }
        Ok(outcome)
    }

    fn is_available(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}
