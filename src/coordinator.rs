//! Admission coordinator: turns one request identity into an admit/reject/bypass decision.
//!
//! The coordinator is stateless between calls. Every decision is a single atomic
//! withdrawal against the shared [`BucketStore`]; there is no local cache and no
//! in-process locking, so any number of coordinators in any number of processes can
//! share one store.
//!
//! # Failure policy
//!
//! When the store is down or a call fails, the default [`FailureMode::Open`] lets the
//! request through as [`Admission::Bypass`]. Availability of the protected service is
//! chosen over strict enforcement during store incidents. Every bypass is logged at warn
//! level and emitted as [`AdmissionEvent::Bypassed`] so unmetered periods are visible.
//! Deployments that must never exceed their limits use [`FailureMode::Closed`].

use crate::bucket::{ConsumeRequest, Withdrawal};
use crate::clock::{Clock, SystemClock};
use crate::config::{BucketConfig, FailureMode};
use crate::error::StoreError;
use crate::store::{BucketKey, BucketStore, DEFAULT_KEY_PREFIX};
use crate::telemetry::{
    emit_best_effort, AdmissionEvent, BypassCause, NullSink, RejectReason, TelemetrySink,
};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on a single store round trip unless overridden.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Proceed. Tokens were withdrawn from the caller's bucket.
    Admit {
        /// Tokens left after this request.
        remaining: f64,
        /// Bucket capacity.
        limit: f64,
    },
    /// The caller is over its budget (or the store is down and the coordinator fails closed).
    Reject,
    /// Proceed unmetered; the store could not be consulted.
    Bypass,
}

impl Admission {
    pub fn is_admit(&self) -> bool {
        matches!(self, Admission::Admit { .. })
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Admission::Reject)
    }

    pub fn is_bypass(&self) -> bool {
        matches!(self, Admission::Bypass)
    }

    /// Whole tokens left after an admit, as reported in `X-RateLimit-Remaining`.
    pub fn remaining_tokens(&self) -> Option<u64> {
        match self {
            // Tolerate float noise from refill arithmetic just below a whole token.
            Admission::Admit { remaining, .. } => Some((remaining + 1e-9).floor().max(0.0) as u64),
            _ => None,
        }
    }
}

/// Decides per identity whether a request may proceed, using a shared [`BucketStore`].
pub struct AdmissionCoordinator<S, T = NullSink> {
    config: BucketConfig,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    failure_mode: FailureMode,
    store_timeout: Option<Duration>,
    sink: T,
}

impl<S, T> fmt::Debug for AdmissionCoordinator<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionCoordinator")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("key_prefix", &self.key_prefix)
            .field("failure_mode", &self.failure_mode)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

impl<S> AdmissionCoordinator<S, NullSink>
where
    S: BucketStore,
{
    /// Create a coordinator over `store` with the system clock, fail-open policy,
    /// [`DEFAULT_STORE_TIMEOUT`], and the `rate_limit` key prefix.
    ///
    /// # Examples
    /// ```
    /// use tokengate::{AdmissionCoordinator, BucketConfig, InMemoryBucketStore};
    /// use std::time::Duration;
    ///
    /// let config = BucketConfig::per_window(10.0, Duration::from_secs(60)).unwrap();
    /// let coordinator = AdmissionCoordinator::new(config, InMemoryBucketStore::new());
    /// assert_eq!(coordinator.config().capacity(), 10.0);
    /// ```
    pub fn new(config: BucketConfig, store: S) -> Self {
        Self {
            config,
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            failure_mode: FailureMode::default(),
            store_timeout: Some(DEFAULT_STORE_TIMEOUT),
            sink: NullSink,
        }
    }
}

impl<S, T> AdmissionCoordinator<S, T>
where
    S: BucketStore,
{
    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Prefix for bucket keys in the store.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Bound each store call; `None` relies solely on the store client's own timeout.
    pub fn with_store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Send decision events to `sink`.
    pub fn with_telemetry<T2>(self, sink: T2) -> AdmissionCoordinator<S, T2>
    where
        T2: TelemetrySink,
    {
        AdmissionCoordinator {
            config: self.config,
            store: self.store,
            clock: self.clock,
            key_prefix: self.key_prefix,
            failure_mode: self.failure_mode,
            store_timeout: self.store_timeout,
            sink,
        }
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Store keys used for `identity`.
    pub fn bucket_key(&self, identity: &str) -> BucketKey {
        BucketKey::derive(&self.key_prefix, identity)
    }
}

impl<S, T> AdmissionCoordinator<S, T>
where
    S: BucketStore,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
{
    /// Check one request unit for `identity`.
    pub async fn admit(&self, identity: &str) -> Admission {
        self.admit_permits(identity, NonZeroU32::MIN).await
    }

    /// Check a request costing `permits` tokens for `identity`.
    ///
    /// Never retries: a reject or a store failure is final for this request.
    pub async fn admit_permits(&self, identity: &str, permits: NonZeroU32) -> Admission {
        if !self.store.is_available() {
            return self.degraded(identity, BypassCause::StoreDown, None).await;
        }

        let key = self.bucket_key(identity);
        let request = ConsumeRequest {
            capacity: self.config.capacity(),
            rate: self.config.rate(),
            now: self.clock.now(),
            cost: f64::from(permits.get()),
        };

        match self.consume(&key, &request).await {
            Ok(Withdrawal::Remaining(remaining)) => {
                let limit = request.capacity;
                tracing::debug!(target: "tokengate::coordinator", identity, remaining, limit, "admitted");
                self.emit(AdmissionEvent::Admitted { remaining, limit }).await;
                Admission::Admit { remaining, limit }
            }
            Ok(Withdrawal::Denied) => {
                tracing::debug!(target: "tokengate::coordinator", identity, "rejected: bucket exhausted");
                self.emit(AdmissionEvent::Rejected { reason: RejectReason::Exhausted }).await;
                Admission::Reject
            }
            Err(err) => self.degraded(identity, BypassCause::StoreError, Some(&err)).await,
        }
    }

    async fn consume(
        &self,
        key: &BucketKey,
        request: &ConsumeRequest,
    ) -> Result<Withdrawal, StoreError> {
        match self.store_timeout {
            Some(limit) => tokio::time::timeout(limit, self.store.try_consume(key, request))
                .await
                .unwrap_or_else(|_| Err(StoreError::Timeout { timeout: limit })),
            None => self.store.try_consume(key, request).await,
        }
    }

    async fn degraded(
        &self,
        identity: &str,
        cause: BypassCause,
        error: Option<&StoreError>,
    ) -> Admission {
        let error = error.map_or_else(|| "store reported down".to_string(), ToString::to_string);
        match self.failure_mode {
            FailureMode::Open => {
                tracing::warn!(
                    target: "tokengate::coordinator",
                    identity,
                    cause = %cause,
                    error = %error,
                    "rate limiter bypassed: store unavailable, failing open"
                );
                self.emit(AdmissionEvent::Bypassed { cause }).await;
                Admission::Bypass
            }
            FailureMode::Closed => {
                tracing::warn!(
                    target: "tokengate::coordinator",
                    identity,
                    cause = %cause,
                    error = %error,
                    "request rejected: store unavailable, failing closed"
                );
                self.emit(AdmissionEvent::Rejected { reason: RejectReason::StoreUnavailable })
                    .await;
                Admission::Reject
            }
        }
    }

    async fn emit(&self, event: AdmissionEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}
