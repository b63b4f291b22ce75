use super::events::{AdmissionEvent, BypassCause, RejectReason};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// Destination for admission decisions.
///
/// Any cloneable `tower::Service<AdmissionEvent>` qualifies, so sinks compose with tower
/// combinators (buffering, filtering, fan-out).
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` to `sink`, dropping it if the sink is not ready or fails.
///
/// A decision is never turned into an error because telemetry failed.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Discards every event. The coordinator's default.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes one `tracing` record per decision under `tokengate::decision`.
///
/// Levels follow how much an operator should care:
///
/// | decision | level |
/// |---|---|
/// | admitted | `debug` |
/// | rejected, bucket exhausted | `info` |
/// | rejected, store unavailable (fail-closed) | `warn` |
/// | bypassed | `warn` |
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        match event {
            AdmissionEvent::Admitted { remaining, limit } => {
                tracing::debug!(target: "tokengate::decision", remaining, limit, "admitted");
            }
            AdmissionEvent::Rejected { reason: RejectReason::Exhausted } => {
                tracing::info!(target: "tokengate::decision", "rejected: bucket exhausted");
            }
            AdmissionEvent::Rejected { reason: RejectReason::StoreUnavailable } => {
                tracing::warn!(target: "tokengate::decision", "rejected: store unavailable");
            }
            AdmissionEvent::Bypassed { cause } => {
                tracing::warn!(target: "tokengate::decision", cause = %cause, "bypassed: request not metered");
            }
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Point-in-time totals read from a [`CountingSink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionCounts {
    pub admitted: u64,
    pub rejected_exhausted: u64,
    pub rejected_store_unavailable: u64,
    pub bypassed_store_down: u64,
    pub bypassed_store_error: u64,
}

impl DecisionCounts {
    pub fn rejected(&self) -> u64 {
        self.rejected_exhausted + self.rejected_store_unavailable
    }

    /// Requests that went through without touching a bucket.
    pub fn unmetered(&self) -> u64 {
        self.bypassed_store_down + self.bypassed_store_error
    }

    pub fn total(&self) -> u64 {
        self.admitted + self.rejected() + self.unmetered()
    }
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    rejected_exhausted: AtomicU64,
    rejected_store_unavailable: AtomicU64,
    bypassed_store_down: AtomicU64,
    bypassed_store_error: AtomicU64,
}

/// Counts decisions by outcome. Clones share the same counters.
///
/// Constant memory regardless of traffic, so it can stay attached in production and be
/// scraped into whatever metrics system is in use.
#[derive(Clone, Debug, Default)]
pub struct CountingSink {
    counters: Arc<Counters>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DecisionCounts {
        let c = &self.counters;
        DecisionCounts {
            admitted: c.admitted.load(Ordering::Relaxed),
            rejected_exhausted: c.rejected_exhausted.load(Ordering::Relaxed),
            rejected_store_unavailable: c.rejected_store_unavailable.load(Ordering::Relaxed),
            bypassed_store_down: c.bypassed_store_down.load(Ordering::Relaxed),
            bypassed_store_error: c.bypassed_store_error.load(Ordering::Relaxed),
        }
    }

    fn counter(&self, event: &AdmissionEvent) -> &AtomicU64 {
        let c = &self.counters;
        match event {
            AdmissionEvent::Admitted { .. } => &c.admitted,
            AdmissionEvent::Rejected { reason: RejectReason::Exhausted } => &c.rejected_exhausted,
            AdmissionEvent::Rejected { reason: RejectReason::StoreUnavailable } => {
                &c.rejected_store_unavailable
            }
            AdmissionEvent::Bypassed { cause: BypassCause::StoreDown } => &c.bypassed_store_down,
            AdmissionEvent::Bypassed { cause: BypassCause::StoreError } => &c.bypassed_store_error,
        }
    }
}

impl Service<AdmissionEvent> for CountingSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        self.counter(&event).fetch_add(1, Ordering::Relaxed);
        ready(Ok(()))
    }
}

impl TelemetrySink for CountingSink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn counting_sink_splits_by_outcome() {
        let sink = CountingSink::new();
        for event in [
            AdmissionEvent::Admitted { remaining: 1.0, limit: 2.0 },
            AdmissionEvent::Admitted { remaining: 0.0, limit: 2.0 },
            AdmissionEvent::Rejected { reason: RejectReason::Exhausted },
            AdmissionEvent::Rejected { reason: RejectReason::StoreUnavailable },
            AdmissionEvent::Bypassed { cause: BypassCause::StoreDown },
            AdmissionEvent::Bypassed { cause: BypassCause::StoreError },
            AdmissionEvent::Bypassed { cause: BypassCause::StoreError },
        ] {
            emit_best_effort(sink.clone(), event).await;
        }

        let counts = sink.snapshot();
        assert_eq!(counts.admitted, 2);
        assert_eq!(counts.rejected(), 2);
        assert_eq!(counts.bypassed_store_down, 1);
        assert_eq!(counts.bypassed_store_error, 2);
        assert_eq!(counts.unmetered(), 3);
        assert_eq!(counts.total(), 7);
    }

    #[tokio::test]
    async fn log_sink_levels_follow_decision() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(SharedWriter(buffer.clone()))
            .with_max_level(tracing::Level::DEBUG)
            .with_target(true)
            .without_time()
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        emit_best_effort(LogSink, AdmissionEvent::Admitted { remaining: 3.0, limit: 5.0 }).await;
        emit_best_effort(LogSink, AdmissionEvent::Rejected { reason: RejectReason::Exhausted })
            .await;
        emit_best_effort(LogSink, AdmissionEvent::Bypassed { cause: BypassCause::StoreDown })
            .await;

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        let line = |needle: &str| {
            logs.lines().find(|l| l.contains(needle)).unwrap_or_else(|| panic!("{needle}: {logs}"))
        };
        assert!(line("admitted").contains("DEBUG"));
        assert!(line("bucket exhausted").contains("INFO"));
        let bypass = line("not metered");
        assert!(bypass.contains("WARN"));
        assert!(bypass.contains("store_down"));
        assert!(bypass.contains("tokengate::decision"));
    }
}
