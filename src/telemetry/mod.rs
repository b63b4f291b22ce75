//! Telemetry for admission decisions.
//!
//! The coordinator emits one [`AdmissionEvent`] per decision into a [`TelemetrySink`].
//! Sinks are `tower::Service<AdmissionEvent>` implementations, so they compose with
//! standard tower combinators and can forward to logs, counters, or external systems.
//!
//! ```rust
//! use tokengate::telemetry::{AdmissionEvent, BypassCause};
//!
//! let event = AdmissionEvent::Bypassed { cause: BypassCause::StoreDown };
//! assert_eq!(event.kind(), "bypassed");
//! ```

pub mod events;
pub mod sinks;

pub use events::{AdmissionEvent, BypassCause, RejectReason};
pub use sinks::{
    emit_best_effort, CountingSink, DecisionCounts, LogSink, NullSink, TelemetrySink,
};
