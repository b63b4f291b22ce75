use std::fmt;

/// Event emitted for every admission decision.
///
/// Bypasses are invisible to the end caller; these events (and the warn-level log lines
/// that accompany them) are how operators see unmetered periods.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionEvent {
    /// The request was admitted and tokens were withdrawn.
    Admitted {
        /// Tokens left in the bucket.
        remaining: f64,
        /// Bucket capacity.
        limit: f64,
    },
    /// The request was turned away.
    Rejected {
        /// Why it was turned away.
        reason: RejectReason,
    },
    /// The request went through without being metered.
    Bypassed {
        /// What kept the store from being consulted.
        cause: BypassCause,
    },
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The bucket did not hold enough tokens.
    Exhausted,
    /// The store was unavailable and the coordinator fails closed.
    StoreUnavailable,
}

/// Why the store was not consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassCause {
    /// The store reported itself down before the call.
    StoreDown,
    /// The store call failed or timed out.
    StoreError,
}

impl AdmissionEvent {
    /// Short machine-readable name, e.g. for metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionEvent::Admitted { .. } => "admitted",
            AdmissionEvent::Rejected { .. } => "rejected",
            AdmissionEvent::Bypassed { .. } => "bypassed",
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Admitted { remaining, limit } => {
                write!(f, "Admitted(remaining={}, limit={})", remaining, limit)
            }
            AdmissionEvent::Rejected { reason } => write!(f, "Rejected({})", reason),
            AdmissionEvent::Bypassed { cause } => write!(f, "Bypassed({})", cause),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Exhausted => write!(f, "exhausted"),
            RejectReason::StoreUnavailable => write!(f, "store_unavailable"),
        }
    }
}

impl fmt::Display for BypassCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BypassCause::StoreDown => write!(f, "store_down"),
            BypassCause::StoreError => write!(f, "store_error"),
        }
    }
}
