//! Token-bucket withdrawal.
//!
//! [`withdraw`] is the whole algorithm, independent of where the bucket lives. Stores
//! must run it (or an equivalent script) as one atomic step per bucket.

use crate::clock::Timestamp;
use crate::config::expiry_for;
use std::time::Duration;

/// Stored state of one identity's bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens available as of `last_refill`.
    pub tokens: f64,
    /// When the bucket was last written.
    pub last_refill: Timestamp,
}

/// Parameters for a single withdrawal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeRequest {
    pub capacity: f64,
    /// Tokens per second.
    pub rate: f64,
    pub now: Timestamp,
    /// Tokens to withdraw; positive.
    pub cost: f64,
}

impl ConsumeRequest {
    /// How long an untouched bucket lives: the time to refill it completely.
    pub fn expiry(&self) -> Duration {
        expiry_for(self.capacity, self.rate)
    }
}

/// Result of an atomic withdrawal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Withdrawal {
    /// Tokens were taken; this many remain.
    Remaining(f64),
    /// Not enough tokens. Nothing was written.
    Denied,
}

impl Withdrawal {
    pub fn is_denied(&self) -> bool {
        matches!(self, Withdrawal::Denied)
    }
}

/// Refill `state` up to `request.now` and try to take `request.cost` tokens.
///
/// A missing bucket is full. Returns the new state to persist, or `None` when the
/// withdrawal is denied and the stored bucket must stay untouched.
pub fn withdraw(
    state: Option<BucketState>,
    request: &ConsumeRequest,
) -> (Withdrawal, Option<BucketState>) {
    let last_refill = state.map_or(request.now, |s| s.last_refill);
    let tokens = state.map_or(request.capacity, |s| s.tokens);

    let elapsed = request.now.seconds_since(last_refill);
    let filled = (tokens + elapsed * request.rate).min(request.capacity);

    if filled >= request.cost {
        let remaining = filled - request.cost;
        let next = BucketState { tokens: remaining, last_refill: request.now };
        (Withdrawal::Remaining(remaining), Some(next))
    } else {
        (Withdrawal::Denied, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(now: Timestamp) -> ConsumeRequest {
        ConsumeRequest { capacity: 10.0, rate: 2.0, now, cost: 1.0 }
    }

    #[test]
    fn expiry_is_time_to_full_refill() {
        let req = request(Timestamp::EPOCH);
        assert_eq!(req.expiry(), Duration::from_secs(5));
    }

    #[test]
    fn missing_bucket_starts_full() {
        let now = Timestamp::from_secs(1_000);
        let (outcome, next) = withdraw(None, &request(now));
        assert_eq!(outcome, Withdrawal::Remaining(9.0));
        assert_eq!(next, Some(BucketState { tokens: 9.0, last_refill: now }));
    }

    #[test]
    fn refills_linearly_and_caps_at_capacity() {
        let start = Timestamp::from_secs(1_000);
        let empty = BucketState { tokens: 0.0, last_refill: start };

        let (outcome, _) = withdraw(Some(empty), &request(start + Duration::from_millis(1500)));
        assert_eq!(outcome, Withdrawal::Remaining(2.0));

        let (outcome, _) = withdraw(Some(empty), &request(start + Duration::from_secs(3600)));
        assert_eq!(outcome, Withdrawal::Remaining(9.0));
    }

    #[test]
    fn denial_leaves_state_untouched() {
        let now = Timestamp::from_secs(1_000);
        let low = BucketState { tokens: 0.25, last_refill: now };
        let (outcome, next) = withdraw(Some(low), &request(now));
        assert!(outcome.is_denied());
        assert!(next.is_none());
    }

    #[test]
    fn clock_going_backwards_adds_nothing() {
        let now = Timestamp::from_secs(1_000);
        let state = BucketState { tokens: 3.0, last_refill: now + Duration::from_secs(30) };
        let (outcome, next) = withdraw(Some(state), &request(now));
        assert_eq!(outcome, Withdrawal::Remaining(2.0));
        assert_eq!(next.map(|s| s.last_refill), Some(now));
    }

    #[test]
    fn overfull_stored_state_is_clamped() {
        // A bucket written under a larger capacity.
        let now = Timestamp::from_secs(1_000);
        let state = BucketState { tokens: 50.0, last_refill: now };
        let (outcome, _) = withdraw(Some(state), &request(now));
        assert_eq!(outcome, Withdrawal::Remaining(9.0));
    }

    #[test]
    fn tokens_stay_within_bounds_over_a_long_sequence() {
        let mut now = Timestamp::from_secs(1_000);
        let mut state = None;
        for step in 0u64..500 {
            // Irregular spacing: bursts of immediate calls and occasional long gaps.
            now = now + Duration::from_millis((step * 37) % 1_300);
            let req = ConsumeRequest { cost: 1.0 + (step % 3) as f64, ..request(now) };
            let (outcome, next) = withdraw(state, &req);
            if let Withdrawal::Remaining(left) = outcome {
                assert!((0.0..=10.0).contains(&left), "remaining {left} out of bounds");
            }
            if next.is_some() {
                state = next;
            }
            let stored = state.map_or(10.0, |s| s.tokens);
            assert!((0.0..=10.0).contains(&stored));
        }
    }
}
