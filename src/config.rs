//! Bucket configuration and failure policy.

use crate::error::ConfigError;
use std::time::Duration;

/// Validated, immutable token-bucket parameters.
///
/// `capacity` is the maximum burst; `rate` is the refill speed in tokens per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    capacity: f64,
    rate: f64,
}

impl BucketConfig {
    /// Create a config with an explicit refill rate (tokens per second).
    ///
    /// # Examples
    /// ```
    /// use tokengate::BucketConfig;
    /// let config = BucketConfig::new(10.0, 0.5).unwrap();
    /// assert_eq!(config.expiry().as_secs(), 20);
    /// ```
    pub fn new(capacity: f64, rate: f64) -> Result<Self, ConfigError> {
        validate_capacity(capacity)?;
        validate_rate(rate)?;
        Ok(Self { capacity, rate })
    }

    /// Create a config that refills a full bucket once per `window`.
    ///
    /// `10` per 60 seconds gives a rate of 1/6 token per second.
    pub fn per_window(capacity: f64, window: Duration) -> Result<Self, ConfigError> {
        Self::from_window_secs(capacity, window.as_secs_f64())
    }

    fn from_window_secs(capacity: f64, window_secs: f64) -> Result<Self, ConfigError> {
        validate_capacity(capacity)?;
        if !(window_secs.is_finite() && window_secs > 0.0) {
            return Err(ConfigError::InvalidWindow { provided: window_secs });
        }
        Self::new(capacity, capacity / window_secs)
    }

    /// Maximum number of tokens in a bucket.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Idle time after which a bucket is full again and its keys may expire.
    ///
    /// Whole seconds, `ceil(capacity / rate)`, never less than one.
    pub fn expiry(&self) -> Duration {
        expiry_for(self.capacity, self.rate)
    }
}

/// Longest time an idle bucket is kept.
///
/// Buckets that take longer than this to refill are dropped (and so read as full again)
/// after a year idle. Also keeps expiries within what Redis accepts for `SET ... EX`.
pub const MAX_BUCKET_EXPIRY: Duration = Duration::from_secs(365 * 24 * 3600);

pub(crate) fn expiry_for(capacity: f64, rate: f64) -> Duration {
    let secs = (capacity / rate).ceil();
    if secs.is_nan() || secs < 1.0 {
        Duration::from_secs(1)
    } else if secs >= MAX_BUCKET_EXPIRY.as_secs() as f64 {
        MAX_BUCKET_EXPIRY
    } else {
        Duration::from_secs(secs as u64)
    }
}

fn validate_capacity(capacity: f64) -> Result<(), ConfigError> {
    if capacity.is_finite() && capacity > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidCapacity { provided: capacity })
    }
}

fn validate_rate(rate: f64) -> Result<(), ConfigError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidRate { provided: rate })
    }
}

/// Raw rate-limit settings as they appear in configuration files.
///
/// `refill_rate` takes precedence; otherwise the rate is `capacity / window_size`.
/// Convert with `BucketConfig::try_from`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RateLimitSpec {
    /// Maximum burst size.
    pub capacity: f64,
    /// Tokens per second.
    #[cfg_attr(feature = "serde", serde(default))]
    pub refill_rate: Option<f64>,
    /// Seconds needed to refill an empty bucket.
    #[cfg_attr(feature = "serde", serde(default))]
    pub window_size: Option<f64>,
}

impl TryFrom<RateLimitSpec> for BucketConfig {
    type Error = ConfigError;

    fn try_from(spec: RateLimitSpec) -> Result<Self, Self::Error> {
        match (spec.refill_rate, spec.window_size) {
            (Some(rate), _) => BucketConfig::new(spec.capacity, rate),
            (None, Some(window)) => BucketConfig::from_window_secs(spec.capacity, window),
            (None, None) => {
                validate_capacity(spec.capacity)?;
                Err(ConfigError::MissingRefill)
            }
        }
    }
}

/// What to do with a request when the shared store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Let the request through unmetered. Availability of the protected service wins
    /// over strict enforcement while the store is degraded.
    #[default]
    Open,
    /// Reject the request as if its bucket were empty.
    Closed,
}
