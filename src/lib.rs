#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tokengate
//!
//! Distributed token-bucket admission control for services running as many instances.
//!
//! Every instance consults the same shared store, so each caller identity gets one
//! budget across the whole fleet rather than one per process.
//!
//! ## Features
//!
//! - **Atomic withdrawals** through the [`BucketStore`] capability (Redis support lives in
//!   the `tokengate-redis` companion crate)
//! - **Stateless coordinator** producing admit / reject / bypass decisions
//! - **Fail-open by default**, with an explicit fail-closed mode
//! - **Tower middleware** for `http` services with `X-RateLimit-*` headers and 429 responses
//! - **Telemetry sinks** for observing every decision, including bypasses
//!
//! ## Quick Start
//!
//! ```rust
//! use tokengate::{Admission, AdmissionCoordinator, BucketConfig, InMemoryBucketStore};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     // 10 requests per minute, bursts of up to 10.
//!     let config = BucketConfig::per_window(10.0, Duration::from_secs(60)).unwrap();
//!     let coordinator = AdmissionCoordinator::new(config, InMemoryBucketStore::new());
//!
//!     match coordinator.admit("1.2.3.4").await {
//!         Admission::Admit { remaining, limit } => println!("ok: {remaining}/{limit}"),
//!         Admission::Reject => println!("slow down"),
//!         Admission::Bypass => println!("store unavailable, not metered"),
//!     }
//! }
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod middleware;
pub mod store;
pub mod telemetry;

// Re-exports
pub use bucket::{BucketState, ConsumeRequest, Withdrawal};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{BucketConfig, FailureMode, RateLimitSpec, MAX_BUCKET_EXPIRY};
pub use coordinator::{Admission, AdmissionCoordinator, DEFAULT_STORE_TIMEOUT};
pub use error::{ConfigError, StoreError};
pub use identity::{IdentityExtractor, PeerAddr, ProxyTrust};
pub use middleware::{AdmissionLayer, AdmissionService};
pub use store::{BucketKey, BucketStore, InMemoryBucketStore};
