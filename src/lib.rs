#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tixgate
//!
//! Admission-controlled, retrying API gateway for the Tixie ticketing
//! platform.
//!
//! ## Request path
//!
//! Every HTTP request passes a fixed pipeline before any backend sees it:
//!
//! 1. **Throttle**: minimum spacing between a client's requests
//! 2. **Concurrency**: cap on a client's in-flight requests
//! 3. **Rate**: sliding-window budget per client
//! 4. **Authorize**: open paths, then bearer token, then role
//!
//! Admitted requests are forwarded by the [`dispatch::Dispatcher`], which
//! retries transport failures and 5xx/429 answers under a [`RetryPolicy`].
//! WebSocket upgrades skip the HTTP stack and are authenticated on the raw
//! socket by [`ws::UpgradeAuthenticator`] before being tunnelled.
//!
//! All gate state lives behind the [`store::CounterStore`] trait, so several
//! gateway instances can share one store.
//!
//! ## Retry
//!
//! ```rust
//! use tixgate::{Backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let policy = RetryPolicy::<std::io::Error>::builder()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(2))
//!     .build()
//!     .unwrap();
//!
//! let mut calls = 0;
//! let value = policy
//!     .execute(|| {
//!         calls += 1;
//!         let n = calls;
//!         async move {
//!             if n < 3 { Err(std::io::Error::other("refused")) } else { Ok(n) }
//!         }
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 3);
//! assert_eq!(Backoff::exponential(Duration::from_millis(200)).delay(3), Duration::from_millis(800));
//! # });
//! ```

pub mod auth;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod jitter;
pub mod middleware;
pub mod pipeline;
pub mod retry;
pub mod route;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod ws;

// Re-exports
pub use auth::{AuthError, Claims, JwtVerifier, Role, TokenVerifier};
pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GatewayConfig};
pub use dispatch::{Dispatcher, ReqwestUpstream, TransportError, Upstream};
pub use error::{GatewayError, Quota, RetryError};
pub use gate::{ClientKey, Decision, FailureMode, KeySource};
pub use jitter::Jitter;
pub use pipeline::{AdmissionPipeline, AdmissionStage, RequestContext};
pub use retry::{RetryPolicy, RetryPolicyBuilder, Sleeper, TokioSleeper};
pub use route::{RouteTable, UpstreamUrls};
pub use server::{serve, Gateway, GatewayParts, StartupError};
pub use store::{CounterStore, InMemoryCounterStore, StoreError};
pub use ws::UpgradeAuthenticator;
