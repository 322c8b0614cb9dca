//! Asynchronous client for the Flo by Moen water monitoring cloud API.
//!
//! The crate authenticates a user account, exposes the account, location,
//! and device data, issues device commands (valve control, system mode),
//! retrieves water consumption history, and can subscribe to near-real-time
//! device telemetry over the vendor's push backend, kept alive by a periodic
//! presence heartbeat.
//!
//! Authentication and retries are handled transparently: every call carries
//! a fresh bearer token, lapsed sessions re-authenticate when the caller has
//! opted in to credential retention, and transient non-200 responses are
//! retried up to a budget before the call resolves to `None`.
//!
//! ```rust,ignore
//! use flowater::{Flo, SystemMode};
//!
//! let flo = Flo::new("user@example.com");
//! flo.login("password").await?;
//!
//! if let Some(locations) = flo.locations(false).await? {
//!     println!("{locations:#}");
//! }
//! flo.set_mode("location-id", SystemMode::Away, None).await?;
//!
//! // Realtime telemetry with the keepalive heartbeat.
//! let mut listener = flo
//!     .realtime_listener("device-id", |snapshot| println!("{snapshot:?}"), true)
//!     .await?;
//! listener.start().await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
mod heartbeat;
pub mod request;
mod session;
pub mod stream;
mod util;

pub use client::{ConsumptionQuery, Flo, Interval, SystemMode};
pub use config::{Config, PushConfig, RequestConfig};
pub use error::Error;
pub use request::{Method, Request};
pub use stream::{Listener, SnapshotCallback};
