//! Client-side cache and reconciliation layer for a vehicle marketplace
//! backend.
//!
//! Reads are served from a TTL cache and durable local stores, revalidated
//! with conditional requests. Writes that cannot reach the server are kept
//! locally as pending and retried on reconnect. Subscribed resources are
//! polled for changes on a shared timer.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod pending;
pub mod poller;
pub mod store;

pub use api::{ReconciliationClient, ResourceKey, SaveOutcome};
pub use error::{ApiError, StoreError};
pub use poller::{ChangePoller, PollerConfig};
