//! Marketplace API: resource types, normalization, transport and the
//! reconciliation client built on top of them.

pub mod client;
pub mod enrich;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientConfig, ReconciliationClient, RetrySummary, SaveOutcome};
pub use transport::{Attachment, HttpTransport, Transport};
pub use types::{Record, ResourceKey, ResourceKind, UserProfile, Vehicle, VehicleRecord};
