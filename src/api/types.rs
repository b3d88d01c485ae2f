//! Domain types for marketplace resources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use super::enrich;

/// Kinds of resources the backend exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
  Profile,
  Vehicle,
  SellRequest,
}

impl ResourceKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Profile => "profile",
      Self::Vehicle => "vehicle",
      Self::SellRequest => "sell-request",
    }
  }

  pub fn collection_path(&self) -> &'static str {
    match self {
      Self::Profile => "/accounts/profile/",
      Self::Vehicle => "/marketplace/vehicles/",
      Self::SellRequest => "/marketplace/sell-requests/",
    }
  }

  /// Normalize a raw payload of this kind into its canonical JSON shape.
  pub fn enrich_value(&self, raw: &Value) -> Value {
    match self {
      Self::Profile => enrich::profile(raw).to_value(),
      Self::Vehicle | Self::SellRequest => enrich::vehicle_record(raw).to_value(),
    }
  }
}

impl FromStr for ResourceKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "profile" => Ok(Self::Profile),
      "vehicle" | "vehicles" => Ok(Self::Vehicle),
      "sell-request" | "sell-requests" | "sell_request" => Ok(Self::SellRequest),
      other => Err(format!("unknown resource kind '{}'", other)),
    }
  }
}

/// Identifies a single resource on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
  pub kind: ResourceKind,
  pub id: String,
}

impl ResourceKey {
  pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
    Self {
      kind,
      id: id.into(),
    }
  }

  /// The signed-in user's profile. There is only one.
  pub fn profile() -> Self {
    Self::new(ResourceKind::Profile, "me")
  }

  pub fn vehicle(id: impl Into<String>) -> Self {
    Self::new(ResourceKind::Vehicle, id)
  }

  pub fn sell_request(id: impl Into<String>) -> Self {
    Self::new(ResourceKind::SellRequest, id)
  }

  /// Endpoint path for this resource.
  pub fn path(&self) -> String {
    match self.kind {
      ResourceKind::Profile => self.kind.collection_path().to_string(),
      _ => format!("{}{}/", self.kind.collection_path(), self.id),
    }
  }

  /// Key used by the cache and the durable stores, e.g. `vehicle:42`.
  pub fn cache_key(&self) -> String {
    format!("{}:{}", self.kind.as_str(), self.id)
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.kind.as_str(), self.id)
  }
}

impl FromStr for ResourceKey {
  type Err = String;

  /// Parses `kind:id`; a bare `profile` is the signed-in profile.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.split_once(':') {
      Some((kind, id)) if !id.is_empty() => Ok(Self::new(kind.parse()?, id)),
      Some(_) => Err(format!("missing id in '{}'", s)),
      None if s.eq_ignore_ascii_case("profile") => Ok(Self::profile()),
      None => Err(format!("expected kind:id, got '{}'", s)),
    }
  }
}

/// Local sync state carried on a record.
///
/// Present only while a mutation has not been acknowledged by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMarker {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pending: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error_time: Option<DateTime<Utc>>,
}

impl SyncMarker {
  pub fn is_pending(&self) -> bool {
    self.pending == Some(true)
  }
}

/// Vehicle details as displayed in listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub brand: String,
  pub model: String,
  pub year: i32,
  pub registration_number: String,
  pub fuel_type: String,
  pub color: String,
  pub kms_driven: u64,
  pub engine_capacity: u64,
  pub price: f64,
  pub expected_price: f64,
  pub mileage: f64,
  /// Same as `mileage`; some upstream payloads capitalize it
  #[serde(rename = "Mileage")]
  pub mileage_alias: f64,
}

/// A vehicle listing or sell request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
  pub id: String,
  pub vehicle: Vehicle,
  pub status: String,
  pub status_display: String,
  #[serde(flatten)]
  pub sync: SyncMarker,
}

/// The signed-in user's profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
  pub id: String,
  pub username: String,
  pub email: String,
  pub first_name: String,
  pub last_name: String,
  pub phone_number: String,
  pub address: String,
  pub city: String,
  pub state: String,
  #[serde(flatten)]
  pub sync: SyncMarker,
  /// Upstream fields we do not model, kept verbatim
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// A record that can be normalized, cached and tracked for pending writes.
pub trait Record: Clone + Send + Sync + Serialize + 'static {
  /// Build the canonical record from any raw payload shape. Idempotent.
  fn enrich(raw: &Value) -> Self;

  fn record_id(&self) -> &str;

  fn sync(&self) -> &SyncMarker;

  fn sync_mut(&mut self) -> &mut SyncMarker;

  fn to_value(&self) -> Value {
    serde_json::to_value(self).unwrap_or(Value::Null)
  }
}

impl Record for VehicleRecord {
  fn enrich(raw: &Value) -> Self {
    enrich::vehicle_record(raw)
  }

  fn record_id(&self) -> &str {
    &self.id
  }

  fn sync(&self) -> &SyncMarker {
    &self.sync
  }

  fn sync_mut(&mut self) -> &mut SyncMarker {
    &mut self.sync
  }
}

impl Record for UserProfile {
  fn enrich(raw: &Value) -> Self {
    enrich::profile(raw)
  }

  fn record_id(&self) -> &str {
    &self.id
  }

  fn sync(&self) -> &SyncMarker {
    &self.sync
  }

  fn sync_mut(&mut self) -> &mut SyncMarker {
    &mut self.sync
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_paths() {
    assert_eq!(ResourceKey::profile().path(), "/accounts/profile/");
    assert_eq!(ResourceKey::vehicle("42").path(), "/marketplace/vehicles/42/");
    assert_eq!(
      ResourceKey::sell_request("7").path(),
      "/marketplace/sell-requests/7/"
    );
  }

  #[test]
  fn test_parse_resource_key() {
    assert_eq!(
      "vehicle:42".parse::<ResourceKey>().unwrap(),
      ResourceKey::vehicle("42")
    );
    assert_eq!(
      "sell-requests:9".parse::<ResourceKey>().unwrap(),
      ResourceKey::sell_request("9")
    );
    assert_eq!(
      "profile".parse::<ResourceKey>().unwrap(),
      ResourceKey::profile()
    );
    assert!("vehicle:".parse::<ResourceKey>().is_err());
    assert!("boat:1".parse::<ResourceKey>().is_err());
  }

  #[test]
  fn test_sync_marker_skips_absent_fields() {
    let record = VehicleRecord::enrich(&Value::Null);
    let value = record.to_value();
    assert!(value.get("pending").is_none());
    assert!(value.get("lastError").is_none());
    assert!(value.get("lastErrorTime").is_none());

    let pending = VehicleRecord::enrich(&serde_json::json!({
      "pending": true,
      "lastError": "offline",
      "lastErrorTime": "2026-03-01T10:00:00Z"
    }));
    assert!(pending.sync().is_pending());
    assert_eq!(pending.to_value()["lastError"], "offline");
  }
}
