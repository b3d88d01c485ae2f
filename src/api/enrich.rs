//! Normalization of raw payloads into canonical records.
//!
//! Every record crossing a boundary (network ingress, storage ingress,
//! outbound bodies) goes through here. Upstream payloads are inconsistent:
//! related vehicles arrive as objects or bare ids, vehicle fields are
//! sometimes flat on the listing, numbers come as strings, `mileage` is
//! sometimes `Mileage`, and only one of `price`/`expected_price` may be set.
//! The functions below produce one shape with every display field present,
//! and applying them twice changes nothing.

use chrono::{DateTime, Datelike, Utc};
use serde_json::{Map, Value};

use super::types::{SyncMarker, UserProfile, Vehicle, VehicleRecord};

const UNKNOWN: &str = "Unknown";
const DEFAULT_FUEL: &str = "Petrol";
const DEFAULT_STATUS: &str = "pending";

/// Field pairs that always carry the same value.
pub const SYNONYMS: &[(&str, &str)] = &[("price", "expected_price"), ("mileage", "Mileage")];

/// Fields that belong to the nested `vehicle` of a listing.
const VEHICLE_FIELDS: &[&str] = &[
  "brand",
  "model",
  "year",
  "registration_number",
  "fuel_type",
  "color",
  "kms_driven",
  "engine_capacity",
  "price",
  "expected_price",
  "mileage",
  "Mileage",
];

const PROFILE_FIELDS: &[&str] = &[
  "id",
  "user",
  "username",
  "email",
  "first_name",
  "last_name",
  "phone_number",
  "address",
  "city",
  "state",
  "pending",
  "lastError",
  "lastErrorTime",
];

/// Canonical vehicle record from any payload shape, including `null`.
pub fn vehicle_record(raw: &Value) -> VehicleRecord {
  let status = status_code(raw.get("status")).unwrap_or_else(|| DEFAULT_STATUS.to_string());
  let status_display = text(raw.get("status_display")).unwrap_or_else(|| title_case(&status));

  VehicleRecord {
    id: text(raw.get("id")).unwrap_or_default(),
    vehicle: vehicle(raw),
    status,
    status_display,
    sync: sync_marker(raw),
  }
}

/// The `vehicle` of a listing. The related vehicle may be a nested object,
/// a bare id, or missing with its fields flat on the listing.
fn vehicle(raw: &Value) -> Vehicle {
  let (nested, id) = match raw.get("vehicle") {
    Some(Value::Object(map)) => (Some(map), text(map.get("id"))),
    Some(bare @ (Value::Number(_) | Value::String(_))) => (None, text(Some(bare))),
    _ => (None, None),
  };

  let field = |name: &str| lookup(nested, raw, name);

  let price = number(field("price"));
  let expected_price = number(field("expected_price"));
  let mileage = number(field("mileage")).or_else(|| number(field("Mileage")));

  Vehicle {
    id,
    brand: text(field("brand")).unwrap_or_else(|| UNKNOWN.to_string()),
    model: text(field("model")).unwrap_or_else(|| UNKNOWN.to_string()),
    year: number(field("year"))
      .map(|y| y as i32)
      .unwrap_or_else(|| Utc::now().year()),
    registration_number: text(field("registration_number"))
      .unwrap_or_else(|| UNKNOWN.to_string()),
    fuel_type: text(field("fuel_type")).unwrap_or_else(|| DEFAULT_FUEL.to_string()),
    color: text(field("color")).unwrap_or_default(),
    kms_driven: whole(field("kms_driven")),
    engine_capacity: whole(field("engine_capacity")),
    price: price.or(expected_price).unwrap_or(0.0),
    expected_price: expected_price.or(price).unwrap_or(0.0),
    mileage: mileage.unwrap_or(0.0),
    mileage_alias: mileage.unwrap_or(0.0),
  }
}

/// A vehicle field from the nested object, falling back to the listing.
fn lookup<'a>(nested: Option<&'a Map<String, Value>>, raw: &'a Value, name: &str) -> Option<&'a Value> {
  nested
    .and_then(|m| m.get(name))
    .filter(|v| !v.is_null())
    .or_else(|| raw.get(name).filter(|v| !v.is_null()))
}

/// Canonical profile. A nested `user` object is lifted into the top level.
pub fn profile(raw: &Value) -> UserProfile {
  let user = raw.get("user").and_then(Value::as_object);

  let field = |name: &str| -> String {
    text(raw.get(name))
      .or_else(|| text(user.and_then(|u| u.get(name))))
      .unwrap_or_default()
  };

  let extra: Map<String, Value> = raw
    .as_object()
    .map(|map| {
      map
        .iter()
        .filter(|(k, _)| !PROFILE_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
    })
    .unwrap_or_default();

  UserProfile {
    id: field("id"),
    username: field("username"),
    email: field("email"),
    first_name: field("first_name"),
    last_name: field("last_name"),
    phone_number: field("phone_number"),
    address: field("address"),
    city: field("city"),
    state: field("state"),
    sync: sync_marker(raw),
    extra,
  }
}

/// Copy the value of a synonym into its partner when the partner is
/// absent, at every level of `patch`. Applied to partial updates so a
/// change to `price` also changes `expected_price`.
pub fn align_synonyms(patch: &Value) -> Value {
  match patch {
    Value::Object(map) => {
      let mut out: Map<String, Value> = map
        .iter()
        .map(|(k, v)| (k.clone(), align_synonyms(v)))
        .collect();

      for (a, b) in SYNONYMS {
        match (map.get(*a), map.get(*b)) {
          (Some(v), None) if !v.is_null() => {
            out.insert(b.to_string(), v.clone());
          }
          (None, Some(v)) if !v.is_null() => {
            out.insert(a.to_string(), v.clone());
          }
          _ => {}
        }
      }

      Value::Object(out)
    }
    other => other.clone(),
  }
}

/// Move vehicle fields given flat on a listing patch into its nested
/// `vehicle` object. A field already present in the nested object wins.
///
/// Normalization prefers nested values, so a flat field merged over a
/// record would otherwise be ignored.
pub fn nest_vehicle_fields(patch: &Value) -> Value {
  let Value::Object(map) = patch else {
    return patch.clone();
  };

  let mut out = Map::new();
  let mut nested = match map.get("vehicle") {
    Some(Value::Object(v)) => v.clone(),
    _ => Map::new(),
  };
  for (k, v) in map {
    if VEHICLE_FIELDS.contains(&k.as_str()) {
      nested.entry(k.clone()).or_insert_with(|| v.clone());
    } else if k != "vehicle" {
      out.insert(k.clone(), v.clone());
    }
  }

  match map.get("vehicle") {
    Some(Value::Object(_)) => {
      out.insert("vehicle".into(), Value::Object(nested));
    }
    // A bare related id stays as it is unless flat fields need a home
    Some(other) if nested.is_empty() => {
      out.insert("vehicle".into(), other.clone());
    }
    Some(other) => {
      if let Some(id) = text(Some(other)) {
        nested.entry("id".to_string()).or_insert(Value::String(id));
      }
      out.insert("vehicle".into(), Value::Object(nested));
    }
    None if !nested.is_empty() => {
      out.insert("vehicle".into(), Value::Object(nested));
    }
    None => {}
  }
  Value::Object(out)
}

/// Recursively merge `patch` over `base` into a new value. Objects merge
/// key by key, anything else in `patch` replaces what is in `base`.
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
  match (base, patch) {
    (Value::Object(b), Value::Object(p)) => {
      let mut out = b.clone();
      for (k, pv) in p {
        let merged = match b.get(k) {
          Some(bv) => deep_merge(bv, pv),
          None => pv.clone(),
        };
        out.insert(k.clone(), merged);
      }
      Value::Object(out)
    }
    (_, p) => p.clone(),
  }
}

fn sync_marker(raw: &Value) -> SyncMarker {
  let pending = raw.get("pending").and_then(Value::as_bool).filter(|p| *p);
  SyncMarker {
    pending,
    last_error: text(raw.get("lastError")),
    last_error_time: raw
      .get("lastErrorTime")
      .and_then(Value::as_str)
      .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
      .map(|t| t.with_timezone(&Utc)),
  }
}

/// Non-empty text. Numbers are rendered, anything else is absent.
fn text(value: Option<&Value>) -> Option<String> {
  match value? {
    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// A finite number, accepting numeric strings like `"4,50,000"`.
fn number(value: Option<&Value>) -> Option<f64> {
  let n = match value? {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
    _ => None,
  }?;
  n.is_finite().then_some(n)
}

fn whole(value: Option<&Value>) -> u64 {
  number(value).filter(|n| *n > 0.0).map(|n| n.round() as u64).unwrap_or(0)
}

/// A status may be a plain code or an object such as `{"code": "..."}`.
fn status_code(value: Option<&Value>) -> Option<String> {
  match value? {
    Value::Object(map) => ["code", "value", "name"]
      .iter()
      .find_map(|k| text(map.get(*k))),
    other => text(Some(other)),
  }
}

fn title_case(code: &str) -> String {
  code
    .split(['_', '-', ' '])
    .filter(|w| !w.is_empty())
    .map(|w| {
      let mut chars = w.chars();
      match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
      }
    })
    .collect::<Vec<String>>()
    .join(" ")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::Record;
  use serde_json::json;

  fn idempotent(raw: Value) {
    let once = vehicle_record(&raw);
    let twice = vehicle_record(&once.to_value());
    assert_eq!(once, twice, "vehicle enrichment not idempotent for {}", raw);

    let once = profile(&raw);
    let twice = profile(&once.to_value());
    assert_eq!(once, twice, "profile enrichment not idempotent for {}", raw);
  }

  #[test]
  fn test_idempotent_for_partial_shapes() {
    idempotent(Value::Null);
    idempotent(json!({}));
    idempotent(json!({"id": 5}));
    idempotent(json!({"vehicle": 12, "brand": "Honda"}));
    idempotent(json!({"vehicle": {"price": "450000", "Mileage": 18}}));
    idempotent(json!({"status": {"code": "under_review"}, "pending": true, "lastError": "offline"}));
    idempotent(json!({"user": {"username": "asha", "email": "a@example.com"}, "bio": "hi"}));
    idempotent(json!([1, 2, 3]));
  }

  #[test]
  fn test_defaults_for_empty_record() {
    let record = vehicle_record(&json!({}));
    assert_eq!(record.vehicle.brand, "Unknown");
    assert_eq!(record.vehicle.model, "Unknown");
    assert_eq!(record.vehicle.registration_number, "Unknown");
    assert_eq!(record.vehicle.fuel_type, "Petrol");
    assert_eq!(record.vehicle.year, Utc::now().year());
    assert_eq!(record.vehicle.kms_driven, 0);
    assert_eq!(record.vehicle.price, 0.0);
    assert_eq!(record.status, "pending");
    assert_eq!(record.status_display, "Pending");
    assert!(!record.sync.is_pending());
  }

  #[test]
  fn test_price_backfill_both_directions() {
    let only_price = vehicle_record(&json!({"vehicle": {"price": 350000}}));
    assert_eq!(only_price.vehicle.expected_price, 350000.0);

    let only_expected = vehicle_record(&json!({"vehicle": {"expected_price": "275000"}}));
    assert_eq!(only_expected.vehicle.price, 275000.0);
  }

  #[test]
  fn test_mileage_alias_synchronized() {
    let record = vehicle_record(&json!({"vehicle": {"Mileage": 21.5}}));
    assert_eq!(record.vehicle.mileage, 21.5);
    assert_eq!(record.vehicle.mileage_alias, 21.5);

    let value = record.to_value();
    assert_eq!(value["vehicle"]["mileage"], value["vehicle"]["Mileage"]);
  }

  #[test]
  fn test_bare_vehicle_id_and_flat_fields() {
    let record = vehicle_record(&json!({
      "id": 31,
      "vehicle": 8,
      "brand": "Tata",
      "kms_driven": "42,000",
      "status": "approved"
    }));
    assert_eq!(record.id, "31");
    assert_eq!(record.vehicle.id.as_deref(), Some("8"));
    assert_eq!(record.vehicle.brand, "Tata");
    assert_eq!(record.vehicle.kms_driven, 42000);
    assert_eq!(record.status_display, "Approved");
  }

  #[test]
  fn test_status_object_and_display() {
    let record = vehicle_record(&json!({"status": {"code": "under_review"}}));
    assert_eq!(record.status, "under_review");
    assert_eq!(record.status_display, "Under Review");
  }

  #[test]
  fn test_profile_lifts_user_and_keeps_extras() {
    let p = profile(&json!({
      "id": 3,
      "user": {"username": "asha", "email": "asha@example.com", "first_name": "Asha"},
      "phone_number": "9999999999",
      "profile_picture": "/media/a.png"
    }));
    assert_eq!(p.id, "3");
    assert_eq!(p.username, "asha");
    assert_eq!(p.first_name, "Asha");
    assert_eq!(p.phone_number, "9999999999");
    assert_eq!(p.extra["profile_picture"], "/media/a.png");
    assert!(!p.extra.contains_key("user"));
  }

  #[test]
  fn test_align_synonyms_nested() {
    let aligned = align_synonyms(&json!({"vehicle": {"price": 5000}}));
    assert_eq!(aligned, json!({"vehicle": {"price": 5000, "expected_price": 5000}}));

    let aligned = align_synonyms(&json!({"Mileage": 14}));
    assert_eq!(aligned, json!({"Mileage": 14, "mileage": 14}));

    // Both present: left as given
    let both = json!({"price": 1, "expected_price": 2});
    assert_eq!(align_synonyms(&both), both);
  }

  #[test]
  fn test_nest_vehicle_fields() {
    let nested = nest_vehicle_fields(&json!({"price": 280000, "status": "approved"}));
    assert_eq!(nested, json!({"status": "approved", "vehicle": {"price": 280000}}));

    // Nested values are kept over flat ones
    let both = nest_vehicle_fields(&json!({"color": "Red", "vehicle": {"color": "Blue", "brand": "Kia"}}));
    assert_eq!(both, json!({"vehicle": {"color": "Blue", "brand": "Kia"}}));

    let bare = nest_vehicle_fields(&json!({"vehicle": 12, "kms_driven": 900}));
    assert_eq!(bare, json!({"vehicle": {"id": "12", "kms_driven": 900}}));

    assert_eq!(nest_vehicle_fields(&json!({"vehicle": 12})), json!({"vehicle": 12}));
  }

  #[test]
  fn test_deep_merge() {
    let base = json!({"id": "1", "vehicle": {"brand": "Kia", "price": 10}});
    let patch = json!({"vehicle": {"price": 20}, "status": "sold"});
    assert_eq!(
      deep_merge(&base, &patch),
      json!({"id": "1", "vehicle": {"brand": "Kia", "price": 20}, "status": "sold"})
    );
  }
}
