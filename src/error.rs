//! Error taxonomy for the store, cache and client layers.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Field-level error detail, keyed by (possibly dotted) field name.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Errors surfaced by the reconciliation client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
  /// No token, or the server rejected it (401/403)
  #[error("authentication required: {0}")]
  AuthRequired(String),

  /// Resource deleted server-side (404)
  #[error("not found: {0}")]
  NotFound(String),

  /// Duplicate resource, e.g. a registration number that is already listed
  #[error("conflict: {message}")]
  Conflict { message: String, fields: FieldErrors },

  /// Timeout, 5xx, offline. Served from cache or retried.
  #[error("transient failure: {0}")]
  Transient(String),

  /// 4xx field errors, flattened into a readable message
  #[error("{message}")]
  Validation { message: String, fields: FieldErrors },
}

impl ApiError {
  /// Classify a non-success HTTP response.
  pub fn from_status(status: u16, body: &Value) -> Self {
    match status {
      401 | 403 => ApiError::AuthRequired(detail_or(body, "credentials rejected")),
      404 => ApiError::NotFound(detail_or(body, "resource does not exist")),
      408 | 429 => ApiError::Transient(format!("server asked to retry (status {})", status)),
      500..=599 => ApiError::Transient(format!("server error (status {})", status)),
      _ => {
        let (message, fields) = flatten_field_errors(body);
        let message = if message.is_empty() {
          format!("request failed with status {}", status)
        } else {
          message
        };

        if status == 409 || mentions_duplicate(&fields) {
          ApiError::Conflict { message, fields }
        } else {
          ApiError::Validation { message, fields }
        }
      }
    }
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, ApiError::Transient(_))
  }

  /// Errors after which polling a resource can never succeed again
  /// without user action.
  pub fn is_terminal(&self) -> bool {
    matches!(self, ApiError::AuthRequired(_) | ApiError::NotFound(_))
  }
}

/// Errors raised by the durable stores. Always logged and swallowed by
/// the adapter, never surfaced to callers of the client.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("lock poisoned: {0}")]
  LockPoisoned(String),

  #[error("storage quota exceeded ({used} of {limit} bytes)")]
  QuotaExceeded { used: usize, limit: usize },

  #[error("storage unavailable: {0}")]
  Unavailable(String),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
  fn from(e: std::sync::PoisonError<T>) -> Self {
    StoreError::LockPoisoned(e.to_string())
  }
}

fn detail_or(body: &Value, fallback: &str) -> String {
  body
    .get("detail")
    .and_then(Value::as_str)
    .unwrap_or(fallback)
    .to_string()
}

fn mentions_duplicate(fields: &FieldErrors) -> bool {
  fields
    .values()
    .flatten()
    .any(|m| m.to_lowercase().contains("already exists"))
}

/// Flatten a DRF-style error body into `"field: msg; field: msg"` while
/// keeping the per-field detail.
///
/// `detail` and `non_field_errors` are reported without a field prefix.
pub fn flatten_field_errors(body: &Value) -> (String, FieldErrors) {
  let mut fields = FieldErrors::new();
  collect_field_errors("", body, &mut fields);

  let message = fields
    .iter()
    .flat_map(|(field, messages)| {
      messages.iter().map(move |m| {
        if field.is_empty() || field == "detail" || field == "non_field_errors" {
          m.clone()
        } else {
          format!("{}: {}", field, m)
        }
      })
    })
    .collect::<Vec<_>>()
    .join("; ");

  (message, fields)
}

fn collect_field_errors(path: &str, value: &Value, out: &mut FieldErrors) {
  match value {
    Value::Object(map) => {
      for (k, v) in map {
        let child = if path.is_empty() {
          k.clone()
        } else {
          format!("{}.{}", path, k)
        };
        collect_field_errors(&child, v, out);
      }
    }
    Value::Array(items) => {
      for item in items {
        match item {
          Value::Object(_) | Value::Array(_) => collect_field_errors(path, item, out),
          other => push_message(path, other, out),
        }
      }
    }
    Value::Null => {}
    other => push_message(path, other, out),
  }
}

fn push_message(path: &str, value: &Value, out: &mut FieldErrors) {
  let message = match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  };
  out.entry(path.to_string()).or_default().push(message);
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_status_classification() {
    assert!(matches!(
      ApiError::from_status(401, &Value::Null),
      ApiError::AuthRequired(_)
    ));
    assert!(matches!(
      ApiError::from_status(403, &Value::Null),
      ApiError::AuthRequired(_)
    ));
    assert!(matches!(
      ApiError::from_status(404, &Value::Null),
      ApiError::NotFound(_)
    ));
    assert!(ApiError::from_status(503, &Value::Null).is_transient());
    assert!(ApiError::from_status(429, &Value::Null).is_transient());
    assert!(matches!(
      ApiError::from_status(409, &Value::Null),
      ApiError::Conflict { .. }
    ));
  }

  #[test]
  fn test_validation_flattens_fields() {
    let body = json!({
      "brand": ["This field is required."],
      "vehicle": {"year": ["Ensure this value is less than 2100."]},
      "non_field_errors": ["Listing is incomplete."]
    });

    match ApiError::from_status(400, &body) {
      ApiError::Validation { message, fields } => {
        assert_eq!(
          message,
          "brand: This field is required.; Listing is incomplete.; vehicle.year: Ensure this value is less than 2100."
        );
        assert_eq!(fields["vehicle.year"].len(), 1);
        assert!(fields.contains_key("non_field_errors"));
      }
      other => panic!("expected validation error, got {:?}", other),
    }
  }

  #[test]
  fn test_duplicate_registration_is_conflict() {
    let body = json!({
      "registration_number": ["vehicle with this registration number already exists."]
    });
    assert!(matches!(
      ApiError::from_status(400, &body),
      ApiError::Conflict { .. }
    ));
  }

  #[test]
  fn test_empty_body_message() {
    match ApiError::from_status(422, &Value::Null) {
      ApiError::Validation { message, .. } => {
        assert_eq!(message, "request failed with status 422")
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn test_terminal_errors() {
    assert!(ApiError::NotFound("x".into()).is_terminal());
    assert!(ApiError::AuthRequired("x".into()).is_terminal());
    assert!(!ApiError::Transient("x".into()).is_terminal());
  }
}
