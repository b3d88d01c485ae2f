//! Pending-write tracking.
//!
//! A write that fails against the server for a transient reason is kept
//! locally: the record is flagged `pending` with the error, and an envelope
//! describing the request is persisted in the long-lived store so it can be
//! replayed after a restart or when connectivity returns.
//!
//! Per record the state machine is:
//!
//! ```text
//! Synced --write fails--> PendingWithError --retry succeeds--> Synced
//!                          |        ^
//!                  retry starts   retry fails
//!                          v        |
//!                        PendingWithServer --server refuses--> dropped
//! ```
//!
//! Sends for one record are serialized: while a retry is in flight,
//! further retries for that record are skipped and new writes are queued
//! behind it. A write the server refuses outright is dropped from the
//! queue instead of being replayed forever.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::client::ReconciliationClient;
use crate::api::transport::{ApiRequest, Attachment, RequestBody};
use crate::api::types::ResourceKey;
use crate::error::ApiError;
use crate::store::{DurableStores, Tier};

/// Key prefix for persisted envelopes.
pub const PENDING_PREFIX: &str = "vm_pending:";

/// Sync state of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WriteState {
  Synced,
  /// Never attempted, or an attempt is in flight
  PendingWithServer,
  /// The last attempt failed
  PendingWithError { error: String, at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WriteMethod {
  Post,
  Patch,
}

impl From<WriteMethod> for Method {
  fn from(method: WriteMethod) -> Self {
    match method {
      WriteMethod::Post => Method::POST,
      WriteMethod::Patch => Method::PATCH,
    }
  }
}

/// A write that has not been acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
  /// The record being written. New listings carry a local id.
  pub resource: ResourceKey,
  pub method: WriteMethod,
  pub path: String,
  pub body: Value,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub attachments: Vec<Attachment>,
  pub state: WriteState,
  #[serde(default)]
  pub attempts: u32,
  /// Identifies this version of the write; a newer write for the same
  /// record replaces the envelope with a later timestamp.
  pub queued_at: DateTime<Utc>,
}

impl PendingWrite {
  pub fn new(
    resource: ResourceKey,
    method: WriteMethod,
    path: impl Into<String>,
    body: Value,
    queued_at: DateTime<Utc>,
  ) -> Self {
    Self {
      resource,
      method,
      path: path.into(),
      body,
      attachments: Vec::new(),
      state: WriteState::PendingWithServer,
      attempts: 0,
      queued_at,
    }
  }

  pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
    self.attachments = attachments;
    self
  }

  /// Flag `value` with this write's state.
  pub fn mark(&self, value: &Value) -> Value {
    match &self.state {
      WriteState::PendingWithError { error, at } => mark_pending(value, error, *at),
      _ => mark_queued(value),
    }
  }

  pub fn to_request(&self) -> ApiRequest {
    let body = if self.attachments.is_empty() {
      RequestBody::Json(self.body.clone())
    } else {
      RequestBody::Multipart {
        fields: self.body.clone(),
        attachments: self.attachments.clone(),
      }
    };
    ApiRequest::new(self.method.into(), self.path.clone()).with_body(body)
  }
}

/// Flag a record value as pending with the error that caused it.
pub fn mark_pending(value: &Value, error: &str, at: DateTime<Utc>) -> Value {
  let mut value = value.clone();
  if let Value::Object(map) = &mut value {
    map.insert("pending".into(), Value::Bool(true));
    map.insert("lastError".into(), Value::String(error.to_string()));
    map.insert(
      "lastErrorTime".into(),
      serde_json::to_value(at).unwrap_or(Value::Null),
    );
  }
  value
}

/// Flag a record value as pending without an error yet.
pub fn mark_queued(value: &Value) -> Value {
  let mut value = value.clone();
  if let Value::Object(map) = &mut value {
    map.insert("pending".into(), Value::Bool(true));
  }
  value
}

/// Keep the error on a record the server refused, without the pending
/// flag; nothing is queued for it any more.
pub fn mark_rejected(value: &Value, error: &str, at: DateTime<Utc>) -> Value {
  let mut value = mark_pending(value, error, at);
  if let Value::Object(map) = &mut value {
    map.remove("pending");
  }
  value
}

/// Remove every pending field from a record value.
pub fn strip_pending(value: &Value) -> Value {
  let mut value = value.clone();
  if let Value::Object(map) = &mut value {
    map.remove("pending");
    map.remove("lastError");
    map.remove("lastErrorTime");
  }
  value
}

/// Tracks pending envelopes and which records have a retry in flight.
pub struct PendingWriteTracker {
  stores: DurableStores,
  in_flight: Mutex<HashSet<ResourceKey>>,
}

impl PendingWriteTracker {
  pub fn new(stores: DurableStores) -> Self {
    Self {
      stores,
      in_flight: Mutex::new(HashSet::new()),
    }
  }

  fn storage_key(resource: &ResourceKey) -> String {
    format!("{}{}", PENDING_PREFIX, resource.cache_key())
  }

  fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<ResourceKey>> {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn get(&self, resource: &ResourceKey) -> Option<PendingWrite> {
    self.stores.read(Tier::Local, &Self::storage_key(resource))
  }

  pub fn state(&self, resource: &ResourceKey) -> WriteState {
    if self.in_flight().contains(resource) {
      return WriteState::PendingWithServer;
    }
    self
      .get(resource)
      .map(|w| w.state)
      .unwrap_or(WriteState::Synced)
  }

  /// Every persisted envelope, oldest first.
  pub fn pending(&self) -> Vec<PendingWrite> {
    let mut writes: Vec<PendingWrite> = self
      .stores
      .keys_with_prefix(Tier::Local, PENDING_PREFIX)
      .iter()
      .filter_map(|key| self.stores.read(Tier::Local, key))
      .collect();
    writes.sort_by_key(|w| w.queued_at);
    writes
  }

  /// True when an envelope newer than `write` is already stored.
  fn superseded(&self, write: &PendingWrite) -> bool {
    self
      .get(&write.resource)
      .is_some_and(|current| current.queued_at > write.queued_at)
  }

  /// Record a failed attempt for `write`.
  ///
  /// Returns the persisted envelope, or `None` when a newer write for the
  /// same record has replaced this one in the meantime.
  pub fn fail(
    &self,
    mut write: PendingWrite,
    error: &ApiError,
    at: DateTime<Utc>,
  ) -> Option<PendingWrite> {
    if self.superseded(&write) {
      debug!(resource = %write.resource, "failed write superseded by a newer one");
      return None;
    }

    write.attempts += 1;
    write.state = WriteState::PendingWithError {
      error: error.to_string(),
      at,
    };
    self
      .stores
      .write(Tier::Local, &Self::storage_key(&write.resource), &write);
    Some(write)
  }

  /// Persist `write` unsent, to go out after the attempt in flight.
  pub fn queue(&self, mut write: PendingWrite) -> Option<PendingWrite> {
    if self.superseded(&write) {
      return None;
    }
    write.state = WriteState::PendingWithServer;
    self
      .stores
      .write(Tier::Local, &Self::storage_key(&write.resource), &write);
    Some(write)
  }

  /// The write queued at `queued_at` was acknowledged or refused. An
  /// envelope of that version or older is removed; a newer write for the
  /// same record stays pending.
  pub fn complete(&self, resource: &ResourceKey, queued_at: DateTime<Utc>) -> bool {
    match self.get(resource) {
      Some(current) if current.queued_at <= queued_at => {
        self.stores.remove(Tier::Local, &Self::storage_key(resource));
        true
      }
      _ => false,
    }
  }

  /// Claim the right to send a write for `resource`. `None` if one is
  /// already in flight. The claim is released when the guard drops.
  pub fn try_begin(&self, resource: &ResourceKey) -> Option<InFlight<'_>> {
    if !self.in_flight().insert(resource.clone()) {
      return None;
    }
    Some(InFlight {
      tracker: self,
      resource: resource.clone(),
    })
  }
}

/// Guard for a send in flight.
pub struct InFlight<'a> {
  tracker: &'a PendingWriteTracker,
  resource: ResourceKey,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.tracker.in_flight().remove(&self.resource);
  }
}

/// Retry every pending write once each time `online` flips from false to
/// true.
pub fn spawn_reconnect_retries(
  client: Arc<ReconciliationClient>,
  mut online: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut was_online = *online.borrow_and_update();
    while online.changed().await.is_ok() {
      let is_online = *online.borrow_and_update();
      if is_online && !was_online {
        info!("connectivity restored, retrying pending writes");
        let summary = client.resume_pending().await;
        info!(
          synced = summary.synced,
          failed = summary.failed,
          rejected = summary.rejected,
          skipped = summary.skipped,
          "reconnect retry finished"
        );
      }
      was_online = is_online;
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn write_at(at: DateTime<Utc>) -> PendingWrite {
    PendingWrite::new(
      ResourceKey::profile(),
      WriteMethod::Patch,
      "/accounts/profile/",
      json!({"city": "Pune"}),
      at,
    )
  }

  #[test]
  fn test_failure_then_complete() {
    let tracker = PendingWriteTracker::new(DurableStores::in_memory());
    let now = Utc::now();
    let resource = ResourceKey::profile();

    assert_eq!(tracker.state(&resource), WriteState::Synced);

    let stored = tracker
      .fail(write_at(now), &ApiError::Transient("offline".into()), now)
      .unwrap();
    assert_eq!(stored.attempts, 1);
    assert!(matches!(
      tracker.state(&resource),
      WriteState::PendingWithError { .. }
    ));
    assert_eq!(tracker.pending().len(), 1);

    assert!(tracker.complete(&resource, now));
    assert_eq!(tracker.state(&resource), WriteState::Synced);
    assert!(tracker.pending().is_empty());
  }

  #[test]
  fn test_newer_write_survives_older_completion() {
    let tracker = PendingWriteTracker::new(DurableStores::in_memory());
    let older = Utc::now();
    let newer = older + Duration::seconds(5);
    let err = ApiError::Transient("offline".into());

    tracker.fail(write_at(older), &err, older);
    tracker.fail(write_at(newer), &err, newer);

    // A late failure of the older version must not clobber the newer one
    assert!(tracker.fail(write_at(older), &err, newer).is_none());
    assert!(!tracker.complete(&ResourceKey::profile(), older));
    assert_eq!(
      tracker.get(&ResourceKey::profile()).unwrap().queued_at,
      newer
    );
  }

  #[test]
  fn test_completion_covers_older_versions_only() {
    let tracker = PendingWriteTracker::new(DurableStores::in_memory());
    let queued = Utc::now();
    let resource = ResourceKey::profile();
    tracker.queue(write_at(queued)).unwrap();

    assert!(!tracker.complete(&resource, queued - Duration::seconds(1)));
    // A newer version folded this one in, so its ack covers it
    assert!(tracker.complete(&resource, queued + Duration::seconds(1)));
    assert!(tracker.get(&resource).is_none());
  }

  #[test]
  fn test_queue_refuses_older_version() {
    let tracker = PendingWriteTracker::new(DurableStores::in_memory());
    let older = Utc::now();
    let newer = older + Duration::seconds(2);

    let queued = tracker.queue(write_at(newer)).unwrap();
    assert_eq!(queued.state, WriteState::PendingWithServer);
    assert!(tracker.queue(write_at(older)).is_none());
    assert_eq!(tracker.get(&ResourceKey::profile()).unwrap().queued_at, newer);
  }

  #[test]
  fn test_in_flight_guard_serializes() {
    let tracker = PendingWriteTracker::new(DurableStores::in_memory());
    let resource = ResourceKey::vehicle("4");

    let guard = tracker.try_begin(&resource).unwrap();
    assert!(tracker.try_begin(&resource).is_none());
    assert_eq!(tracker.state(&resource), WriteState::PendingWithServer);
    // Other records are independent
    assert!(tracker.try_begin(&ResourceKey::vehicle("5")).is_some());

    drop(guard);
    assert!(tracker.try_begin(&resource).is_some());
  }

  #[test]
  fn test_pending_markers() {
    let at = Utc::now();
    let marked = mark_pending(&json!({"id": "1"}), "timed out", at);
    assert_eq!(marked["pending"], true);
    assert_eq!(marked["lastError"], "timed out");

    let clean = strip_pending(&marked);
    assert_eq!(clean, json!({"id": "1"}));

    let rejected = mark_rejected(&marked, "phone_number: invalid", at);
    assert!(rejected.get("pending").is_none());
    assert_eq!(rejected["lastError"], "phone_number: invalid");

    let queued = write_at(at);
    assert_eq!(queued.mark(&json!({"id": "1"})), json!({"id": "1", "pending": true}));
  }

  #[test]
  fn test_multipart_request_when_attachments_present() {
    let write = PendingWrite::new(
      ResourceKey::sell_request("local-1"),
      WriteMethod::Post,
      "/marketplace/sell-requests/",
      json!({"vehicle": {"brand": "Kia"}}),
      Utc::now(),
    )
    .with_attachments(vec![Attachment {
      field: "photos".into(),
      path: "front.jpg".into(),
      content_type: Some("image/jpeg".into()),
    }]);

    let request = write.to_request();
    assert_eq!(request.method, Method::POST);
    assert!(matches!(request.body, RequestBody::Multipart { .. }));
  }
}
