//! Reconciliation client: fetch-or-serve-cached reads and pending-aware
//! writes against the marketplace API.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::enrich::{align_synonyms, deep_merge, nest_vehicle_fields};
use super::transport::{ApiRequest, ApiResponse, Attachment, Transport};
use super::types::{Record, ResourceKey, ResourceKind, UserProfile, VehicleRecord};
use crate::cache::{CacheSource, Fetched, TtlCache};
use crate::clock::{Clock, SystemClock};
use crate::error::ApiError;
use crate::events::{ChangeEvent, SubscriptionRegistry};
use crate::pending::{
  mark_pending, mark_queued, mark_rejected, strip_pending, PendingWrite, PendingWriteTracker,
  WriteMethod,
};
use crate::poller::{ChangeProbe, ProbeOutcome};
use crate::store::{DurableStores, Tier};

/// Key prefix for long-lived record copies.
pub const RECORD_PREFIX: &str = "vm_record:";

/// Long-lived store key holding the bearer token.
pub const DEFAULT_TOKEN_KEY: &str = "access_token";

#[derive(Debug, Clone)]
pub struct ClientConfig {
  /// Ceiling for each individual network call
  pub request_timeout: Duration,
  pub token_key: String,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      request_timeout: Duration::from_secs(10),
      token_key: DEFAULT_TOKEN_KEY.to_string(),
    }
  }
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome<R> {
  /// Acknowledged by the server; holds the server's canonical record
  Synced(R),
  /// Kept locally and queued for retry
  Pending(R),
}

impl<R> SaveOutcome<R> {
  pub fn record(&self) -> &R {
    match self {
      Self::Synced(r) | Self::Pending(r) => r,
    }
  }

  pub fn into_record(self) -> R {
    match self {
      Self::Synced(r) | Self::Pending(r) => r,
    }
  }

  pub fn is_pending(&self) -> bool {
    matches!(self, Self::Pending(_))
  }
}

/// Counts from one pass over the pending writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
  pub synced: usize,
  pub failed: usize,
  /// Refused by the server and dropped from the queue
  pub rejected: usize,
  pub skipped: usize,
}

enum RetryResult {
  Synced,
  Failed,
  Rejected,
  Skipped,
}

fn record_key(resource: &ResourceKey) -> String {
  format!("{}{}", RECORD_PREFIX, resource.cache_key())
}

/// Client that keeps every read and write reconciled with the local tiers.
///
/// Records are never mutated in place: every merge produces a new value,
/// which is normalized and then written through the TTL cache and the
/// durable stores.
pub struct ReconciliationClient {
  transport: Arc<dyn Transport>,
  cache: TtlCache,
  stores: DurableStores,
  pending: PendingWriteTracker,
  subscriptions: Arc<SubscriptionRegistry>,
  clock: Arc<dyn Clock>,
  config: ClientConfig,
}

impl ReconciliationClient {
  pub fn new(transport: Arc<dyn Transport>, stores: DurableStores) -> Self {
    Self {
      transport,
      cache: TtlCache::new(stores.clone()),
      pending: PendingWriteTracker::new(stores.clone()),
      stores,
      subscriptions: Arc::new(SubscriptionRegistry::new()),
      clock: Arc::new(SystemClock),
      config: ClientConfig::default(),
    }
  }

  /// Replace the TTL cache, e.g. to change its prefix or max age.
  pub fn with_cache(mut self, cache: TtlCache) -> Self {
    self.cache = cache;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_config(mut self, config: ClientConfig) -> Self {
    self.config = config;
    self
  }

  pub fn cache(&self) -> &TtlCache {
    &self.cache
  }

  pub fn pending(&self) -> &PendingWriteTracker {
    &self.pending
  }

  /// Registry notified whenever a resource gets a new canonical value.
  pub fn subscriptions(&self) -> Arc<SubscriptionRegistry> {
    Arc::clone(&self.subscriptions)
  }

  pub fn store_token(&self, token: &str) -> bool {
    self
      .stores
      .write_raw(Tier::Local, &self.config.token_key, token)
  }

  pub fn clear_token(&self) {
    self.stores.remove(Tier::Local, &self.config.token_key);
  }

  /// Read on every call so a logout elsewhere takes effect immediately.
  fn bearer_token(&self) -> Result<String, ApiError> {
    self
      .stores
      .read_raw(Tier::Local, &self.config.token_key)
      .filter(|t| !t.trim().is_empty())
      .ok_or_else(|| ApiError::AuthRequired("no access token stored".into()))
  }

  /// Send with auth and timeout. Success and 304 come back as responses,
  /// every other status as a classified error.
  async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
    request.bearer = Some(self.bearer_token()?);

    let label = format!("{} {}", request.method, request.path);
    let response =
      match tokio::time::timeout(self.config.request_timeout, self.transport.send(request)).await
      {
        Ok(result) => result?,
        Err(_) => {
          return Err(ApiError::Transient(format!(
            "{} timed out after {:?}",
            label, self.config.request_timeout
          )))
        }
      };

    debug!(request = %label, status = response.status, "response received");
    if response.is_success() || response.is_not_modified() {
      Ok(response)
    } else {
      Err(ApiError::from_status(response.status, &response.body))
    }
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Fetch a resource, serving local copies first.
  ///
  /// 1. Unless forced, return the long-lived local copy if there is one
  /// 2. Return a TTL cache hit
  /// 3. Conditional GET with the cached validator
  /// 4. 304 returns the cached value unchanged
  /// 5. 200 is normalized, cached, persisted and announced
  ///
  /// Transient failures fall back to the newest copy we still hold.
  pub async fn fetch_resource<R: Record>(
    &self,
    key: &ResourceKey,
    force_refresh: bool,
  ) -> Result<Fetched<R>, ApiError> {
    let fetched = if force_refresh {
      self.refresh_value(key).await?
    } else {
      self.fetch_value(key).await?
    };
    Ok(fetched.map(|value| R::enrich(&value)))
  }

  /// Discard every local copy of `key` and fetch it again from scratch.
  pub async fn force_refresh<R: Record>(&self, key: &ResourceKey) -> Result<R, ApiError> {
    let fetched = self.refresh_value(key).await?;
    Ok(R::enrich(&fetched.data))
  }

  /// The newest local copy of `key`, without touching the network.
  pub fn cached<R: Record>(&self, key: &ResourceKey) -> Option<R> {
    self.newest_copy(key).map(|value| R::enrich(&value))
  }

  async fn fetch_value(&self, key: &ResourceKey) -> Result<Fetched<Value>, ApiError> {
    if let Some(local) = self.stores.read::<Value>(Tier::Local, &record_key(key)) {
      debug!(%key, "serving long-lived local copy");
      return Ok(Fetched::from_cache(local, CacheSource::LocalStore, None));
    }

    let cache_key = key.cache_key();
    if let Some(entry) = self.cache.get(&cache_key) {
      debug!(%key, "cache hit");
      return Ok(Fetched::from_cache(
        entry.value,
        CacheSource::Cache,
        Some(entry.written_at),
      ));
    }

    let stale = self.cache.peek(&cache_key);
    let validator = stale.as_ref().and_then(|e| e.validator.clone());
    let request = ApiRequest::get(key.path()).with_validator(validator);

    match self.send(request).await {
      Ok(response) if response.is_not_modified() => match stale {
        Some(entry) => {
          debug!(%key, "not modified, renewing cached copy");
          // Restart the TTL; the value itself is returned untouched
          self
            .cache
            .set(&cache_key, entry.value.clone(), entry.validator.clone());
          Ok(Fetched::from_cache(
            entry.value,
            CacheSource::NotModified,
            Some(entry.written_at),
          ))
        }
        None => Err(ApiError::Transient(format!(
          "{} answered 304 but no cached copy exists",
          key
        ))),
      },
      Ok(response) => {
        let event = self.store_fresh(key, &response);
        self.subscriptions.notify(&event);
        Ok(Fetched::from_network(event.value))
      }
      Err(e) => self.fall_back(key, e),
    }
  }

  async fn refresh_value(&self, key: &ResourceKey) -> Result<Fetched<Value>, ApiError> {
    if self.pending.get(key).is_some() {
      // The local record holds a change the server has not seen yet
      self.cache.clear(&key.cache_key());
    } else {
      self.purge(key);
    }

    match self.send(ApiRequest::get(key.path())).await {
      Ok(response) => {
        let event = self.store_fresh(key, &response);
        self.subscriptions.notify(&event);
        Ok(Fetched::from_network(event.value))
      }
      Err(e) => self.fall_back(key, e),
    }
  }

  /// Normalize a server payload and write it through every tier.
  fn store_fresh(&self, key: &ResourceKey, response: &ApiResponse) -> ChangeEvent {
    let value = self.reconcile(key, &response.body);
    self.store_value(key, value, response.etag.clone())
  }

  fn store_value(&self, key: &ResourceKey, value: Value, validator: Option<String>) -> ChangeEvent {
    self
      .cache
      .set(&key.cache_key(), value.clone(), validator.clone());
    self.persist_record(key, &value);

    ChangeEvent {
      resource: key.clone(),
      value,
      validator,
    }
  }

  /// Canonical value of a server copy of `key`.
  ///
  /// While a write for `key` is still queued, its body is laid over the
  /// server fields and the record stays flagged pending, so a read never
  /// undoes a local change the server has not acknowledged.
  fn reconcile(&self, key: &ResourceKey, body: &Value) -> Value {
    let server = strip_pending(&key.kind.enrich_value(body));
    match self.pending.get(key) {
      Some(write) => {
        debug!(%key, "write still queued, keeping local changes over the server copy");
        write.mark(&key.kind.enrich_value(&deep_merge(&server, &write.body)))
      }
      None => server,
    }
  }

  fn persist_record(&self, key: &ResourceKey, value: &Value) {
    self.stores.write(Tier::Local, &record_key(key), value);
    self.stores.write_object(&key.cache_key(), value);
  }

  /// Drop every local copy of `key`.
  pub fn purge(&self, key: &ResourceKey) {
    self.cache.clear(&key.cache_key());
    self.stores.remove(Tier::Local, &record_key(key));
    self.stores.remove_object(&key.cache_key());
  }

  /// Newest copy in any tier: long-lived record, cache entry (even
  /// expired), then the object store.
  fn newest_copy(&self, key: &ResourceKey) -> Option<Value> {
    self
      .stores
      .read::<Value>(Tier::Local, &record_key(key))
      .or_else(|| self.cache.peek(&key.cache_key()).map(|e| e.value))
      .or_else(|| self.stores.read_object(&key.cache_key()))
  }

  fn fall_back(&self, key: &ResourceKey, error: ApiError) -> Result<Fetched<Value>, ApiError> {
    match &error {
      ApiError::Transient(reason) => {
        let cache_key = key.cache_key();
        if let Some(entry) = self.cache.peek(&cache_key) {
          warn!(%key, %reason, "network unavailable, serving cached copy");
          return Ok(Fetched::offline(entry.value, Some(entry.written_at)));
        }
        if let Some(value) = self
          .stores
          .read::<Value>(Tier::Local, &record_key(key))
          .or_else(|| self.stores.read_object(&cache_key))
        {
          warn!(%key, %reason, "network unavailable, serving durable copy");
          return Ok(Fetched::offline(value, None));
        }
        Err(error)
      }
      ApiError::NotFound(_) => {
        info!(%key, "resource gone, purging local copies and subscriptions");
        if self.pending.get(key).is_none() {
          self.purge(key);
        }
        self.subscriptions.remove_resource(key);
        Err(error)
      }
      _ => Err(error),
    }
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Save the signed-in user's profile.
  pub async fn save_profile(
    &self,
    profile: &UserProfile,
  ) -> Result<SaveOutcome<UserProfile>, ApiError> {
    let key = ResourceKey::profile();
    let body = strip_pending(&UserProfile::enrich(&profile.to_value()).to_value());
    let write = PendingWrite::new(
      key.clone(),
      WriteMethod::Patch,
      key.path(),
      body.clone(),
      self.clock.now(),
    );

    let outcome = self.submit_write(write, body).await?;
    Ok(typed(outcome))
  }

  /// Submit a new listing for sale, with optional photos and documents.
  ///
  /// A duplicate registration number is not an error: the existing
  /// vehicle is looked up and returned instead.
  pub async fn submit_listing(
    &self,
    listing: &VehicleRecord,
    attachments: Vec<Attachment>,
  ) -> Result<SaveOutcome<VehicleRecord>, ApiError> {
    let now = self.clock.now();
    let outbound = strip_pending(&VehicleRecord::enrich(&listing.to_value()).to_value());
    let registration = listing.vehicle.registration_number.clone();

    let id = if listing.id.is_empty() {
      local_id(&registration, now)
    } else {
      listing.id.clone()
    };
    let key = ResourceKey::sell_request(id.clone());

    let mut body = outbound.clone();
    if let Value::Object(map) = &mut body {
      map.remove("id");
      map.remove("status");
      map.remove("status_display");
    }

    let mut optimistic = outbound;
    if let Value::Object(map) = &mut optimistic {
      map.insert("id".into(), Value::String(id));
    }

    let write = PendingWrite::new(
      key,
      WriteMethod::Post,
      ResourceKind::SellRequest.collection_path(),
      body,
      now,
    )
    .with_attachments(attachments);

    match self.submit_write(write, optimistic).await {
      Err(ApiError::Conflict { message, fields }) => {
        info!(%registration, "duplicate listing, reusing the existing vehicle");
        match self.adopt_existing(&registration).await? {
          Some(value) => Ok(SaveOutcome::Synced(VehicleRecord::enrich(&value))),
          None => Err(ApiError::Conflict { message, fields }),
        }
      }
      other => other.map(typed),
    }
  }

  /// Apply a partial update to a vehicle.
  ///
  /// Vehicle fields given flat are moved under `vehicle` and synonym
  /// fields are aligned, so setting `price` also sets `expected_price`.
  /// The patch is merged over the current copy into a new record.
  pub async fn update_vehicle(
    &self,
    id: &str,
    patch: &Value,
  ) -> Result<SaveOutcome<VehicleRecord>, ApiError> {
    let key = ResourceKey::vehicle(id);
    let patch = align_synonyms(&nest_vehicle_fields(patch));
    let base = self.newest_copy(&key).unwrap_or(Value::Null);
    let merged = strip_pending(&key.kind.enrich_value(&deep_merge(&base, &patch)));

    let write = PendingWrite::new(
      key.clone(),
      WriteMethod::Patch,
      key.path(),
      patch,
      self.clock.now(),
    );

    let outcome = self.submit_write(write, merged).await?;
    Ok(typed(outcome))
  }

  async fn submit_write(
    &self,
    mut write: PendingWrite,
    optimistic: Value,
  ) -> Result<SaveOutcome<Value>, ApiError> {
    if let Some(existing) = self.pending.get(&write.resource) {
      // Fold an unsent older patch into this one so nothing is lost
      if write.method == WriteMethod::Patch && existing.method == WriteMethod::Patch {
        write.body = deep_merge(&existing.body, &write.body);
      }
      // Versions stay strictly ordered even if the clock has not moved
      write.queued_at = write
        .queued_at
        .max(existing.queued_at + chrono::Duration::milliseconds(1));
    }

    let Some(_in_flight) = self.pending.try_begin(&write.resource) else {
      return Ok(self.queue_behind(write, &optimistic));
    };

    match self.send(write.to_request()).await {
      Ok(response) => {
        self.pending.complete(&write.resource, write.queued_at);
        let event = self.settle(&write.resource, &response);
        self.subscriptions.notify(&event);
        Ok(SaveOutcome::Synced(event.value))
      }
      Err(e) if e.is_transient() => {
        let at = self.clock.now();
        let resource = write.resource.clone();
        info!(%resource, error = %e, "write kept locally as pending");
        let value = match self.pending.fail(write, &e, at) {
          Some(_) => self.persist_pending(&resource, &optimistic, &e, at),
          // A newer write was queued meanwhile and owns the record
          None => self.newest_copy(&resource).unwrap_or(optimistic),
        };
        Ok(SaveOutcome::Pending(value))
      }
      Err(e) => Err(e),
    }
  }

  /// Keep `write` locally until the send in flight for the same record
  /// finishes. A retry holding the record sends it next, otherwise the
  /// next pass over the pending writes does.
  fn queue_behind(&self, write: PendingWrite, optimistic: &Value) -> SaveOutcome<Value> {
    let key = write.resource.clone();
    let value = mark_queued(&strip_pending(&key.kind.enrich_value(optimistic)));
    self.cache.set(&key.cache_key(), value.clone(), None);
    self.persist_record(&key, &value);
    info!(resource = %key, "send in flight, write queued behind it");
    self.pending.queue(write);
    SaveOutcome::Pending(value)
  }

  /// Store a server acknowledgement. New listings move from their local id
  /// to the id the server assigned.
  fn settle(&self, written: &ResourceKey, response: &ApiResponse) -> ChangeEvent {
    let server_key = match written.kind {
      ResourceKind::Profile => written.clone(),
      kind => response
        .body
        .get("id")
        .and_then(|id| match id {
          Value::String(s) if !s.is_empty() => Some(s.clone()),
          Value::Number(n) => Some(n.to_string()),
          _ => None,
        })
        .map(|id| ResourceKey::new(kind, id))
        .unwrap_or_else(|| written.clone()),
    };

    if &server_key != written {
      debug!(from = %written, to = %server_key, "record got its server id");
      self.purge(written);
    }
    self.store_fresh(&server_key, response)
  }

  fn persist_pending(
    &self,
    key: &ResourceKey,
    record: &Value,
    error: &ApiError,
    at: DateTime<Utc>,
  ) -> Value {
    let value = mark_pending(&key.kind.enrich_value(record), &error.to_string(), at);
    self.cache.set(&key.cache_key(), value.clone(), None);
    self.persist_record(key, &value);
    value
  }

  /// Look up a listed vehicle by registration number and cache it.
  async fn adopt_existing(&self, registration: &str) -> Result<Option<Value>, ApiError> {
    let request = ApiRequest::get(ResourceKind::Vehicle.collection_path())
      .with_query("registration_number", registration);
    let response = self.send(request).await?;

    let candidates = match &response.body {
      Value::Array(items) => items.as_slice(),
      Value::Object(map) => map
        .get("results")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default(),
      _ => &[],
    };

    let wanted = normalize_registration(registration);
    let found = candidates.iter().find(|item| {
      let record = VehicleRecord::enrich(item);
      normalize_registration(&record.vehicle.registration_number) == wanted
    });

    Ok(found.map(|item| {
      let record = VehicleRecord::enrich(item);
      let key = ResourceKey::vehicle(record.id);
      let existing = ApiResponse {
        status: 200,
        etag: None,
        body: item.clone(),
      };
      let event = self.store_fresh(&key, &existing);
      self.subscriptions.notify(&event);
      event.value
    }))
  }

  // ==========================================================================
  // Retries
  // ==========================================================================

  /// Retry every pending write once. Called on start and on reconnect.
  pub async fn resume_pending(&self) -> RetrySummary {
    let mut summary = RetrySummary::default();
    for write in self.pending.pending() {
      match self.retry(&write.resource).await {
        RetryResult::Synced => summary.synced += 1,
        RetryResult::Failed => summary.failed += 1,
        RetryResult::Rejected => summary.rejected += 1,
        RetryResult::Skipped => summary.skipped += 1,
      }
    }
    summary
  }

  async fn retry(&self, resource: &ResourceKey) -> RetryResult {
    let Some(_in_flight) = self.pending.try_begin(resource) else {
      debug!(%resource, "retry already in flight");
      return RetryResult::Skipped;
    };

    // Re-read under the claim; a concurrent write may have settled it.
    // Writes queued behind this claim go out in order after it.
    let mut result = RetryResult::Skipped;
    let mut last_sent = None;
    while let Some(write) = self.pending.get(resource) {
      if last_sent.is_some_and(|at| write.queued_at <= at) {
        break;
      }
      last_sent = Some(write.queued_at);
      result = self.replay(resource, write).await;
      if !matches!(result, RetryResult::Synced) {
        break;
      }
    }
    result
  }

  async fn replay(&self, resource: &ResourceKey, write: PendingWrite) -> RetryResult {
    let result = match self.send(write.to_request()).await {
      Err(ApiError::Conflict { message, fields })
        if write.method == WriteMethod::Post && write.resource.kind == ResourceKind::SellRequest =>
      {
        let registration = VehicleRecord::enrich(&write.body).vehicle.registration_number;
        match self.adopt_existing(&registration).await {
          Ok(Some(_)) => {
            self.purge(resource);
            Ok(None)
          }
          Ok(None) => Err(ApiError::Conflict { message, fields }),
          Err(e) => Err(e),
        }
      }
      other => other.map(Some),
    };

    match result {
      Ok(response) => {
        self.pending.complete(resource, write.queued_at);
        if let Some(response) = response {
          let event = self.settle(resource, &response);
          self.subscriptions.notify(&event);
        }
        info!(%resource, attempts = write.attempts + 1, "pending write synced");
        RetryResult::Synced
      }
      Err(e @ (ApiError::Transient(_) | ApiError::AuthRequired(_))) => {
        let at = self.clock.now();
        let attempts = write.attempts + 1;
        if self.pending.fail(write, &e, at).is_some() {
          if let Some(current) = self.newest_copy(resource) {
            self.persist_pending(resource, &current, &e, at);
          }
        }
        warn!(%resource, attempts, error = %e, "retry failed, write stays pending");
        RetryResult::Failed
      }
      Err(e) => {
        // Replaying a refused write cannot succeed
        if self.pending.complete(resource, write.queued_at) {
          if let Some(current) = self.newest_copy(resource) {
            let value = mark_rejected(&current, &e.to_string(), self.clock.now());
            self.cache.set(&resource.cache_key(), value.clone(), None);
            self.persist_record(resource, &value);
          }
        }
        warn!(%resource, error = %e, "server refused pending write, dropped from the queue");
        RetryResult::Rejected
      }
    }
  }

  // ==========================================================================
  // Change detection
  // ==========================================================================

  /// Ask the server whether `key` changed since the cached validator.
  ///
  /// A changed resource is written through every tier; announcing it is
  /// left to the caller.
  pub async fn check_for_change(&self, key: &ResourceKey) -> Result<ProbeOutcome, ApiError> {
    let previous = self.cache.peek(&key.cache_key());
    let validator = previous.as_ref().and_then(|e| e.validator.clone());

    let response = match self
      .send(ApiRequest::get(key.path()).with_validator(validator.clone()))
      .await
    {
      Ok(response) => response,
      Err(e) => {
        if matches!(e, ApiError::NotFound(_)) && self.pending.get(key).is_none() {
          self.purge(key);
        }
        return Err(e);
      }
    };

    if response.is_not_modified() || (validator.is_some() && response.etag == validator) {
      return Ok(ProbeOutcome::Unchanged);
    }

    let normalized = self.reconcile(key, &response.body);
    if previous.is_some_and(|p| p.value == normalized) {
      // Same content without a validator; just refresh the entry
      self
        .cache
        .set(&key.cache_key(), normalized, response.etag.clone());
      return Ok(ProbeOutcome::Unchanged);
    }

    Ok(ProbeOutcome::Changed(self.store_value(
      key,
      normalized,
      response.etag.clone(),
    )))
  }
}

impl ChangeProbe for ReconciliationClient {
  fn probe<'a>(&'a self, resource: &'a ResourceKey) -> BoxFuture<'a, Result<ProbeOutcome, ApiError>> {
    Box::pin(self.check_for_change(resource))
  }
}

fn typed<R: Record>(outcome: SaveOutcome<Value>) -> SaveOutcome<R> {
  match outcome {
    SaveOutcome::Synced(v) => SaveOutcome::Synced(R::enrich(&v)),
    SaveOutcome::Pending(v) => SaveOutcome::Pending(R::enrich(&v)),
  }
}

fn normalize_registration(registration: &str) -> String {
  registration
    .chars()
    .filter(|c| c.is_ascii_alphanumeric())
    .map(|c| c.to_ascii_uppercase())
    .collect()
}

/// Id for a listing the server has not seen yet.
fn local_id(registration: &str, at: DateTime<Utc>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(registration.as_bytes());
  hasher.update(at.to_rfc3339().as_bytes());
  let digest = hex::encode(hasher.finalize());
  format!("local-{}", &digest[..12])
}
