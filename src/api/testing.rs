//! Scripted transport for tests.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

use super::transport::{ApiRequest, ApiResponse, Transport};
use crate::error::ApiError;

/// Replays queued responses in order and records every request.
///
/// While offline, requests fail as transient without consuming the queue.
#[derive(Default)]
pub struct MockTransport {
  responses: Mutex<VecDeque<Result<ApiResponse, ApiError>>>,
  requests: Mutex<Vec<ApiRequest>>,
  offline: AtomicBool,
  held: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&self, status: u16, etag: Option<&str>, body: Value) {
    self.responses.lock().unwrap().push_back(Ok(ApiResponse {
      status,
      etag: etag.map(String::from),
      body,
    }));
  }

  pub fn push_error(&self, error: ApiError) {
    self.responses.lock().unwrap().push_back(Err(error));
  }

  /// Keep the next request on the wire until the returned sender fires.
  /// Its response is taken from the queue at that point.
  pub fn hold_next(&self) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel();
    *self.held.lock().unwrap() = Some(rx);
    tx
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn requests(&self) -> Vec<ApiRequest> {
    self.requests.lock().unwrap().clone()
  }

  pub fn request_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  fn next_response(&self) -> Result<ApiResponse, ApiError> {
    if self.offline.load(Ordering::SeqCst) {
      return Err(ApiError::Transient("network unreachable".into()));
    }
    self
      .responses
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Err(ApiError::Transient("no scripted response".into())))
  }
}

impl Transport for MockTransport {
  fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, ApiError>> {
    self.requests.lock().unwrap().push(request);

    let held = self.held.lock().unwrap().take();
    match held {
      Some(release) => Box::pin(async move {
        let _ = release.await;
        self.next_response()
      }),
      None => {
        let result = self.next_response();
        Box::pin(async move { result })
      }
    }
  }
}
