//! Background change detection for subscribed resources.
//!
//! One shared timer probes every subscribed resource each cycle. The timer
//! starts with the first subscription and stops once none remain.
//!
//! Per resource:
//! - changed: every callback is notified in registration order
//! - auth/not-found errors: the resource's subscriptions are dropped
//! - transient errors: the resource sits out an exponentially growing
//!   number of cycles, capped by `max_backoff_cycles`

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::types::ResourceKey;
use crate::error::ApiError;
use crate::events::{ChangeEvent, SubscriptionId, SubscriptionRegistry};

/// Result of probing one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
  Unchanged,
  /// The resource has a new canonical value, already stored locally
  Changed(ChangeEvent),
}

/// Checks a single resource for changes.
pub trait ChangeProbe: Send + Sync {
  fn probe<'a>(&'a self, resource: &'a ResourceKey)
    -> BoxFuture<'a, Result<ProbeOutcome, ApiError>>;
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
  pub interval: Duration,
  /// Upper bound for a single probe; exceeding it counts as transient
  pub probe_timeout: Duration,
  pub max_backoff_cycles: u32,
}

impl Default for PollerConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(30),
      probe_timeout: Duration::from_secs(10),
      max_backoff_cycles: 8,
    }
  }
}

/// What happened during one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
  pub changed: usize,
  pub unchanged: usize,
  pub failed: usize,
  pub dropped: usize,
  pub skipped: usize,
}

/// Cycles to sit out after `failures` consecutive transient failures.
fn backoff_cycles(failures: u32, max: u32) -> u32 {
  if failures == 0 {
    return 0;
  }
  let exp = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
  exp.min(max.max(1)) - 1
}

#[derive(Debug, Default)]
struct Backoff {
  failures: u32,
  skip_remaining: u32,
}

struct Shared {
  probe: Arc<dyn ChangeProbe>,
  registry: Arc<SubscriptionRegistry>,
  config: PollerConfig,
  backoff: Mutex<HashMap<ResourceKey, Backoff>>,
  timer: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
  fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    self.timer.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn backoff(&self) -> MutexGuard<'_, HashMap<ResourceKey, Backoff>> {
    self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Consume one skipped cycle if the resource is backing off.
  fn should_skip(&self, resource: &ResourceKey) -> bool {
    match self.backoff().get_mut(resource) {
      Some(state) if state.skip_remaining > 0 => {
        state.skip_remaining -= 1;
        true
      }
      _ => false,
    }
  }

  fn record_failure(&self, resource: &ResourceKey) -> u32 {
    let mut backoff = self.backoff();
    let state = backoff.entry(resource.clone()).or_default();
    state.failures += 1;
    state.skip_remaining = backoff_cycles(state.failures, self.config.max_backoff_cycles);
    state.skip_remaining
  }

  fn reset(&self, resource: &ResourceKey) {
    self.backoff().remove(resource);
  }

  /// Drop the timer handle if nothing is subscribed. Runs under the same
  /// lock as `ensure_running`.
  fn release_if_idle(&self) -> bool {
    let mut timer = self.timer();
    if self.registry.is_empty() {
      timer.take();
      true
    } else {
      false
    }
  }

  async fn poll_once(&self) -> CycleReport {
    let mut report = CycleReport::default();

    for resource in self.registry.resources() {
      if self.should_skip(&resource) {
        debug!(%resource, "backing off, skipping this cycle");
        report.skipped += 1;
        continue;
      }

      let outcome = tokio::time::timeout(self.config.probe_timeout, self.probe.probe(&resource))
        .await
        .unwrap_or_else(|_| {
          Err(ApiError::Transient(format!(
            "probe timed out after {:?}",
            self.config.probe_timeout
          )))
        });

      match outcome {
        Ok(ProbeOutcome::Unchanged) => {
          self.reset(&resource);
          report.unchanged += 1;
        }
        Ok(ProbeOutcome::Changed(event)) => {
          self.reset(&resource);
          let delivery = self.registry.notify(&event);
          debug!(
            %resource,
            delivered = delivery.delivered,
            failed = delivery.failed,
            "change delivered"
          );
          report.changed += 1;
        }
        Err(e) if e.is_terminal() => {
          let removed = self.registry.remove_resource(&resource);
          self.reset(&resource);
          info!(%resource, error = %e, removed, "dropping subscriptions");
          report.dropped += 1;
        }
        Err(e) => {
          let skip = self.record_failure(&resource);
          warn!(%resource, error = %e, skip, "probe failed");
          report.failed += 1;
        }
      }
    }

    // Forget backoff state of resources that were unsubscribed meanwhile
    let live = self.registry.resources();
    self.backoff().retain(|resource, _| live.contains(resource));

    report
  }
}

async fn run_timer(shared: Arc<Shared>) {
  let mut ticker = tokio::time::interval(shared.config.interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  // The first tick completes immediately
  ticker.tick().await;

  loop {
    tokio::select! {
      _ = ticker.tick() => {
        let report = shared.poll_once().await;
        debug!(?report, "polling cycle finished");
      }
      // Other holders of the registry may drop the last subscription
      _ = shared.registry.emptied() => {}
    }

    if shared.release_if_idle() {
      debug!("no subscriptions left, poller stopped");
      return;
    }
  }
}

/// Polls subscribed resources on a shared timer.
///
/// Must be used from within a tokio runtime; the timer is a spawned task.
pub struct ChangePoller {
  shared: Arc<Shared>,
}

impl ChangePoller {
  pub fn create(
    probe: Arc<dyn ChangeProbe>,
    registry: Arc<SubscriptionRegistry>,
    config: PollerConfig,
  ) -> Self {
    Self {
      shared: Arc::new(Shared {
        probe,
        registry,
        config,
        backoff: Mutex::new(HashMap::new()),
        timer: Mutex::new(None),
      }),
    }
  }

  pub fn registry(&self) -> Arc<SubscriptionRegistry> {
    Arc::clone(&self.shared.registry)
  }

  /// Register `callback` for changes to `resource`, starting the timer if
  /// it is not running.
  pub fn subscribe<F>(&self, resource: ResourceKey, callback: F) -> SubscriptionId
  where
    F: Fn(&ChangeEvent) -> color_eyre::Result<()> + Send + Sync + 'static,
  {
    let id = self.shared.registry.subscribe(resource, callback);
    self.ensure_running();
    id
  }

  /// Remove one callback. The timer stops with the last subscription.
  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    let removed = self.shared.registry.unsubscribe(id);
    if self.shared.registry.is_empty() {
      self.stop();
    }
    removed
  }

  pub fn is_running(&self) -> bool {
    self
      .shared
      .timer()
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }

  /// Run one cycle immediately, outside the timer.
  pub async fn poll_once(&self) -> CycleReport {
    self.shared.poll_once().await
  }

  /// Stop the timer and drop every subscription.
  pub fn dispose(&self) {
    self.stop();
    self.shared.registry.clear();
    self.shared.backoff().clear();
  }

  fn ensure_running(&self) {
    let mut timer = self.shared.timer();
    if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
      return;
    }
    debug!(interval = ?self.shared.config.interval, "poller started");
    *timer = Some(tokio::spawn(run_timer(Arc::clone(&self.shared))));
  }

  fn stop(&self) {
    if let Some(handle) = self.shared.timer().take() {
      handle.abort();
      debug!("poller stopped");
    }
  }
}

impl Drop for ChangePoller {
  fn drop(&mut self) {
    self.stop();
  }
}
