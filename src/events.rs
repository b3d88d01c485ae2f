//! Typed change notifications.
//!
//! Subscribers register a callback per resource. Delivery follows
//! registration order, and each callback is isolated: an error or panic in
//! one is logged and the rest still run.

use color_eyre::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::types::ResourceKey;

/// A resource has a new canonical value.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
  pub resource: ResourceKey,
  pub value: Value,
  pub validator: Option<String>,
}

pub type Callback = Arc<dyn Fn(&ChangeEvent) -> Result<()> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
  id: SubscriptionId,
  callback: Callback,
}

/// Outcome of delivering one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
  pub delivered: usize,
  pub failed: usize,
}

/// Subscriptions keyed by resource.
///
/// A resource entry exists only while it has at least one callback.
pub struct SubscriptionRegistry {
  subscriptions: Mutex<BTreeMap<ResourceKey, Vec<Subscriber>>>,
  next_id: AtomicU64,
  /// Mirrors whether `subscriptions` is empty
  empty: watch::Sender<bool>,
}

impl Default for SubscriptionRegistry {
  fn default() -> Self {
    Self {
      subscriptions: Mutex::new(BTreeMap::new()),
      next_id: AtomicU64::new(0),
      empty: watch::channel(true).0,
    }
  }
}

impl SubscriptionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, BTreeMap<ResourceKey, Vec<Subscriber>>> {
    self
      .subscriptions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Publish emptiness while the map is still locked.
  fn publish(&self, subscriptions: &BTreeMap<ResourceKey, Vec<Subscriber>>) {
    self.empty.send_if_modified(|empty| {
      let changed = *empty != subscriptions.is_empty();
      *empty = subscriptions.is_empty();
      changed
    });
  }

  /// Resolves once no resource has a callback left, immediately if none
  /// has one now.
  pub async fn emptied(&self) {
    let mut empty = self.empty.subscribe();
    // Only fails once the sender is gone, and it lives as long as `self`
    let _ = empty.wait_for(|empty| *empty).await;
  }

  pub fn subscribe<F>(&self, resource: ResourceKey, callback: F) -> SubscriptionId
  where
    F: Fn(&ChangeEvent) -> Result<()> + Send + Sync + 'static,
  {
    let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
    debug!(%resource, ?id, "subscribed");
    let mut subscriptions = self.lock();
    subscriptions.entry(resource).or_default().push(Subscriber {
      id,
      callback: Arc::new(callback),
    });
    self.publish(&subscriptions);
    id
  }

  /// Remove one callback. Returns false if the id was unknown.
  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    let mut subscriptions = self.lock();

    let resource = subscriptions
      .iter()
      .find(|(_, subs)| subs.iter().any(|s| s.id == id))
      .map(|(resource, _)| resource.clone());

    let Some(resource) = resource else {
      return false;
    };

    if let Some(subs) = subscriptions.get_mut(&resource) {
      subs.retain(|s| s.id != id);
      if subs.is_empty() {
        subscriptions.remove(&resource);
      }
    }
    self.publish(&subscriptions);
    debug!(%resource, ?id, "unsubscribed");
    true
  }

  /// Drop every callback for `resource`. Returns how many were removed.
  pub fn remove_resource(&self, resource: &ResourceKey) -> usize {
    let mut subscriptions = self.lock();
    let removed = subscriptions
      .remove(resource)
      .map(|subs| subs.len())
      .unwrap_or(0);
    self.publish(&subscriptions);
    removed
  }

  pub fn clear(&self) {
    let mut subscriptions = self.lock();
    subscriptions.clear();
    self.publish(&subscriptions);
  }

  pub fn resources(&self) -> Vec<ResourceKey> {
    self.lock().keys().cloned().collect()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  pub fn subscriber_count(&self, resource: &ResourceKey) -> usize {
    self.lock().get(resource).map(Vec::len).unwrap_or(0)
  }

  /// Deliver `event` to every callback for its resource, in order.
  pub fn notify(&self, event: &ChangeEvent) -> Delivery {
    // Snapshot so callbacks can (un)subscribe without deadlocking
    let callbacks: Vec<(SubscriptionId, Callback)> = self
      .lock()
      .get(&event.resource)
      .map(|subs| {
        subs
          .iter()
          .map(|s| (s.id, Arc::clone(&s.callback)))
          .collect()
      })
      .unwrap_or_default();

    let mut delivery = Delivery::default();
    for (id, callback) in callbacks {
      match catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(Ok(())) => delivery.delivered += 1,
        Ok(Err(e)) => {
          warn!(resource = %event.resource, ?id, error = %e, "subscriber callback failed");
          delivery.failed += 1;
        }
        Err(_) => {
          warn!(resource = %event.resource, ?id, "subscriber callback panicked");
          delivery.failed += 1;
        }
      }
    }
    delivery
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  fn event(resource: ResourceKey) -> ChangeEvent {
    ChangeEvent {
      resource,
      value: Value::Null,
      validator: None,
    }
  }

  #[test]
  fn test_delivery_in_registration_order() {
    let registry = SubscriptionRegistry::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for n in 0..3 {
      let seen = seen.clone();
      registry.subscribe(ResourceKey::vehicle("1"), move |_| {
        seen.lock().unwrap().push(n);
        Ok(())
      });
    }

    let delivery = registry.notify(&event(ResourceKey::vehicle("1")));
    assert_eq!(delivery.delivered, 3);
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
  }

  #[test]
  fn test_failing_callbacks_are_isolated() {
    let registry = SubscriptionRegistry::new();
    let reached = Arc::new(AtomicU64::new(0));

    registry.subscribe(ResourceKey::vehicle("1"), |_| Err(eyre!("render failed")));
    registry.subscribe(ResourceKey::vehicle("1"), |_| panic!("subscriber bug"));
    let r = reached.clone();
    registry.subscribe(ResourceKey::vehicle("1"), move |_| {
      r.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });

    let delivery = registry.notify(&event(ResourceKey::vehicle("1")));
    assert_eq!(delivery, Delivery { delivered: 1, failed: 2 });
    assert_eq!(reached.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_only_matching_resource_notified() {
    let registry = SubscriptionRegistry::new();
    let hits = Arc::new(AtomicU64::new(0));
    let h = hits.clone();
    registry.subscribe(ResourceKey::vehicle("2"), move |_| {
      h.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });

    registry.notify(&event(ResourceKey::vehicle("1")));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_resource_removed_with_last_callback() {
    let registry = SubscriptionRegistry::new();
    let a = registry.subscribe(ResourceKey::profile(), |_| Ok(()));
    let b = registry.subscribe(ResourceKey::profile(), |_| Ok(()));

    assert!(registry.unsubscribe(a));
    assert_eq!(registry.subscriber_count(&ResourceKey::profile()), 1);
    assert!(registry.unsubscribe(b));
    assert!(registry.is_empty());
    assert!(!registry.unsubscribe(b));
  }

  #[tokio::test]
  async fn test_emptied_resolves_when_last_resource_removed() {
    let registry = Arc::new(SubscriptionRegistry::new());
    registry.emptied().await;

    let resource = ResourceKey::vehicle("2");
    registry.subscribe(resource.clone(), |_| Ok(()));
    let waiter = {
      let registry = Arc::clone(&registry);
      tokio::spawn(async move { registry.emptied().await })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    assert_eq!(registry.remove_resource(&resource), 1);
    waiter.await.unwrap();
  }
}
