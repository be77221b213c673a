// Local notification fan-out for replica events

use std::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use loam_core::{BranchId, EntityId, Reference, Version};

/// Who authored the commit being announced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// This replica authored the commit
    Commit,
    /// An external commit was applied
    Integrate,
}

/// One entity head change within a commit; `new_hash` is absent when the
/// entity was deleted
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub id: EntityId,
    pub new_hash: Option<Reference>,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: EventKind,
    pub branch: BranchId,
    pub commit_hash: Reference,
    pub version: Version,
    pub changes: Vec<Change>,
}

pub type SubscriptionId = Uuid;

type SubscriberFn = dyn Fn(&Notification) -> anyhow::Result<()> + Send + Sync;

/// Synchronous, ordered delivery to local subscribers. A failing
/// subscriber is logged and never affects the triggering operation or
/// later subscribers.
pub struct NotificationBus {
    subscribers: RwLock<Vec<(SubscriptionId, Box<SubscriberFn>)>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.push((id, Box::new(subscriber)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.subscribers.write().unwrap();
        subscribers.retain(|(existing, _)| *existing != id);
    }

    /// Offer `notification` to every subscriber in subscription order
    /// before returning
    pub fn publish(&self, notification: &Notification) {
        let subscribers = self.subscribers.read().unwrap();
        for (id, subscriber) in subscribers.iter() {
            if let Err(error) = subscriber(notification) {
                warn!(subscription = %id, %error, "notification subscriber failed");
            }
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::hash_bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn notification() -> Notification {
        Notification {
            kind: EventKind::Commit,
            branch: "main".to_string(),
            commit_hash: hash_bytes(b"commit"),
            version: 1,
            changes: vec![],
        }
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = NotificationBus::new();
        let order = Arc::new(RwLock::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(move |_| {
                order.write().unwrap().push(tag);
                Ok(())
            });
        }
        bus.publish(&notification());
        assert_eq!(*order.read().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_subscriber_does_not_stop_delivery() {
        let bus = NotificationBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_| anyhow::bail!("subscriber exploded"));
        {
            let delivered = delivered.clone();
            bus.subscribe(move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        bus.publish(&notification());
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = NotificationBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let id = {
            let delivered = delivered.clone();
            bus.subscribe(move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        bus.publish(&notification());
        bus.unsubscribe(id);
        bus.publish(&notification());
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
