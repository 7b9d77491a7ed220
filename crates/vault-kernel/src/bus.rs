use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;

use crate::registry::panic_message;

pub type EventFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type EventHandler = Arc<dyn Fn(Arc<Value>) -> EventFuture + Send + Sync>;

pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Arc<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// Handlers run one after another, highest priority first.
    #[default]
    Sequential,
    /// Handlers run together; no ordering between them.
    Concurrent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    owner: String,
    priority: i32,
    handler: EventHandler,
}

/// Priority-ordered publish/subscribe with per-handler fault isolation.
pub struct EventBus {
    topics: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(
        &self,
        topic: &str,
        owner: &str,
        priority: i32,
        handler: EventHandler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription {
            id,
            owner: owner.to_string(),
            priority,
            handler,
        };

        let mut topics = self.topics.write();
        let subscribers = topics.entry(topic.to_string()).or_default();
        // Insert after every subscriber of equal or higher priority, so ties
        // keep subscription order.
        let position = subscribers
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(subscribers.len());
        subscribers.insert(position, subscription);

        log::debug!(
            "'{}' subscribed to '{}' (priority {})",
            owner,
            topic,
            priority
        );
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut topics = self.topics.write();
        let mut removed = false;
        for subscribers in topics.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| s.id != id);
            removed |= subscribers.len() != before;
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
        removed
    }

    /// Drops every subscription made by `owner`.
    pub fn remove_owner(&self, owner: &str) -> usize {
        let mut topics = self.topics.write();
        let mut removed = 0;
        for subscribers in topics.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| s.owner != owner);
            removed += before - subscribers.len();
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
        removed
    }

    pub fn clear_topic(&self, topic: &str) {
        self.topics.write().remove(topic);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map(Vec::len).unwrap_or(0)
    }

    pub fn owner_subscription_count(&self, owner: &str) -> usize {
        self.topics
            .read()
            .values()
            .flat_map(|subscribers| subscribers.iter())
            .filter(|s| s.owner == owner)
            .count()
    }

    pub async fn publish(&self, topic: &str, payload: Value, mode: PublishMode) -> PublishReport {
        let subscribers: Vec<Subscription> = match self.topics.read().get(topic) {
            Some(subscribers) => subscribers.clone(),
            None => return PublishReport::default(),
        };
        let payload = Arc::new(payload);

        let outcomes: Vec<bool> = match mode {
            PublishMode::Sequential => {
                let mut outcomes = Vec::with_capacity(subscribers.len());
                for subscription in &subscribers {
                    outcomes.push(run_isolated(topic, subscription, payload.clone()).await);
                }
                outcomes
            }
            PublishMode::Concurrent => {
                join_all(
                    subscribers
                        .iter()
                        .map(|subscription| run_isolated(topic, subscription, payload.clone())),
                )
                .await
            }
        };

        let delivered = outcomes.iter().filter(|ok| **ok).count();
        PublishReport {
            delivered,
            failed: outcomes.len() - delivered,
        }
    }
}

async fn run_isolated(topic: &str, subscription: &Subscription, payload: Arc<Value>) -> bool {
    let handler = subscription.handler.clone();
    let outcome = AssertUnwindSafe(async move { handler(payload).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::error!(
                "Subscriber of '{}' owned by '{}' failed: {:#}",
                topic,
                subscription.owner,
                e
            );
            false
        }
        Err(panic) => {
            log::error!(
                "Subscriber of '{}' owned by '{}' panicked: {}",
                topic,
                subscription.owner,
                panic_message(panic.as_ref())
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder(log: Arc<Mutex<Vec<i32>>>, tag: i32) -> EventHandler {
        event_handler(move |_| {
            let log = log.clone();
            async move {
                log.lock().push(tag);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn sequential_publish_follows_priority() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for priority in [0, 100, 50] {
            bus.subscribe("t", "test", priority, recorder(calls.clone(), priority));
        }

        let report = bus.publish("t", json!({}), PublishMode::Sequential).await;
        assert_eq!(*calls.lock(), vec![100, 50, 0]);
        assert_eq!(report, PublishReport { delivered: 3, failed: 0 });
    }

    #[tokio::test]
    async fn equal_priority_keeps_subscription_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("t", "test", 5, recorder(calls.clone(), 1));
        bus.subscribe("t", "test", 5, recorder(calls.clone(), 2));
        bus.subscribe("t", "test", 9, recorder(calls.clone(), 0));

        bus.publish("t", json!({}), PublishMode::Sequential).await;
        assert_eq!(*calls.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_stop_fan_out() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            "t",
            "bad",
            100,
            event_handler(|_| async move { Err(anyhow::anyhow!("nope")) }),
        );
        bus.subscribe(
            "t",
            "worse",
            75,
            event_handler(|_| async move {
                if true {
                    panic!("subscriber panic");
                }
                Ok(())
            }),
        );
        bus.subscribe("t", "good", 0, recorder(calls.clone(), 0));

        for mode in [PublishMode::Sequential, PublishMode::Concurrent] {
            let report = bus.publish("t", json!({}), mode).await;
            assert_eq!(report, PublishReport { delivered: 1, failed: 2 });
        }
        assert_eq!(*calls.lock(), vec![0, 0]);
    }

    #[tokio::test]
    async fn payload_reaches_handlers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        bus.subscribe(
            "t",
            "test",
            0,
            event_handler(move |payload| {
                let sink = sink.clone();
                async move {
                    *sink.lock() = Some(payload["value"].clone());
                    Ok(())
                }
            }),
        );

        bus.publish("t", json!({"value": 42}), PublishMode::Concurrent)
            .await;
        assert_eq!(*seen.lock(), Some(json!(42)));
    }

    #[tokio::test]
    async fn unsubscribe_and_remove_owner() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = bus.subscribe("a", "x", 0, recorder(calls.clone(), 1));
        bus.subscribe("a", "y", 0, recorder(calls.clone(), 2));
        bus.subscribe("b", "y", 0, recorder(calls.clone(), 3));

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        assert_eq!(bus.remove_owner("y"), 2);
        assert_eq!(bus.subscriber_count("a"), 0);
        assert_eq!(bus.subscriber_count("b"), 0);

        let report = bus.publish("a", json!({}), PublishMode::Sequential).await;
        assert_eq!(report.delivered, 0);
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn handler_may_subscribe_during_publish() {
        let bus = Arc::new(EventBus::new());
        let weak = Arc::downgrade(&bus);
        bus.subscribe(
            "t",
            "test",
            0,
            event_handler(move |_| {
                let weak = weak.clone();
                async move {
                    if let Some(bus) = weak.upgrade() {
                        bus.subscribe("other", "test", 0, event_handler(|_| async { Ok(()) }));
                    }
                    Ok(())
                }
            }),
        );

        bus.publish("t", json!({}), PublishMode::Sequential).await;
        assert_eq!(bus.subscriber_count("other"), 1);
    }
}
