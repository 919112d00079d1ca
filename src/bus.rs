//! In-process pub/sub event bus.
//!
//! Exact topic match only; no persistence, no backpressure, no retry.
//! Delivery is synchronous and sequential in subscription order, on the
//! publishing thread.  Handlers run outside the subscriber-list lock so a
//! handler may itself subscribe or publish.  A handler error is logged
//! and does not stop the fan-out.
//!
//! Topic convention: `<skill>_<verb_past_tense>` (e.g. `note_created`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

/// Event payloads are JSON values; handlers must not assume exclusive
/// ownership.
pub type EventHandler = Arc<dyn Fn(&serde_json::Value) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    subscriber: String,
    handler: EventHandler,
}

/// Topic → ordered subscriber list.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `topic`, attributed to `subscriber` for
    /// logging.  Subscriptions live for the lifetime of the bus.
    pub fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        handler: EventHandler,
    ) {
        debug!(topic, subscriber, "event subscription added");
        self.topics
            .lock()
            .expect("event bus poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(Subscription {
                subscriber: subscriber.to_string(),
                handler,
            });
    }

    /// Deliver `payload` to every subscriber of `topic`, in subscription
    /// order.  Returns the number of handlers invoked; zero subscribers
    /// is a silent no-op.
    pub fn publish(&self, topic: &str, payload: &serde_json::Value) -> usize {
        // Snapshot under the lock, dispatch outside it.
        let subs: Vec<Subscription> = {
            let topics = self.topics.lock().expect("event bus poisoned");
            match topics.get(topic) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };
        for sub in &subs {
            if let Err(e) = (sub.handler)(payload) {
                warn!(
                    topic,
                    subscriber = %sub.subscriber,
                    error = %e,
                    "event handler failed; continuing fan-out"
                );
            }
        }
        subs.len()
    }

    /// Number of subscribers currently registered for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .expect("event bus poisoned")
            .get(topic)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_with_no_subscribers_is_a_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("nothing_here", &serde_json::json!({})), 0);
    }

    #[test]
    fn each_subscriber_sees_payload_exactly_once() {
        let bus = EventBus::new();
        let seen_a = Arc::new(AtomicUsize::new(0));
        let seen_b = Arc::new(AtomicUsize::new(0));

        let a = seen_a.clone();
        bus.subscribe(
            "note_created",
            "issues",
            Arc::new(move |payload| {
                assert_eq!(payload["id"], 1);
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let b = seen_b.clone();
        bus.subscribe(
            "note_created",
            "cache",
            Arc::new(move |_| {
                b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let delivered = bus.publish("note_created", &serde_json::json!({"id": 1}));
        assert_eq!(delivered, 2);
        assert_eq!(seen_a.load(Ordering::SeqCst), 1);
        assert_eq!(seen_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_subscriber_topic_sees_nothing() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        bus.subscribe(
            "note_created",
            "watcher",
            Arc::new(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.publish("issue_created", &serde_json::json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_handler_does_not_stop_fanout() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "t",
            "bad",
            Arc::new(|_| anyhow::bail!("handler exploded")),
        );
        let r = reached.clone();
        bus.subscribe(
            "t",
            "good",
            Arc::new(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let delivered = bus.publish("t", &serde_json::json!(null));
        assert_eq!(delivered, 2);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delivery_respects_subscription_order() {
        let bus = EventBus::new();
        let trace = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let t = trace.clone();
            bus.subscribe(
                "ordered",
                name,
                Arc::new(move |_| {
                    t.lock().unwrap().push(name);
                    Ok(())
                }),
            );
        }
        bus.publish("ordered", &serde_json::json!({}));
        assert_eq!(*trace.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn publish_order_is_preserved_per_subscriber() {
        let bus = EventBus::new();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let t = trace.clone();
        bus.subscribe(
            "seq",
            "collector",
            Arc::new(move |payload| {
                t.lock().unwrap().push(payload["n"].as_i64().unwrap());
                Ok(())
            }),
        );
        for n in 0..10 {
            bus.publish("seq", &serde_json::json!({ "n": n }));
        }
        assert_eq!(*trace.lock().unwrap(), (0..10).collect::<Vec<i64>>());
    }

    #[test]
    fn handler_may_subscribe_during_publish() {
        // Dispatch happens on a snapshot taken outside the lock, so a
        // handler can take the lock again without deadlocking.
        let bus = Arc::new(EventBus::new());
        let bus2 = bus.clone();
        bus.subscribe(
            "t",
            "self-extender",
            Arc::new(move |_| {
                bus2.subscribe("t", "late", Arc::new(|_| Ok(())));
                Ok(())
            }),
        );
        bus.publish("t", &serde_json::json!({}));
        assert_eq!(bus.subscriber_count("t"), 2);
    }
}
