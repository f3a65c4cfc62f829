//! In-process topic exchange connecting the modules.
//!
//! Producers publish to a named topic; every subscriber that declared
//! interest before the publish receives its own copy, FIFO per
//! (publisher, topic). Each subscriber owns a bounded queue; when it fills,
//! the oldest *uncommitted* IU at the head is dropped so stale partials
//! never stall a producer, but a COMMIT at the head blocks the publisher
//! until the subscriber catches up — commits must not be lost.

use crate::iu::{IncrementalUnit, UpdateType};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// A topic-addressed publish/subscribe exchange.
///
/// Cloning is cheap; clones share the same exchange.
#[derive(Clone)]
pub struct Bus {
    topics: Arc<StdMutex<HashMap<String, Vec<Arc<SubQueue>>>>>,
    buff_size: usize,
}

struct SubQueue {
    queue: Mutex<VecDeque<IncrementalUnit>>,
    /// Signaled when the consumer pops (space available).
    space: Notify,
    /// Signaled when a producer pushes (item available).
    ready: Notify,
    closed: AtomicBool,
}

impl Bus {
    /// Create an exchange whose subscriber queues hold `buff_size` IUs.
    pub fn new(buff_size: usize) -> Self {
        Self {
            topics: Arc::new(StdMutex::new(HashMap::new())),
            buff_size: buff_size.max(1),
        }
    }

    /// Declare interest in a topic. IUs published after this call are
    /// delivered; earlier traffic is not replayed.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let sub = Arc::new(SubQueue {
            queue: Mutex::new(VecDeque::with_capacity(self.buff_size)),
            space: Notify::new(),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.topics
            .lock()
            .expect("bus topic table poisoned")
            .entry(topic.to_owned())
            .or_default()
            .push(Arc::clone(&sub));
        Subscription {
            topic: topic.to_owned(),
            inner: sub,
        }
    }

    /// Publish one IU to every current subscriber of `topic`.
    ///
    /// Returns once the IU is queued everywhere. Only a subscriber whose
    /// queue head is a COMMIT can make this await.
    pub async fn publish(&self, topic: &str, iu: IncrementalUnit) {
        let subs: Vec<Arc<SubQueue>> = {
            let mut table = self.topics.lock().expect("bus topic table poisoned");
            if let Some(list) = table.get_mut(topic) {
                list.retain(|s| !s.closed.load(Ordering::Relaxed));
                list.clone()
            } else {
                Vec::new()
            }
        };

        for sub in subs {
            sub.push(iu.clone(), self.buff_size).await;
        }
    }
}

impl SubQueue {
    async fn push(&self, iu: IncrementalUnit, cap: usize) {
        loop {
            if self.closed.load(Ordering::Relaxed) {
                // Pass the wakeup along in case another publisher is parked.
                self.space.notify_one();
                return;
            }
            {
                let mut queue = self.queue.lock().await;
                if queue.len() < cap {
                    queue.push_back(iu);
                    self.ready.notify_one();
                    return;
                }
                // Full. Stale partials at the head are expendable; a COMMIT
                // is not, so the publisher waits for the consumer instead.
                match queue.front().map(|head| head.update_type) {
                    Some(UpdateType::Commit) => {}
                    _ => {
                        if let Some(dropped) = queue.pop_front() {
                            debug!(id = %dropped.id, "subscriber queue full, dropped head IU");
                        }
                        queue.push_back(iu);
                        self.ready.notify_one();
                        return;
                    }
                }
            }
            self.space.notified().await;
        }
    }
}

/// A lazily consumed stream of IUs from one topic.
pub struct Subscription {
    topic: String,
    inner: Arc<SubQueue>,
}

impl Subscription {
    /// Topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next IU. Cancel-safe: a cancelled `recv` consumes
    /// nothing. Never returns `None` while the bus is alive.
    pub async fn recv(&mut self) -> IncrementalUnit {
        loop {
            {
                let mut queue = self.inner.queue.lock().await;
                if let Some(iu) = queue.pop_front() {
                    self.inner.space.notify_one();
                    return iu;
                }
            }
            self.inner.ready.notified().await;
        }
    }

    /// Pop without waiting, for shutdown drains.
    pub async fn try_recv(&mut self) -> Option<IncrementalUnit> {
        let mut queue = self.inner.queue.lock().await;
        let iu = queue.pop_front();
        if iu.is_some() {
            self.inner.space.notify_one();
        }
        iu
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        // Unblock a publisher waiting on a commit-headed queue.
        self.inner.space.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iu::Payload;
    use std::time::Duration;

    fn text_iu(s: &str) -> IncrementalUnit {
        IncrementalUnit::add("test", Payload::Text { text: s.to_owned() })
    }

    #[tokio::test]
    async fn delivery_is_fifo_per_topic() {
        let bus = Bus::new(10);
        let mut sub = bus.subscribe("t");
        let a = text_iu("a");
        let b = text_iu("b");
        bus.publish("t", a.clone()).await;
        bus.publish("t", b.clone()).await;
        assert_eq!(sub.recv().await.id, a.id);
        assert_eq!(sub.recv().await.id, b.id);
    }

    #[tokio::test]
    async fn each_subscriber_gets_its_own_copy() {
        let bus = Bus::new(10);
        let mut s1 = bus.subscribe("t");
        let mut s2 = bus.subscribe("t");
        let iu = text_iu("x");
        bus.publish("t", iu.clone()).await;
        assert_eq!(s1.recv().await.id, iu.id);
        assert_eq!(s2.recv().await.id, iu.id);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_uncommitted() {
        let bus = Bus::new(2);
        let mut sub = bus.subscribe("t");
        let a = text_iu("a");
        let b = text_iu("b");
        let c = text_iu("c");
        bus.publish("t", a.clone()).await;
        bus.publish("t", b.clone()).await;
        // Queue full: `a` (uncommitted head) is dropped, never reordered.
        bus.publish("t", c.clone()).await;
        assert_eq!(sub.recv().await.id, b.id);
        assert_eq!(sub.recv().await.id, c.id);
    }

    #[tokio::test]
    async fn commit_at_head_blocks_publisher_until_pop() {
        let bus = Bus::new(1);
        let mut sub = bus.subscribe("t");
        let root = text_iu("done.");
        let commit = root.commit();
        bus.publish("t", commit.clone()).await;

        let bus2 = bus.clone();
        let late = text_iu("late");
        let late_id = late.id;
        let publisher = tokio::spawn(async move {
            bus2.publish("t", late).await;
        });

        // The publisher must be parked while the COMMIT occupies the head.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        assert_eq!(sub.recv().await.id, commit.id);
        publisher.await.expect("publisher task");
        assert_eq!(sub.recv().await.id, late_id);
    }

    #[tokio::test]
    async fn delivered_sequence_is_subsequence_of_published() {
        let bus = Bus::new(3);
        let mut sub = bus.subscribe("t");
        let published: Vec<IncrementalUnit> = (0..20).map(|i| text_iu(&format!("{i}"))).collect();
        for iu in &published {
            bus.publish("t", iu.clone()).await;
        }
        let mut received = Vec::new();
        while let Some(iu) = sub.try_recv().await {
            received.push(iu.id);
        }
        // Drops happen only at the head: what survives must be a suffix here
        // and, in general, a subsequence of publication order.
        let order: Vec<_> = published.iter().map(|iu| iu.id).collect();
        let mut cursor = 0;
        for id in &received {
            let pos = order[cursor..]
                .iter()
                .position(|o| o == id)
                .expect("received IU not in published order");
            cursor += pos + 1;
        }
    }

    #[tokio::test]
    async fn dropped_subscription_unblocks_publisher() {
        let bus = Bus::new(1);
        let sub = bus.subscribe("t");
        let root = text_iu("done.");
        bus.publish("t", root.commit()).await;

        let bus2 = bus.clone();
        let publisher = tokio::spawn(async move {
            bus2.publish("t", text_iu("late")).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(sub);
        tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .expect("publisher should finish after subscriber drop")
            .expect("publisher task");
    }
}
