//! Topic-keyed broadcast fan-out.
//!
//! Each topic owns a `tokio::sync::broadcast` channel created on first
//! subscribe and removed when its last subscription drops. Delivery is
//! at-most-once: nothing is buffered for clients that are not connected,
//! and a subscriber that falls behind is told how many events it missed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

use crate::events::{JobEvent, Topic};

/// Default per-topic channel capacity.
const DEFAULT_CAPACITY: usize = 256;

type Topics = Mutex<HashMap<Topic, broadcast::Sender<JobEvent>>>;

/// Publish/subscribe hub for job events.
pub struct Broadcaster {
    topics: Arc<Topics>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broadcaster whose topics buffer up to `capacity` events per
    /// subscriber before it starts lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Deliver `event` to every current subscriber of `topic`.
    ///
    /// Returns the number of subscribers reached. Zero subscribers is not an
    /// error.
    pub fn publish(&self, topic: Topic, event: JobEvent) -> usize {
        let Ok(topics) = self.topics.lock() else {
            return 0;
        };
        let Some(tx) = topics.get(&topic) else {
            trace!(%topic, "No subscribers for topic");
            return 0;
        };
        tx.send(event).unwrap_or(0)
    }

    /// Publish to the job's own topic and to the global topic. Returns the
    /// number of job-topic subscribers reached.
    pub fn publish_job_event(&self, event: JobEvent) -> usize {
        let reached = self.publish(Topic::Job(event.job_id), event.clone());
        self.publish(Topic::Global, event);
        reached
    }

    /// Subscribe to `topic`, creating it if needed.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let rx = match self.topics.lock() {
            Ok(mut topics) => topics
                .entry(topic)
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe(),
            // A poisoned map still hands out a live receiver; it just will
            // never see events.
            Err(_) => broadcast::channel(1).0.subscribe(),
        };
        debug!(%topic, "Subscribed");
        Subscription {
            topic,
            rx: Some(rx),
            topics: Arc::downgrade(&self.topics),
        }
    }

    /// Current number of subscribers on `topic`.
    pub fn receiver_count(&self, topic: Topic) -> usize {
        self.topics
            .lock()
            .ok()
            .and_then(|t| t.get(&topic).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to one topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    rx: Option<broadcast::Receiver<JobEvent>>,
    topics: Weak<Topics>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next event.
    ///
    /// `RecvError::Lagged(n)` reports `n` skipped events; the subscription
    /// stays usable afterwards.
    pub async fn recv(&mut self) -> Result<JobEvent, RecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => Err(RecvError::Closed),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Release the receiver before counting so this one is excluded.
        drop(self.rx.take());

        let Some(topics) = self.topics.upgrade() else {
            return;
        };
        let Ok(mut topics) = topics.lock() else {
            return;
        };
        if topics
            .get(&self.topic)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            topics.remove(&self.topic);
            debug!(topic = %self.topic, "Pruned empty topic");
        }
    }
}
