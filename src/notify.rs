// Per-session notification topics. Publishing never waits on subscribers: each
// subscriber has a bounded queue and the oldest events are dropped on overflow.

use crate::session::{FailureCause, SessionStatus};
use crate::tour::TourResult;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status {
        status: SessionStatus,
        progress_percent: u8,
    },
    Results {
        tours: Vec<TourResult>,
        has_more: bool,
    },
    Error {
        cause: FailureCause,
    },
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    // Events buffered per subscriber before the oldest are dropped
    pub queue_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

type Topics = DashMap<String, broadcast::Sender<SessionEvent>>;

#[derive(Clone)]
pub struct NotificationHub {
    topics: Arc<Topics>,
    config: NotificationConfig,
    next_id: Arc<AtomicU64>,
}

impl NotificationHub {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            config,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let capacity = self.config.queue_capacity.max(1);
        let receiver = self
            .topics
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = session_id, subscription = id, "subscriber attached");

        Subscription {
            id,
            session_id: session_id.to_string(),
            backlog: VecDeque::new(),
            replayed: None,
            receiver: Some(receiver),
            dropped: 0,
            topics: Arc::clone(&self.topics),
        }
    }

    /// Delivers to current subscribers and returns how many there were.
    pub fn publish(&self, session_id: &str, event: SessionEvent) -> usize {
        match self.topics.get(session_id) {
            // Err only means nobody is listening
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!(
            session_id = %subscription.session_id,
            subscription = subscription.id,
            "subscriber detached"
        );
        drop(subscription);
    }

    // Subscribers drain what is already queued, then see the end of the stream
    pub fn close(&self, session_id: &str) {
        if self.topics.remove(session_id).is_some() {
            debug!(session_id = session_id, "topic closed");
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.topics
            .get(session_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.topics
            .iter()
            .map(|entry| entry.value().receiver_count())
            .sum()
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(NotificationConfig::default())
    }
}

pub struct Subscription {
    id: u64,
    session_id: String,
    backlog: VecDeque<SessionEvent>,
    // A live event equal to this one was queued before the replay was taken
    replayed: Option<SessionEvent>,
    receiver: Option<broadcast::Receiver<SessionEvent>>,
    dropped: u64,
    topics: Arc<Topics>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // Events lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub(crate) fn push_replay(&mut self, event: SessionEvent) {
        self.replayed = Some(event.clone());
        self.backlog.push_back(event);
    }

    // The session already ended: only the replayed events will be delivered
    pub(crate) fn finish_with(&mut self, events: Vec<SessionEvent>) {
        self.backlog.extend(events);
        self.detach();
    }

    /// Next event, or `None` once the session's stream has ended.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) if self.replayed.take().as_ref() == Some(&event) => continue,
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        session_id = %self.session_id,
                        skipped = skipped,
                        "slow subscriber dropped events"
                    );
                    self.dropped += skipped;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.try_recv() {
                Ok(event) if self.replayed.take().as_ref() == Some(&event) => continue,
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.dropped += skipped,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn detach(&mut self) {
        if self.receiver.take().is_some() {
            self.topics
                .remove_if(&self.session_id, |_, sender| sender.receiver_count() == 0);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
