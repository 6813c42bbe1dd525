//! In-process bus used by tests and single-node deployments

use crate::client::MAX_QUEUED_PUBLISHES;
use crate::{BusError, BusMessage, BusResult, MessageBus, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Simple in-memory bus.
///
/// Delivery only happens while connected; anything published before the
/// first successful [`MessageBus::connect`] is queued and delivered on
/// connect. Faults can be injected to exercise retry and error paths.
#[derive(Debug, Default)]
pub struct LocalBus {
    state: Mutex<LocalState>,
}

#[derive(Debug, Default)]
struct LocalState {
    connected: bool,
    closed: bool,
    connect_attempts: u32,
    failing_connects: u32,
    reject_publish: bool,
    rejected_publish_subjects: HashSet<String>,
    rejected_subjects: HashSet<String>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>,
    queued: Vec<BusMessage>,
    delivered: Vec<BusMessage>,
}

impl LocalState {
    fn deliver(&mut self, message: BusMessage) {
        if let Some(senders) = self.subscribers.get_mut(&message.subject) {
            senders.retain(|sender| sender.send(message.clone()).is_ok());
        }
        self.delivered.push(message);
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that is connected from the start
    pub fn connected() -> Self {
        let bus = Self::new();
        bus.state().connected = true;
        bus
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.state().failing_connects = count;
    }

    /// Number of connection attempts so far
    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Simulate losing (or regaining) the connection
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state();
        state.connected = reachable;
        if reachable {
            let queued = std::mem::take(&mut state.queued);
            for message in queued {
                state.deliver(message);
            }
        }
    }

    /// Reject every subsequent publish
    pub fn reject_publishes(&self, reject: bool) {
        self.state().reject_publish = reject;
    }

    /// Reject subsequent publishes to `subject` only
    pub fn reject_publishes_to(&self, subject: &str) {
        self.state().rejected_publish_subjects.insert(subject.to_string());
    }

    /// Reject subsequent subscriptions to `subject`
    pub fn reject_subscriptions_to(&self, subject: &str) {
        self.state().rejected_subjects.insert(subject.to_string());
    }

    /// Close the bus; every later operation fails with [`BusError::Closed`]
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.connected = false;
        state.subscribers.clear();
    }

    /// Payloads delivered on `subject`, oldest first
    pub fn delivered(&self, subject: &str) -> Vec<Bytes> {
        self.state()
            .delivered
            .iter()
            .filter(|message| message.subject == subject)
            .map(|message| message.payload.clone())
            .collect()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn connect(&self) -> BusResult<()> {
        let mut state = self.state();
        state.connect_attempts += 1;

        if state.closed {
            return Err(BusError::Closed);
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BusError::NotConnected);
        }

        state.connected = true;
        let queued = std::mem::take(&mut state.queued);
        debug!("Local bus connected, flushing {} queued messages", queued.len());
        for message in queued {
            state.deliver(message);
        }
        Ok(())
    }

    fn ping(&self) -> bool {
        let state = self.state();
        state.connected && !state.closed
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()> {
        let mut state = self.state();
        if state.closed {
            return Err(BusError::Closed);
        }
        if state.reject_publish || state.rejected_publish_subjects.contains(subject) {
            return Err(BusError::Rejected {
                operation: "publish",
                subject: subject.to_string(),
            });
        }

        let message = BusMessage {
            subject: subject.to_string(),
            payload,
        };
        if state.connected {
            state.deliver(message);
        } else if state.queued.len() >= MAX_QUEUED_PUBLISHES {
            return Err(BusError::QueueFull(MAX_QUEUED_PUBLISHES));
        } else {
            state.queued.push(message);
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        let mut state = self.state();
        if state.closed {
            return Err(BusError::Closed);
        }
        if state.rejected_subjects.contains(subject) {
            return Err(BusError::Rejected {
                operation: "subscribe",
                subject: subject.to_string(),
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state
            .subscribers
            .entry(subject.to_string())
            .or_default()
            .push(sender);
        Ok(Subscription::new(subject, receiver))
    }
}
