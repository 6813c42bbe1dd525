//! Bus client contract shared by every transport

use crate::BusResult;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Messages published before the first connection are held up to this bound
pub const MAX_QUEUED_PUBLISHES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// A publish/subscribe transport.
///
/// `subscribe` and `publish` may be called before `connect` has succeeded:
/// subscriptions start delivering and queued publishes are flushed once the
/// first connection is established.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Establish the connection; called repeatedly until it succeeds
    async fn connect(&self) -> BusResult<()>;

    /// Liveness probe: `true` while the bus is reachable
    fn ping(&self) -> bool;

    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()>;

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription>;
}

/// Stream of messages delivered on one subject
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, receiver: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the bus drops the subscription
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}
