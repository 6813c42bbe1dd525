//! Bus transport backed by Redis PUBLISH/SUBSCRIBE

use crate::client::MAX_QUEUED_PUBLISHES;
use crate::{BusError, BusMessage, BusResult, MessageBus, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Pause before a dropped subscription is re-established
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// RedisBus publishes through a [`ConnectionManager`], which re-establishes
/// the connection after it drops, and keeps one pub/sub connection per
/// subscribed subject, resubscribing whenever that connection is lost.
pub struct RedisBus {
    client: redis::Client,
    reachable: Arc<AtomicBool>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    connection: Option<ConnectionManager>,
    pending_subscriptions: Vec<(String, mpsc::UnboundedSender<BusMessage>)>,
    queued: Vec<BusMessage>,
}

impl RedisBus {
    /// Create a bus for `url`; no connection is made until `connect`
    pub fn new(url: &str) -> BusResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            reachable: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Build a `redis://` URL from endpoint parts
    pub fn url(host: &str, port: u16, user: Option<&str>, pass: Option<&str>) -> String {
        match (user, pass) {
            (Some(user), Some(pass)) => format!("redis://{}:{}@{}:{}/", user, pass, host, port),
            (None, Some(pass)) => format!("redis://:{}@{}:{}/", pass, host, port),
            _ => format!("redis://{}:{}/", host, port),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_subscription(&self, subject: String, sender: mpsc::UnboundedSender<BusMessage>) {
        let client = self.client.clone();
        let reachable = self.reachable.clone();
        tokio::spawn(async move {
            loop {
                match pump(&client, &subject, &sender, &reachable).await {
                    Ok(()) => {
                        debug!("Subscriber to {} went away", subject);
                        return;
                    }
                    Err(e) => {
                        reachable.store(false, Ordering::SeqCst);
                        error!("Error subscribing to {}: {}", subject, e);
                    }
                }

                if sender.is_closed() {
                    return;
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        });
    }

    async fn send(&self, mut connection: ConnectionManager, message: &BusMessage) -> BusResult<()> {
        let result: redis::RedisResult<i64> = connection
            .publish(message.subject.as_str(), &message.payload[..])
            .await;

        match result {
            Ok(receivers) => {
                self.reachable.store(true, Ordering::SeqCst);
                debug!("Published to {} ({} receivers)", message.subject, receivers);
                Ok(())
            }
            Err(e) => {
                self.reachable.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }
}

/// Forward messages from one pub/sub connection.
///
/// `Ok` means the subscriber dropped its end; any error means the
/// connection should be re-established.
async fn pump(
    client: &redis::Client,
    subject: &str,
    sender: &mpsc::UnboundedSender<BusMessage>,
    reachable: &AtomicBool,
) -> BusResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(subject).await?;
    reachable.store(true, Ordering::SeqCst);
    debug!("Subscribed to {}", subject);

    let messages = pubsub.on_message();
    futures::pin_mut!(messages);
    while let Some(msg) = messages.next().await {
        let message = BusMessage {
            subject: subject.to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        };
        if sender.send(message).is_err() {
            return Ok(());
        }
    }

    if sender.is_closed() {
        return Ok(());
    }
    warn!("Pub/sub connection for {} closed", subject);
    Err(BusError::Closed)
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn connect(&self) -> BusResult<()> {
        // One attempt per call; the caller owns the retry cadence. Later
        // reconnects happen on the first command after a drop.
        let mut connection = self
            .client
            .get_connection_manager_with_backoff(2, 100, 0)
            .await?;
        let _pong: String = redis::cmd("PING").query_async(&mut connection).await?;

        let (subscriptions, queued) = {
            let mut inner = self.inner();
            inner.connection = Some(connection.clone());
            (
                std::mem::take(&mut inner.pending_subscriptions),
                std::mem::take(&mut inner.queued),
            )
        };
        self.reachable.store(true, Ordering::SeqCst);
        info!(
            "Connected to redis bus ({} pending subscriptions, {} queued messages)",
            subscriptions.len(),
            queued.len()
        );

        for (subject, sender) in subscriptions {
            self.spawn_subscription(subject, sender);
        }
        for message in &queued {
            if let Err(e) = self.send(connection.clone(), message).await {
                warn!("Dropping queued message for {}: {}", message.subject, e);
            }
        }

        Ok(())
    }

    fn ping(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()> {
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
        };

        let connection = {
            let mut inner = self.inner();
            match inner.connection.clone() {
                Some(connection) => connection,
                None if inner.queued.len() >= MAX_QUEUED_PUBLISHES => {
                    return Err(BusError::QueueFull(MAX_QUEUED_PUBLISHES));
                }
                None => {
                    inner.queued.push(message);
                    return Ok(());
                }
            }
        };

        self.send(connection, &message).await
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let connected = {
            let mut inner = self.inner();
            if inner.connection.is_some() {
                true
            } else {
                inner
                    .pending_subscriptions
                    .push((subject.to_string(), sender.clone()));
                false
            }
        };
        if connected {
            self.spawn_subscription(subject.to_string(), sender);
        }

        Ok(Subscription::new(subject, receiver))
    }
}
