//! Process presence announcements on `router.start`

use bytes::Bytes;
use router_bus::MessageBus;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{CoordinatorError, Result, SyncMetrics};

pub const START_SUBJECT: &str = "router.start";

/// Identity of this router process and the addresses peers can reach it on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub id: String,
    pub hosts: Vec<String>,
}

impl HeartbeatMessage {
    /// A message with a freshly generated id
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            hosts,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|source| CoordinatorError::Encode {
                what: "heartbeat",
                source,
            })
    }
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(CoordinatorError::HostAddress)?;
    socket
        .connect("198.18.0.1:53")
        .map_err(CoordinatorError::HostAddress)?;
    let addr = socket.local_addr().map_err(CoordinatorError::HostAddress)?;
    Ok(addr.ip())
}

/// Publishes the same encoded heartbeat once at startup and then on a
/// fixed interval.
pub struct HeartbeatPublisher {
    bus: Arc<dyn MessageBus>,
    payload: Bytes,
    interval: Duration,
    metrics: SyncMetrics,
}

impl HeartbeatPublisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        message: &HeartbeatMessage,
        interval: Duration,
        metrics: SyncMetrics,
    ) -> Result<Self> {
        Ok(Self {
            bus,
            payload: message.encode()?,
            interval,
            metrics,
        })
    }

    /// Send the initial heartbeat. A failure here is fatal to startup.
    pub async fn announce(&self) -> Result<()> {
        match self.bus.publish(START_SUBJECT, self.payload.clone()).await {
            Ok(()) => {
                self.metrics.heartbeats_published_total.inc();
                debug!("Sent initial start message");
                Ok(())
            }
            Err(e) => {
                self.metrics.heartbeat_errors_total.inc();
                Err(CoordinatorError::InitialHeartbeat(e))
            }
        }
    }

    /// Publish on every tick for the life of the task.
    ///
    /// Returns `None` when the interval is zero.
    pub fn spawn(self) -> Option<JoinHandle<()>> {
        if self.interval.is_zero() {
            info!("Start message interval is zero, periodic heartbeats disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                info!("Sending start message");
                match self.bus.publish(START_SUBJECT, self.payload.clone()).await {
                    Ok(()) => self.metrics.heartbeats_published_total.inc(),
                    Err(e) => {
                        self.metrics.heartbeat_errors_total.inc();
                        error!("Error publishing to {}: {}", START_SUBJECT, e);
                    }
                }
            }
        }))
    }
}
