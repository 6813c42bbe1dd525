//! Periodic export of active applications on `router.active_apps`

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use router_bus::MessageBus;
use router_core::RouteRegistry;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{CoordinatorError, Result, SyncMetrics};

pub const ACTIVE_APPS_SUBJECT: &str = "router.active_apps";

/// JSON-encode then zlib-compress a snapshot
pub fn encode_snapshot(apps: &[String]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(apps).map_err(|source| CoordinatorError::Encode {
        what: "active apps",
        source,
    })?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(CoordinatorError::Compress)?;
    encoder.finish().map_err(CoordinatorError::Compress)
}

/// Inverse of [`encode_snapshot`], for consumers of the feed
pub fn decode_snapshot(payload: &[u8]) -> Result<Vec<String>> {
    let mut json = Vec::new();
    ZlibDecoder::new(payload)
        .read_to_end(&mut json)
        .map_err(CoordinatorError::Compress)?;

    serde_json::from_slice(&json).map_err(|source| CoordinatorError::Encode {
        what: "active apps",
        source,
    })
}

/// Publishes the applications active in each successive window.
///
/// Every flush covers `[since, now)` and then moves `since` to `now`,
/// whether or not the publish went through, so windows never overlap and
/// a failed window is not retried.
pub struct SnapshotFlusher {
    registry: Arc<RouteRegistry>,
    bus: Arc<dyn MessageBus>,
    metrics: SyncMetrics,
    since: DateTime<Utc>,
}

impl SnapshotFlusher {
    pub fn new(registry: Arc<RouteRegistry>, bus: Arc<dyn MessageBus>, metrics: SyncMetrics) -> Self {
        Self {
            registry,
            bus,
            metrics,
            since: Utc::now(),
        }
    }

    /// Start of the next window
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    /// Publish the window ending at `now`.
    ///
    /// Returns the compressed size when the snapshot was published.
    pub async fn flush(&mut self, now: DateTime<Utc>) -> Option<usize> {
        let since = self.since;
        // A clock stepping backwards must not reopen an old window
        self.since = since.max(now);

        let apps = self.registry.active_between(since, now).await;
        let payload = match encode_snapshot(&apps) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Error encoding active apps: {}", e);
                self.metrics.snapshot_errors_total.inc();
                return None;
            }
        };

        let size = payload.len();
        debug!("Active apps: {}, message size: {}", apps.len(), size);

        match self.bus.publish(ACTIVE_APPS_SUBJECT, Bytes::from(payload)).await {
            Ok(()) => {
                self.metrics.snapshots_published_total.inc();
                Some(size)
            }
            Err(e) => {
                warn!("Error publishing to {}: {}", ACTIVE_APPS_SUBJECT, e);
                self.metrics.snapshot_errors_total.inc();
                None
            }
        }
    }

    /// Flush on every tick for the life of the task.
    ///
    /// Returns `None` when the interval is zero, which disables snapshots.
    pub fn spawn(mut self, interval: Duration) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            info!("Active apps interval is zero, snapshots disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let now = Utc::now();
                self.flush(now).await;
            }
        }))
    }
}
