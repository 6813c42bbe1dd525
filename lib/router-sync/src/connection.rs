//! Bus connection management

use router_bus::MessageBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::SyncMetrics;

/// Fixed pause between connection attempts
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Connect in the background, retrying until the bus accepts the connection
pub fn spawn_connection_manager(bus: Arc<dyn MessageBus>, metrics: SyncMetrics) -> JoinHandle<()> {
    tokio::spawn(async move {
        connect_with_retry(bus.as_ref(), &metrics).await;
    })
}

/// Try to connect forever, sleeping [`CONNECT_RETRY_DELAY`] after each
/// failure. Returns the number of attempts it took.
pub async fn connect_with_retry(bus: &dyn MessageBus, metrics: &SyncMetrics) -> u32 {
    let mut attempts = 0;
    loop {
        attempts += 1;
        metrics.bus_connect_attempts_total.inc();

        match bus.connect().await {
            Ok(()) => {
                info!(attempts, "Connected to bus");
                return attempts;
            }
            Err(e) => {
                error!("Could not connect to bus: {}", e);
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}
