//! Registry synchronization from route announcements on the bus

use router_bus::MessageBus;
use router_core::{RouteAnnouncement, RouteRegistry};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::SyncMetrics;

pub const REGISTER_SUBJECT: &str = "router.register";
pub const UNREGISTER_SUBJECT: &str = "router.unregister";

/// What an announcement does to the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryAction {
    Register,
    Unregister,
}

impl RegistryAction {
    pub fn subject(self) -> &'static str {
        match self {
            RegistryAction::Register => REGISTER_SUBJECT,
            RegistryAction::Unregister => UNREGISTER_SUBJECT,
        }
    }
}

/// Applies route announcements received on the bus to the registry
pub struct RegistrySync {
    registry: Arc<RouteRegistry>,
    metrics: SyncMetrics,
}

impl RegistrySync {
    pub fn new(registry: Arc<RouteRegistry>, metrics: SyncMetrics) -> Self {
        Self { registry, metrics }
    }

    /// Decode one payload and apply it.
    ///
    /// Malformed payloads are logged and dropped; returns whether the
    /// registry was updated.
    pub async fn handle(&self, action: RegistryAction, payload: &[u8]) -> bool {
        let subject = action.subject();

        let announcement = match RouteAnnouncement::decode(payload) {
            Ok(announcement) => announcement,
            Err(e) => {
                let raw = String::from_utf8_lossy(payload);
                warn!(
                    payload = %raw,
                    "{}: Error decoding route announcement ({}; {}): {}",
                    subject,
                    payload.len(),
                    raw,
                    e
                );
                self.metrics
                    .registry_decode_errors_total
                    .with_label_values(&[subject])
                    .inc();
                return false;
            }
        };

        debug!(message = ?announcement, "{}: Received message", subject);

        match action {
            RegistryAction::Register => self.registry.register(&announcement).await,
            RegistryAction::Unregister => self.registry.unregister(&announcement).await,
        }
        self.metrics
            .registry_messages_total
            .with_label_values(&[subject])
            .inc();
        true
    }

    /// Subscribe to the subject for `action` and apply its messages in
    /// delivery order on a dedicated task.
    ///
    /// A rejected subscription is logged and yields `None`.
    pub async fn subscribe(
        self: &Arc<Self>,
        bus: &dyn MessageBus,
        action: RegistryAction,
    ) -> Option<JoinHandle<()>> {
        let subject = action.subject();

        let mut subscription = match bus.subscribe(subject).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Error subscribing to {}: {}", subject, e);
                return None;
            }
        };
        info!("Subscribed to {}", subject);

        let sync = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                sync.handle(action, &message.payload).await;
            }
            error!("Subscription to {} closed, no further updates will be applied", subject);
        }))
    }
}
