//! Prometheus counters for bus synchronization

use prometheus::{Counter, CounterVec, Opts, Registry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::sync::RegistryAction;

/// Counters shared by the coordinator's tasks.
///
/// Clones share the same underlying metrics and registry.
#[derive(Clone)]
pub struct SyncMetrics {
    /// Bus connection attempts, successful or not
    pub bus_connect_attempts_total: Counter,
    /// Route announcements applied, by subject
    pub registry_messages_total: CounterVec,
    /// Route announcements dropped as malformed, by subject
    pub registry_decode_errors_total: CounterVec,
    pub heartbeats_published_total: Counter,
    pub heartbeat_errors_total: Counter,
    pub snapshots_published_total: Counter,
    pub snapshot_errors_total: Counter,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

/// Point-in-time counter values, embedded in the stats view
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub bus_connect_attempts: u64,
    pub registry_messages: BTreeMap<String, u64>,
    pub registry_decode_errors: BTreeMap<String, u64>,
    pub heartbeats_published: u64,
    pub heartbeat_errors: u64,
    pub snapshots_published: u64,
    pub snapshot_errors: u64,
}

impl SyncMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let bus_connect_attempts_total = Counter::new(
            "router_bus_connect_attempts_total",
            "Bus connection attempts",
        )?;
        let registry_messages_total = CounterVec::new(
            Opts::new(
                "router_registry_messages_total",
                "Route announcements applied to the registry",
            ),
            &["subject"],
        )?;
        let registry_decode_errors_total = CounterVec::new(
            Opts::new(
                "router_registry_decode_errors_total",
                "Route announcements dropped as malformed",
            ),
            &["subject"],
        )?;
        let heartbeats_published_total = Counter::new(
            "router_heartbeats_published_total",
            "Heartbeats published on router.start",
        )?;
        let heartbeat_errors_total = Counter::new(
            "router_heartbeat_errors_total",
            "Heartbeat publish failures",
        )?;
        let snapshots_published_total = Counter::new(
            "router_snapshots_published_total",
            "Active-apps snapshots published",
        )?;
        let snapshot_errors_total = Counter::new(
            "router_snapshot_errors_total",
            "Active-apps snapshots skipped or failed",
        )?;

        registry.register(Box::new(bus_connect_attempts_total.clone()))?;
        registry.register(Box::new(registry_messages_total.clone()))?;
        registry.register(Box::new(registry_decode_errors_total.clone()))?;
        registry.register(Box::new(heartbeats_published_total.clone()))?;
        registry.register(Box::new(heartbeat_errors_total.clone()))?;
        registry.register(Box::new(snapshots_published_total.clone()))?;
        registry.register(Box::new(snapshot_errors_total.clone()))?;

        Ok(Self {
            bus_connect_attempts_total,
            registry_messages_total,
            registry_decode_errors_total,
            heartbeats_published_total,
            heartbeat_errors_total,
            snapshots_published_total,
            snapshot_errors_total,
            registry,
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let per_subject = |vec: &CounterVec| -> BTreeMap<String, u64> {
            [RegistryAction::Register, RegistryAction::Unregister]
                .into_iter()
                .map(|action| {
                    let subject = action.subject();
                    (subject.to_string(), vec.with_label_values(&[subject]).get() as u64)
                })
                .collect()
        };

        MetricsSnapshot {
            bus_connect_attempts: self.bus_connect_attempts_total.get() as u64,
            registry_messages: per_subject(&self.registry_messages_total),
            registry_decode_errors: per_subject(&self.registry_decode_errors_total),
            heartbeats_published: self.heartbeats_published_total.get() as u64,
            heartbeat_errors: self.heartbeat_errors_total.get() as u64,
            snapshots_published: self.snapshots_published_total.get() as u64,
            snapshot_errors: self.snapshot_errors_total.get() as u64,
        }
    }
}
