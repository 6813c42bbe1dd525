//! Route registry synchronization and router lifecycle
//!
//! This library provides:
//! - Bus connection management with fixed-delay retry
//! - Registry synchronization from `router.register` / `router.unregister`
//! - Heartbeat (`router.start`) and active-apps snapshot publication
//! - Stats and health views announced to the component directory
//! - The startup sequence that warms the registry before listening

pub mod component;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod snapshot;
pub mod startup;
pub mod sync;

pub use component::{BusDirectory, Component, ComponentDirectory, HealthReport, Healthz, Varz};
pub use config::RouterConfig;
pub use error::{CoordinatorError, Result};
pub use heartbeat::{HeartbeatMessage, HeartbeatPublisher};
pub use metrics::SyncMetrics;
pub use snapshot::SnapshotFlusher;
pub use startup::{Router, RouterTasks, Serve};
pub use sync::{RegistryAction, RegistrySync};
