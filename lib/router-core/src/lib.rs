//! Core route registry functionality
//!
//! This library provides:
//! - Route registry mapping URIs to pools of backend endpoints
//! - Route announcements received from peers over the bus
//! - Lock probing used by liveness reporting

pub mod announcement;
pub mod endpoint;
pub mod error;
pub mod lockable;
pub mod registry;

pub use announcement::RouteAnnouncement;
pub use endpoint::Endpoint;
pub use error::{CoreError, Result};
pub use lockable::Lockable;
pub use registry::{RegistryStats, RouteRegistry};
