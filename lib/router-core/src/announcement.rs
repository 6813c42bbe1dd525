//! Route announcements exchanged between routers and their peers

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A register/unregister message describing a backend and the URIs it serves.
///
/// Peers publish these on `router.register` and `router.unregister`. The
/// same shape is used for both; the topic decides whether the backend is
/// added to or removed from each URI's pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAnnouncement {
    /// Backend host (IP or name)
    pub host: String,

    /// Backend port
    pub port: u16,

    /// Route URIs served by the backend
    pub uris: Vec<String>,

    /// Free-form tags attached by the announcing component
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Application identifier
    #[serde(default)]
    pub app: String,

    /// Identifier of the execution agent hosting the backend
    #[serde(default)]
    pub dea: String,

    /// Per-instance identifier, used for sticky sessions
    #[serde(default)]
    pub private_instance_id: String,
}

impl RouteAnnouncement {
    /// Decode an announcement from a raw bus payload.
    ///
    /// A payload that is not valid JSON, lacks `host`/`port`/`uris`, or names
    /// no URIs at all is rejected.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let announcement: RouteAnnouncement = serde_json::from_slice(payload)?;

        if announcement.host.trim().is_empty() {
            return Err(CoreError::InvalidAnnouncement("empty host".to_string()));
        }
        if announcement.uris.iter().all(|uri| uri.trim().is_empty()) {
            return Err(CoreError::InvalidAnnouncement("no route uris".to_string()));
        }

        Ok(announcement)
    }

    /// Key identifying the backend within a route's pool
    pub fn backend_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
