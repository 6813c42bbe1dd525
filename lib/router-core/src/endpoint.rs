//! Backend endpoint management
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::RouteAnnouncement;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub app_id: String,
    pub private_instance_id: String,
    pub tags: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn from_announcement(announcement: &RouteAnnouncement, updated_at: DateTime<Utc>) -> Self {
        Self {
            host: announcement.host.clone(),
            port: announcement.port,
            app_id: announcement.app.clone(),
            private_instance_id: announcement.private_instance_id.clone(),
            tags: announcement.tags.clone(),
            updated_at,
        }
    }

    /// `host:port` address of the backend
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
