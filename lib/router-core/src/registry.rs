//! Route registry mapping route URIs to pools of backend endpoints

use crate::{CoreError, Endpoint, Lockable, Result, RouteAnnouncement};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Predicate reporting whether the registry's view may be out of date
pub type StaleCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Backends serving one URI, keyed by `host:port`
type EndpointPool = BTreeMap<String, Endpoint>;

/// RouteRegistry maintains the routes announced by peers over the bus.
///
/// All operations take `&self` and are safe to call from any number of
/// tasks. Registering an already known backend only refreshes its
/// timestamp, and unregistering an unknown one is a no-op, so duplicate
/// delivery of announcements leaves the same route set behind.
pub struct RouteRegistry {
    // Map of normalized route URI to its backend pool
    routes: Arc<RwLock<HashMap<String, EndpointPool>>>,
    stale_check: std::sync::RwLock<Option<StaleCheck>>,
}

/// Counters describing the registry contents
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub routes: usize,
    pub endpoints: usize,
    pub apps: usize,
    pub stale: bool,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            stale_check: std::sync::RwLock::new(None),
        }
    }

    /// Add the announced backend to the pool of every announced URI
    pub async fn register(&self, announcement: &RouteAnnouncement) {
        let key = announcement.backend_key();
        let endpoint = Endpoint::from_announcement(announcement, Utc::now());

        let mut routes = self.routes.write().await;
        for uri in normalized_uris(announcement) {
            routes
                .entry(uri.clone())
                .or_default()
                .insert(key.clone(), endpoint.clone());
            debug!("Registered {} for route {}", key, uri);
        }
    }

    /// Remove the announced backend from the pool of every announced URI
    pub async fn unregister(&self, announcement: &RouteAnnouncement) {
        let key = announcement.backend_key();

        let mut routes = self.routes.write().await;
        for uri in normalized_uris(announcement) {
            if let Some(pool) = routes.get_mut(&uri) {
                pool.remove(&key);
                if pool.is_empty() {
                    routes.remove(&uri);
                }
                debug!("Unregistered {} from route {}", key, uri);
            }
        }
    }

    /// Ids of the applications with an endpoint refreshed at or after `since`.
    ///
    /// The result is sorted and free of duplicates.
    pub async fn active_since(&self, since: DateTime<Utc>) -> Vec<String> {
        self.active_apps(|updated_at| updated_at >= since).await
    }

    /// Like [`active_since`](Self::active_since), limited to refreshes in
    /// `[since, until)`
    pub async fn active_between(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<String> {
        self.active_apps(|updated_at| updated_at >= since && updated_at < until)
            .await
    }

    async fn active_apps<F>(&self, in_window: F) -> Vec<String>
    where
        F: Fn(DateTime<Utc>) -> bool,
    {
        let routes = self.routes.read().await;
        let apps: BTreeSet<&str> = routes
            .values()
            .flat_map(|pool| pool.values())
            .filter(|endpoint| in_window(endpoint.updated_at) && !endpoint.app_id.is_empty())
            .map(|endpoint| endpoint.app_id.as_str())
            .collect();

        apps.into_iter().map(str::to_string).collect()
    }

    /// Get the endpoints serving a URI.
    ///
    /// The URI may carry a port suffix (as an HTTP `Host` header does).
    pub async fn lookup(&self, uri: &str) -> Result<Vec<Endpoint>> {
        let uri = normalize_uri(strip_port(uri));
        let routes = self.routes.read().await;
        let pool = routes
            .get(&uri)
            .ok_or_else(|| CoreError::RouteNotFound(uri.clone()))?;

        Ok(pool.values().cloned().collect())
    }

    /// Route table keyed by URI, listing backend addresses
    pub async fn route_table(&self) -> BTreeMap<String, Vec<String>> {
        let routes = self.routes.read().await;
        routes
            .iter()
            .map(|(uri, pool)| (uri.clone(), pool.keys().cloned().collect()))
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let routes = self.routes.read().await;
        let endpoints: BTreeSet<&str> = routes
            .values()
            .flat_map(|pool| pool.keys())
            .map(String::as_str)
            .collect();
        let apps: BTreeSet<&str> = routes
            .values()
            .flat_map(|pool| pool.values())
            .filter(|endpoint| !endpoint.app_id.is_empty())
            .map(|endpoint| endpoint.app_id.as_str())
            .collect();

        RegistryStats {
            routes: routes.len(),
            endpoints: endpoints.len(),
            apps: apps.len(),
            stale: self.is_state_stale(),
        }
    }

    /// Get count of registered routes
    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Install the predicate consulted by [`RouteRegistry::is_state_stale`]
    pub fn set_stale_check<F>(&self, check: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.stale_check.write() {
            *slot = Some(Arc::new(check));
        }
    }

    /// Whether the registry can no longer confirm it is receiving updates.
    ///
    /// Advisory only; mutation is never blocked on it.
    pub fn is_state_stale(&self) -> bool {
        let check = self
            .stale_check
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(Arc::clone));

        check.map(|check| check()).unwrap_or(false)
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Lockable for RouteRegistry {
    async fn try_lock_within(&self, bound: Duration) -> bool {
        tokio::time::timeout(bound, self.routes.write()).await.is_ok()
    }
}

fn normalized_uris(announcement: &RouteAnnouncement) -> BTreeSet<String> {
    announcement
        .uris
        .iter()
        .map(|uri| normalize_uri(uri))
        .filter(|uri| !uri.is_empty())
        .collect()
}

fn normalize_uri(uri: &str) -> String {
    uri.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
