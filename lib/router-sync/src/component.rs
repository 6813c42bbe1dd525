//! Stats and health views of the router, and their announcement to the
//! component directory

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use router_bus::MessageBus;
use router_core::registry::StaleCheck;
use router_core::{Lockable, RouteRegistry};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{CoordinatorError, RouterConfig, SyncMetrics};

pub const ANNOUNCE_SUBJECT: &str = "vcap.component.announce";
pub const DISCOVER_SUBJECT: &str = "vcap.component.discover";

/// How long the health probe waits for the registry lock
pub const DEFAULT_HEALTH_BOUND: Duration = Duration::from_secs(1);

/// Identity of this component as announced to the directory
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComponentDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub index: u32,
    pub uuid: String,
    /// `ip:port` of the status views, absent when no status port is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub credentials: Vec<String>,
    pub start: DateTime<Utc>,
}

/// Source of a JSON document served under an info route
#[async_trait]
pub trait InfoSource: Send + Sync {
    async fn render(&self) -> Value;
}

#[async_trait]
impl InfoSource for RouteRegistry {
    async fn render(&self) -> Value {
        json!(self.route_table().await)
    }
}

/// Stats view: registry counts plus the coordinator's counters
pub struct Varz {
    registry: Arc<RouteRegistry>,
    metrics: SyncMetrics,
}

impl Varz {
    pub fn new(registry: Arc<RouteRegistry>, metrics: SyncMetrics) -> Self {
        Self { registry, metrics }
    }

    pub async fn render(&self, descriptor: &ComponentDescriptor) -> Value {
        let uptime = (Utc::now() - descriptor.start).num_seconds().max(0);
        json!({
            "type": descriptor.kind,
            "index": descriptor.index,
            "uuid": descriptor.uuid,
            "host": descriptor.host,
            "start": descriptor.start,
            "uptime": uptime,
            "registry": self.registry.stats().await,
            "counters": self.metrics.snapshot(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub stale: bool,
}

impl HealthReport {
    /// Body of the health response
    pub fn body(&self) -> &'static str {
        if self.healthy {
            "ok"
        } else {
            "unhealthy"
        }
    }
}

/// Liveness view: healthy while the resource lock can be taken in time
pub struct Healthz {
    resource: Arc<dyn Lockable>,
    stale: StaleCheck,
    bound: Duration,
}

impl Healthz {
    pub fn new(resource: Arc<dyn Lockable>, stale: StaleCheck) -> Self {
        Self {
            resource,
            stale,
            bound: DEFAULT_HEALTH_BOUND,
        }
    }

    /// Probe the registry lock and report its staleness
    pub fn for_registry(registry: Arc<RouteRegistry>) -> Self {
        let stale_registry = Arc::clone(&registry);
        Self::new(registry, Arc::new(move || stale_registry.is_state_stale()))
    }

    pub fn with_bound(mut self, bound: Duration) -> Self {
        self.bound = bound;
        self
    }

    pub async fn check(&self) -> HealthReport {
        let healthy = self.resource.try_lock_within(self.bound).await;
        if !healthy {
            warn!("Health probe could not lock registry within {:?}", self.bound);
        }
        HealthReport {
            healthy,
            stale: (self.stale)(),
        }
    }
}

/// Everything the component directory needs to know about this router
pub struct Component {
    pub descriptor: ComponentDescriptor,
    pub varz: Varz,
    pub healthz: Healthz,
    pub info_routes: BTreeMap<String, Arc<dyn InfoSource>>,
}

impl Component {
    pub fn new(
        config: &RouterConfig,
        ip: &str,
        registry: Arc<RouteRegistry>,
        metrics: SyncMetrics,
    ) -> Self {
        let descriptor = ComponentDescriptor {
            kind: "Router".to_string(),
            index: config.index,
            uuid: Uuid::new_v4().to_string(),
            host: config.status_host(ip),
            credentials: vec![config.status.user.clone(), config.status.pass.clone()],
            start: Utc::now(),
        };

        let mut info_routes: BTreeMap<String, Arc<dyn InfoSource>> = BTreeMap::new();
        info_routes.insert("/routes".to_string(), registry.clone());

        Self {
            descriptor,
            varz: Varz::new(registry.clone(), metrics),
            healthz: Healthz::for_registry(registry),
            info_routes,
        }
    }

    pub async fn varz(&self) -> Value {
        self.varz.render(&self.descriptor).await
    }

    pub async fn healthz(&self) -> HealthReport {
        self.healthz.check().await
    }

    /// Render the document under an info route, if one is registered
    pub async fn info(&self, path: &str) -> Option<Value> {
        match self.info_routes.get(path) {
            Some(source) => Some(source.render().await),
            None => None,
        }
    }

    pub fn announcement(&self) -> crate::Result<Bytes> {
        serde_json::to_vec(&self.descriptor)
            .map(Bytes::from)
            .map_err(|source| CoordinatorError::Encode {
                what: "component announcement",
                source,
            })
    }

    /// Descriptor plus the current stats, health and info views
    pub async fn discovery_response(&self) -> crate::Result<Bytes> {
        let encode_error = |source: serde_json::Error| CoordinatorError::Encode {
            what: "discovery response",
            source,
        };

        let health = self.healthz().await;
        let mut info = serde_json::Map::new();
        for path in self.info_routes.keys() {
            if let Some(document) = self.info(path).await {
                info.insert(path.clone(), document);
            }
        }

        let mut response = serde_json::to_value(&self.descriptor).map_err(encode_error)?;
        if let Value::Object(fields) = &mut response {
            fields.insert("varz".to_string(), self.varz().await);
            fields.insert(
                "healthz".to_string(),
                json!({
                    "healthy": health.healthy,
                    "stale": health.stale,
                    "status": health.body(),
                }),
            );
            fields.insert("info".to_string(), Value::Object(info));
        }

        serde_json::to_vec(&response)
            .map(Bytes::from)
            .map_err(encode_error)
    }
}

/// Registry of components reachable by operators.
///
/// Returns the task answering directory requests, if one was started.
#[async_trait]
pub trait ComponentDirectory: Send + Sync {
    async fn register(
        &self,
        component: Arc<Component>,
        bus: Arc<dyn MessageBus>,
    ) -> anyhow::Result<Option<JoinHandle<()>>>;
}

/// Directory that lives on the bus: the component announces itself and
/// answers every discovery request with its descriptor and current views.
#[derive(Debug, Default)]
pub struct BusDirectory;

#[async_trait]
impl ComponentDirectory for BusDirectory {
    async fn register(
        &self,
        component: Arc<Component>,
        bus: Arc<dyn MessageBus>,
    ) -> anyhow::Result<Option<JoinHandle<()>>> {
        let payload = component.announcement()?;

        let mut discover = bus.subscribe(DISCOVER_SUBJECT).await?;
        bus.publish(ANNOUNCE_SUBJECT, payload).await?;
        debug!(
            uuid = %component.descriptor.uuid,
            "Announced component {} index {}",
            component.descriptor.kind,
            component.descriptor.index
        );

        Ok(Some(tokio::spawn(async move {
            while discover.next().await.is_some() {
                let response = match component.discovery_response().await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Error building discovery response: {}", e);
                        continue;
                    }
                };
                if let Err(e) = bus.publish(ANNOUNCE_SUBJECT, response).await {
                    warn!("Error publishing to {}: {}", ANNOUNCE_SUBJECT, e);
                }
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use router_bus::LocalBus;
    use router_core::RouteAnnouncement;

    fn component() -> (Arc<RouteRegistry>, Component) {
        let registry = Arc::new(RouteRegistry::new());
        let mut config = RouterConfig::default();
        config.index = 2;
        config.status.port = 8082;
        config.status.user = "admin".to_string();
        config.status.pass = "secret".to_string();

        let component = Component::new(&config, "10.0.0.1", registry.clone(), SyncMetrics::new().unwrap());
        (registry, component)
    }

    #[test]
    fn test_descriptor() {
        let (_, component) = component();
        assert_eq!(component.descriptor.kind, "Router");
        assert_eq!(component.descriptor.index, 2);
        assert_eq!(component.descriptor.host.as_deref(), Some("10.0.0.1:8082"));
        assert_eq!(component.descriptor.credentials, vec!["admin", "secret"]);

        let announcement: Value = serde_json::from_slice(&component.announcement().unwrap()).unwrap();
        assert_eq!(announcement["type"], "Router");
        assert_eq!(announcement["index"], 2);
    }

    #[test]
    fn test_no_status_host_by_default() {
        let registry = Arc::new(RouteRegistry::new());
        let component = Component::new(&RouterConfig::default(), "10.0.0.1", registry, SyncMetrics::new().unwrap());
        assert_eq!(component.descriptor.host, None);

        let announcement: Value = serde_json::from_slice(&component.announcement().unwrap()).unwrap();
        assert!(announcement.get("host").is_none());
    }

    #[tokio::test]
    async fn test_varz_and_routes() {
        let (registry, component) = component();
        let announcement = RouteAnnouncement::decode(
            br#"{"host":"10.0.0.5","port":6000,"uris":["app.example.com"],"app":"app-1"}"#,
        )
        .unwrap();
        registry.register(&announcement).await;

        let varz = component.varz().await;
        assert_eq!(varz["registry"]["routes"], 1);
        assert_eq!(varz["registry"]["stale"], false);
        assert_eq!(varz["counters"]["heartbeats_published"], 0);

        let routes = component.info("/routes").await.expect("routes info");
        assert_eq!(routes["app.example.com"][0], "10.0.0.5:6000");
        assert!(component.info("/unknown").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthz_reports_stale_but_healthy() {
        let (registry, component) = component();
        registry.set_stale_check(|| true);

        let report = component.healthz().await;
        assert_eq!(report, HealthReport { healthy: true, stale: true });
        assert_eq!(report.body(), "ok");
    }

    struct Wedged;

    #[async_trait]
    impl Lockable for Wedged {
        async fn try_lock_within(&self, bound: Duration) -> bool {
            tokio::time::sleep(bound).await;
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthz_unhealthy_when_lock_unavailable() {
        let healthz = Healthz::new(Arc::new(Wedged), Arc::new(|| false))
            .with_bound(Duration::from_millis(100));

        let report = healthz.check().await;
        assert!(!report.healthy);
        assert_eq!(report.body(), "unhealthy");
    }

    #[tokio::test]
    async fn test_bus_directory_answers_discovery_with_views() {
        let (registry, component) = component();
        let announcement = RouteAnnouncement::decode(
            br#"{"host":"10.0.0.5","port":6000,"uris":["app.example.com"],"app":"app-1"}"#,
        )
        .unwrap();
        registry.register(&announcement).await;

        let bus = Arc::new(LocalBus::connected());
        let mut announcements = bus.subscribe(ANNOUNCE_SUBJECT).await.unwrap();

        let responder = BusDirectory
            .register(Arc::new(component), bus.clone())
            .await
            .expect("register ok")
            .expect("responder task");
        let first: Value = serde_json::from_slice(&announcements.next().await.unwrap().payload).unwrap();
        assert_eq!(first["type"], "Router");
        assert!(first.get("varz").is_none());

        bus.publish(DISCOVER_SUBJECT, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let second: Value = serde_json::from_slice(&announcements.next().await.unwrap().payload).unwrap();
        assert_eq!(second["uuid"], first["uuid"]);
        assert_eq!(second["varz"]["registry"]["routes"], 1);
        assert_eq!(second["healthz"]["healthy"], true);
        assert_eq!(second["healthz"]["status"], "ok");
        assert_eq!(second["info"]["/routes"]["app.example.com"][0], "10.0.0.5:6000");

        responder.abort();
    }

    #[tokio::test]
    async fn test_aborted_responder_stops_answering() {
        let (_, component) = component();
        let bus = Arc::new(LocalBus::connected());

        let responder = BusDirectory
            .register(Arc::new(component), bus.clone())
            .await
            .expect("register ok")
            .expect("responder task");
        responder.abort();
        let _ = responder.await;

        bus.publish(DISCOVER_SUBJECT, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.delivered(ANNOUNCE_SUBJECT).len(), 1);
    }
}
