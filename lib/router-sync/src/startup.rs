//! Router startup sequence

use async_trait::async_trait;
use router_bus::MessageBus;
use router_core::RouteRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::component::{Component, ComponentDirectory};
use crate::connection::spawn_connection_manager;
use crate::heartbeat::{local_ip, HeartbeatMessage, HeartbeatPublisher};
use crate::snapshot::SnapshotFlusher;
use crate::sync::{RegistryAction, RegistrySync};
use crate::{CoordinatorError, Result, RouterConfig, SyncMetrics};

/// Serves traffic on the listener handed over at the end of startup
#[async_trait]
pub trait Serve: Send + Sync {
    async fn serve(&self, listener: TcpListener) -> anyhow::Result<()>;
}

/// Background tasks started by [`Router::start`].
///
/// They run for the life of the process unless aborted.
pub struct RouterTasks {
    pub connection: JoinHandle<()>,
    /// Answers component directory requests
    pub directory: Option<JoinHandle<()>>,
    pub heartbeat: Option<JoinHandle<()>>,
    pub register: Option<JoinHandle<()>>,
    pub unregister: Option<JoinHandle<()>>,
    pub snapshot: Option<JoinHandle<()>>,
}

impl RouterTasks {
    pub fn abort_all(&self) {
        self.connection.abort();
        for handle in [
            &self.directory,
            &self.heartbeat,
            &self.register,
            &self.unregister,
            &self.snapshot,
        ]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Router coordinates the bus, the route registry and the listener
pub struct Router {
    config: RouterConfig,
    ip: String,
    bus: Arc<dyn MessageBus>,
    registry: Arc<RouteRegistry>,
    metrics: SyncMetrics,
    component: Arc<Component>,
    directory: Arc<dyn ComponentDirectory>,
}

impl Router {
    /// Create a router; determines the host address when none is configured
    pub fn new(
        config: RouterConfig,
        bus: Arc<dyn MessageBus>,
        directory: Arc<dyn ComponentDirectory>,
    ) -> Result<Self> {
        let ip = match &config.ip {
            Some(ip) => ip.clone(),
            None => local_ip()?.to_string(),
        };

        let registry = Arc::new(RouteRegistry::new());
        let bus_check = Arc::clone(&bus);
        registry.set_stale_check(move || !bus_check.ping());

        let metrics = SyncMetrics::new()?;
        let component = Arc::new(Component::new(&config, &ip, registry.clone(), metrics.clone()));

        Ok(Self {
            config,
            ip,
            bus,
            registry,
            metrics,
            component,
            directory,
        })
    }

    pub fn registry(&self) -> Arc<RouteRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn component(&self) -> Arc<Component> {
        Arc::clone(&self.component)
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Connect, register, announce, subscribe and schedule snapshots.
    ///
    /// Only a failed initial heartbeat stops startup.
    pub async fn start(&self) -> Result<RouterTasks> {
        let connection = spawn_connection_manager(Arc::clone(&self.bus), self.metrics.clone());

        let directory = match self
            .directory
            .register(self.component(), Arc::clone(&self.bus))
            .await
        {
            Ok(responder) => responder,
            Err(e) => {
                error!("Error registering component: {}", e);
                None
            }
        };

        let message = HeartbeatMessage::new(vec![self.ip.clone()]);
        let heartbeat = HeartbeatPublisher::new(
            Arc::clone(&self.bus),
            &message,
            self.config.heartbeat_interval(),
            self.metrics.clone(),
        )?;
        if let Err(e) = heartbeat.announce().await {
            connection.abort();
            if let Some(responder) = &directory {
                responder.abort();
            }
            return Err(e);
        }
        let heartbeat = heartbeat.spawn();

        let sync = Arc::new(RegistrySync::new(self.registry(), self.metrics.clone()));
        let register = sync.subscribe(self.bus.as_ref(), RegistryAction::Register).await;
        let unregister = sync.subscribe(self.bus.as_ref(), RegistryAction::Unregister).await;

        let snapshot = SnapshotFlusher::new(self.registry(), Arc::clone(&self.bus), self.metrics.clone())
            .spawn(self.config.snapshot_interval());

        Ok(RouterTasks {
            connection,
            directory,
            heartbeat,
            register,
            unregister,
            snapshot,
        })
    }

    /// Give peers one heartbeat interval to announce their routes
    pub async fn warm_up(&self) {
        let interval = self.config.heartbeat_interval();
        if interval.is_zero() {
            return;
        }

        info!("Waiting {:?} before listening...", interval);
        tokio::time::sleep(interval).await;
    }

    /// Bind the proxy listener and write the pid file
    pub async fn listen(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CoordinatorError::Bind { addr, source })?;

        if let Some(pidfile) = &self.config.pidfile {
            if let Err(e) = std::fs::write(pidfile, std::process::id().to_string()) {
                warn!("Could not write pid file {}: {}", pidfile.display(), e);
            }
        }

        match listener.local_addr() {
            Ok(local) => info!("Listening on {}", local),
            Err(_) => info!("Listening on {}", addr),
        }
        Ok(listener)
    }

    /// Run the full startup sequence, then serve until the server stops
    pub async fn run<S>(&self, server: &S) -> Result<()>
    where
        S: Serve + ?Sized,
    {
        let tasks = self.start().await?;
        self.warm_up().await;

        let result = match self.listen().await {
            Ok(listener) => server.serve(listener).await.map_err(CoordinatorError::Serve),
            Err(e) => Err(e),
        };

        tasks.abort_all();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{BusDirectory, ANNOUNCE_SUBJECT, DISCOVER_SUBJECT};
    use crate::heartbeat::START_SUBJECT;
    use crate::snapshot::ACTIVE_APPS_SUBJECT;
    use crate::sync::REGISTER_SUBJECT;
    use bytes::Bytes;
    use router_bus::LocalBus;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    fn config(heartbeat_secs: u64, snapshot_secs: u64) -> RouterConfig {
        let mut config = RouterConfig::default();
        config.ip = Some("10.0.0.1".to_string());
        config.port = 0;
        config.publish_start_message_interval = heartbeat_secs;
        config.publish_active_apps_interval = snapshot_secs;
        config
    }

    fn router(config: RouterConfig, bus: Arc<LocalBus>) -> Router {
        Router::new(config, bus, Arc::new(BusDirectory)).expect("router")
    }

    /// Records when it was handed the listener, then returns
    #[derive(Default)]
    struct RecordingServer {
        served_at: Mutex<Option<Instant>>,
    }

    #[async_trait]
    impl Serve for RecordingServer {
        async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
            listener.local_addr()?;
            *self.served_at.lock().unwrap() = Some(Instant::now());
            Ok(())
        }
    }

    struct FailingServer;

    #[async_trait]
    impl Serve for FailingServer {
        async fn serve(&self, _listener: TcpListener) -> anyhow::Result<()> {
            anyhow::bail!("listener closed")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_opens_after_one_heartbeat_interval() {
        let bus = Arc::new(LocalBus::new());
        let router = router(config(5, 0), bus);
        let server = RecordingServer::default();

        let started = Instant::now();
        router.run(&server).await.expect("run ok");

        let served_at = server.served_at.lock().unwrap().expect("served");
        assert!(served_at - started >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_interval_skips_warm_up() {
        let bus = Arc::new(LocalBus::new());
        let router = router(config(0, 0), bus.clone());
        let server = RecordingServer::default();

        let started = Instant::now();
        router.run(&server).await.expect("run ok");

        let served_at = server.served_at.lock().unwrap().expect("served");
        assert!(served_at - started < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_order_and_periodic_tasks() {
        let bus = Arc::new(LocalBus::new());
        let router = router(config(1, 2), bus.clone());

        let tasks = router.start().await.expect("start ok");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tasks.abort_all();

        // Component announcement precedes the first heartbeat
        assert_eq!(bus.delivered(ANNOUNCE_SUBJECT).len(), 1);
        assert!(bus.delivered(START_SUBJECT).len() >= 3);
        assert!(!bus.delivered(ACTIVE_APPS_SUBJECT).is_empty());
        assert!(tasks.register.is_some());
        assert!(tasks.unregister.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_and_snapshot_cadence() {
        let bus = Arc::new(LocalBus::connected());
        let router = router(config(1, 2), bus.clone());

        let tasks = router.start().await.expect("start ok");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tasks.abort_all();

        // t=0, t=1s, t=2s
        assert_eq!(bus.delivered(START_SUBJECT).len(), 3);
        // t=2s
        assert_eq!(bus.delivered(ACTIVE_APPS_SUBJECT).len(), 1);
        assert_eq!(router.metrics().snapshot().heartbeats_published, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_heartbeat_failure_is_fatal() {
        let bus = Arc::new(LocalBus::connected());
        bus.reject_publishes(true);
        let router = router(config(1, 0), bus);

        assert!(matches!(
            router.start().await,
            Err(CoordinatorError::InitialHeartbeat(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_startup_stops_directory_responder() {
        let bus = Arc::new(LocalBus::connected());
        bus.reject_publishes_to(START_SUBJECT);
        let router = router(config(1, 0), bus.clone());

        assert!(router.start().await.is_err());
        bus.publish(DISCOVER_SUBJECT, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(bus.delivered(ANNOUNCE_SUBJECT).len(), 1);
    }

    #[tokio::test]
    async fn test_abort_all_stops_directory_responder() {
        let bus = Arc::new(LocalBus::connected());
        let router = router(config(0, 0), bus.clone());

        let tasks = router.start().await.expect("start ok");
        assert!(tasks.directory.is_some());

        bus.publish(DISCOVER_SUBJECT, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        for _ in 0..100 {
            if bus.delivered(ANNOUNCE_SUBJECT).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bus.delivered(ANNOUNCE_SUBJECT).len(), 2);

        tasks.abort_all();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish(DISCOVER_SUBJECT, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.delivered(ANNOUNCE_SUBJECT).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_failure_is_not_fatal() {
        let bus = Arc::new(LocalBus::connected());
        bus.reject_subscriptions_to(REGISTER_SUBJECT);
        let router = router(config(1, 0), bus);

        let tasks = router.start().await.expect("start ok");
        assert!(tasks.register.is_none());
        assert!(tasks.unregister.is_some());
        assert!(tasks.snapshot.is_none());
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_routes_flow_into_registry() {
        let bus = Arc::new(LocalBus::connected());
        let router = router(config(0, 0), bus.clone());
        let tasks = router.start().await.expect("start ok");

        bus.publish(
            REGISTER_SUBJECT,
            Bytes::from_static(br#"{"host":"10.0.0.5","port":6000,"uris":["app.example.com"]}"#),
        )
        .await
        .unwrap();

        let registry = router.registry();
        for _ in 0..100 {
            if registry.route_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.route_count().await, 1);
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_registry_staleness_follows_bus() {
        let bus = Arc::new(LocalBus::connected());
        let router = router(config(0, 0), bus.clone());

        assert!(!router.registry().is_state_stale());
        bus.set_reachable(false);
        assert!(router.registry().is_state_stale());
        assert!(router.component().healthz().await.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_failure_is_fatal() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let mut config = config(0, 0);
        config.port = occupied.local_addr().unwrap().port();

        let router = router(config, Arc::new(LocalBus::connected()));
        let result = router.run(&RecordingServer::default()).await;
        assert!(matches!(result, Err(CoordinatorError::Bind { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_is_reported() {
        let router = router(config(0, 0), Arc::new(LocalBus::connected()));
        let result = router.run(&FailingServer).await;
        assert!(matches!(result, Err(CoordinatorError::Serve(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pidfile_written_after_bind() {
        let path = std::env::temp_dir().join(format!("router-sync-test-{}.pid", std::process::id()));
        let mut config = config(0, 0);
        config.pidfile = Some(path.clone());

        let router = router(config, Arc::new(LocalBus::connected()));
        router.run(&RecordingServer::default()).await.expect("run ok");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        std::fs::remove_file(&path).ok();
    }
}
