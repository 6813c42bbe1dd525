use anyhow::{Context, Result};
use router_bus::{LocalBus, MessageBus, RedisBus};
use router_proxy::HttpProxy;
use router_sync::config::{BusConfig, BusKind, LoggingConfig};
use router_sync::{BusDirectory, Router, RouterConfig, Serve};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod server;

use server::ProxyServer;

fn main() -> Result<()> {
    let config = RouterConfig::load()?;
    init_tracing(&config.logging);

    let runtime = build_runtime(config.worker_threads).context("failed to start runtime")?;
    let result = runtime.block_on(run(config));
    if let Err(e) = &result {
        error!("router-gateway exiting: {:#}", e);
    }
    result
}

/// `RUST_LOG` takes precedence over the configured level
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn build_runtime(worker_threads: usize) -> std::io::Result<Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if worker_threads > 0 {
        builder.worker_threads(worker_threads);
    }
    builder.build()
}

fn build_bus(config: &BusConfig) -> Result<Arc<dyn MessageBus>> {
    match config.kind {
        BusKind::Local => {
            info!("Using in-process bus");
            Ok(Arc::new(LocalBus::new()))
        }
        BusKind::Redis => {
            let url = RedisBus::url(
                &config.host,
                config.port,
                config.user.as_deref(),
                config.pass.as_deref(),
            );
            info!("Using redis bus at {}:{}", config.host, config.port);
            Ok(Arc::new(RedisBus::new(&url)?))
        }
    }
}

async fn run(config: RouterConfig) -> Result<()> {
    info!("Starting router-gateway...");

    let bus = build_bus(&config.bus)?;
    let router = Router::new(config, bus, Arc::new(BusDirectory))?;
    info!("Router initialized");

    let proxy = Arc::new(HttpProxy::new(router.registry()));
    let server = ProxyServer::new(proxy, Duration::from_secs(30));
    info!("HTTP proxy initialized with 30s backend timeout");

    serve_until(&router, &server, tokio::signal::ctrl_c()).await
}

/// Run the router until it fails or `shutdown` resolves
async fn serve_until<S, F>(router: &Router, server: &S, shutdown: F) -> Result<()>
where
    S: Serve,
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = router.run(server) => result?,
        signal = shutdown => {
            signal?;
            info!("Shutdown signal received, exiting...");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use router_bus::LocalBus;
    use router_sync::heartbeat::START_SUBJECT;

    fn config(port: u16) -> RouterConfig {
        let mut config = RouterConfig::default();
        config.ip = Some("127.0.0.1".to_string());
        config.port = port;
        config.publish_start_message_interval = 0;
        config
    }

    fn server(router: &Router) -> ProxyServer {
        ProxyServer::new(Arc::new(HttpProxy::new(router.registry())), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let bus = Arc::new(LocalBus::connected());
        let router = Router::new(config(0), bus.clone(), Arc::new(BusDirectory)).unwrap();
        let server = server(&router);

        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        };
        serve_until(&router, &server, shutdown).await.expect("clean shutdown");

        // The startup sequence ran before serving
        assert_eq!(bus.delivered(START_SUBJECT).len(), 1);
    }

    #[tokio::test]
    async fn test_bind_failure_ends_run() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let bus = Arc::new(LocalBus::connected());
        let router = Router::new(config(port), bus, Arc::new(BusDirectory)).unwrap();
        let server = server(&router);

        let result = serve_until(&router, &server, std::future::pending()).await;
        assert!(result.is_err());
    }
}
