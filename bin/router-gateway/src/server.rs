use anyhow::Result;
use async_trait::async_trait;
use hyper::{
    body::Bytes,
    header::HOST,
    server::conn::http1,
    service::service_fn,
    Request, Response,
};
use hyper_util::rt::tokio::TokioIo;
use http_body_util::Full;
use router_core::CoreError;
use router_proxy::{HttpProxy, RequestForwarder};
use router_sync::Serve;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// HTTP/1 front end that proxies requests to the endpoints in the registry
pub struct ProxyServer {
    proxy: Arc<HttpProxy>,
    forwarder: Arc<RequestForwarder>,
}

impl ProxyServer {
    pub fn new(proxy: Arc<HttpProxy>, backend_timeout: Duration) -> Self {
        Self {
            proxy,
            forwarder: Arc::new(RequestForwarder::new(backend_timeout)),
        }
    }
}

#[async_trait]
impl Serve for ProxyServer {
    async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);

            let proxy = self.proxy.clone();
            let forwarder = self.forwarder.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let proxy = proxy.clone();
                    let forwarder = forwarder.clone();
                    handle_request(req, proxy, forwarder)
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    proxy: Arc<HttpProxy>,
    forwarder: Arc<RequestForwarder>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default()
        .to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    debug!("{} {}{}", req.method(), host, path_and_query);

    let response = match proxy.get_endpoint(&host).await {
        Ok(endpoint) => {
            let target_url = HttpProxy::build_target_url(&endpoint, &path_and_query);
            match forwarder.forward(&target_url, req).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Error forwarding to {}: {}", target_url, e);
                    HttpProxy::bad_gateway_response(&e.to_string())
                }
            }
        }
        Err(CoreError::RouteNotFound(_)) => HttpProxy::not_found_response(&host),
        Err(e) => HttpProxy::service_unavailable_response(&e.to_string()),
    };

    Ok(response.map(Full::new))
}
