//! HTTP proxy resolving request hosts to registered backends

use hyper::{body::Bytes, Response, StatusCode};
use router_core::{CoreError, Endpoint, Result, RouteRegistry};
use std::sync::Arc;
use tracing::debug;

use crate::LoadBalancer;

/// HTTP proxy for forwarding requests to backends registered on the bus
pub struct HttpProxy {
    registry: Arc<RouteRegistry>,
    balancer: LoadBalancer,
}

impl HttpProxy {
    /// Create a new HTTP proxy backed by the route registry
    pub fn new(registry: Arc<RouteRegistry>) -> Self {
        Self {
            registry,
            balancer: LoadBalancer::new(),
        }
    }

    /// Get the route registry
    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    /// Pick the endpoint serving `host` (a `Host` header value)
    pub async fn get_endpoint(&self, host: &str) -> Result<Endpoint> {
        let endpoints = self.registry.lookup(host).await?;

        let endpoint = self
            .balancer
            .select(&endpoints)
            .cloned()
            .ok_or_else(|| CoreError::NoEndpoints(host.to_string()))?;

        debug!("Selected endpoint for {}: {}", host, endpoint.address());
        Ok(endpoint)
    }

    /// Build a target URL for an endpoint
    pub fn build_target_url(endpoint: &Endpoint, path_and_query: &str) -> String {
        format!("http://{}{}", endpoint.address(), path_and_query)
    }

    /// Create a 502 Bad Gateway response
    pub fn bad_gateway_response(reason: &str) -> Response<Bytes> {
        text_response(StatusCode::BAD_GATEWAY, format!("Bad Gateway: {}\n", reason))
    }

    /// Create a 503 Service Unavailable response
    pub fn service_unavailable_response(reason: &str) -> Response<Bytes> {
        text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Service Unavailable: {}\n", reason),
        )
    }

    /// Create a 404 Not Found response
    pub fn not_found_response(reason: &str) -> Response<Bytes> {
        text_response(StatusCode::NOT_FOUND, format!("Not Found: {}\n", reason))
    }
}

pub(crate) fn text_response(status: StatusCode, body: String) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response
}
