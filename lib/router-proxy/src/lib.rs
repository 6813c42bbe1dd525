//! HTTP proxy resolving routes against the route registry
pub mod forwarder;
pub mod http;
pub mod load_balancer;

pub use forwarder::RequestForwarder;
pub use http::HttpProxy;
pub use load_balancer::LoadBalancer;
