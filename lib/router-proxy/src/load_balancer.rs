//! Load balancing across the endpoints of a route

use router_core::Endpoint;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin load balancer shared by all routes
#[derive(Debug, Default)]
pub struct LoadBalancer {
    round_robin_counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the next endpoint, or `None` for an empty pool
    pub fn select<'a>(&self, endpoints: &'a [Endpoint]) -> Option<&'a Endpoint> {
        if endpoints.is_empty() {
            return None;
        }

        let current = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);
        endpoints.get(current % endpoints.len())
    }
}
