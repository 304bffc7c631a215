use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::{RpcRequest, ServiceEndpoint};

use super::LoadBalancer;

/// Atomic counter modulo endpoint-count, tie-broken by natural (index)
/// order. Thread-safe under concurrent callers; no starvation since the
/// counter only ever increases (spec.md §4.6).
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select<'a>(
        &self,
        endpoints: &'a [ServiceEndpoint],
        _request: &RpcRequest,
    ) -> Option<&'a ServiceEndpoint> {
        if endpoints.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        endpoints.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_is_deterministic_across_six_selections() {
        let balancer = RoundRobinBalancer::new();
        let endpoints = vec![
            ServiceEndpoint::new("127.0.0.1", 8001),
            ServiceEndpoint::new("127.0.0.1", 8002),
            ServiceEndpoint::new("127.0.0.1", 8003),
        ];
        let request = crate::balancer::tests::sample_request();
        let picked: Vec<u16> = (0..6)
            .map(|_| balancer.select(&endpoints, &request).unwrap().port)
            .collect();
        assert_eq!(picked, vec![8001, 8002, 8003, 8001, 8002, 8003]);
    }
}
