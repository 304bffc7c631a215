use rand::Rng;

use crate::model::{RpcRequest, ServiceEndpoint};

use super::LoadBalancer;

/// Uniform random selection. Stateless, thread-safe (spec.md §4.6).
#[derive(Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RandomBalancer {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select<'a>(
        &self,
        endpoints: &'a [ServiceEndpoint],
        _request: &RpcRequest,
    ) -> Option<&'a ServiceEndpoint> {
        if endpoints.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..endpoints.len());
        endpoints.get(idx)
    }
}
