//! Load balancers (spec.md §4.6). All implementations receive
//! `(endpoints, request) -> endpoint` and tolerate empty/single-element
//! inputs.

mod consistent_hash;
mod random;
mod round_robin;

pub use consistent_hash::ConsistentHashBalancer;
pub use random::RandomBalancer;
pub use round_robin::RoundRobinBalancer;

use crate::model::{RpcRequest, ServiceEndpoint};

pub trait LoadBalancer: Send + Sync {
    fn name(&self) -> &'static str;
    fn select<'a>(
        &self,
        endpoints: &'a [ServiceEndpoint],
        request: &RpcRequest,
    ) -> Option<&'a ServiceEndpoint>;
}
