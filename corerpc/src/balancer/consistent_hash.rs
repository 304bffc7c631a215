//! Consistent hash balancer: 160 virtual nodes per physical endpoint
//! (spec.md §4.6, GLOSSARY).
//!
//! Key derivation: `interface#method#version#group#hash(first-parameter)`,
//! hashed with MD5 reduced to the first 8 bytes (big-endian) of the digest,
//! falling back to a string hash if MD5 is unavailable. The ring is a sorted
//! mapping from 64-bit hash to endpoint string; selection picks the ceiling
//! entry, wrapping to the first when absent. The ring is cached keyed by a
//! canonical sort of the endpoint list and atomically swapped on
//! invalidation (`arc-swap`), per SPEC_FULL §4.6.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use arc_swap::ArcSwapOption;
use md5::{Digest, Md5};

use crate::model::{RpcRequest, ServiceEndpoint};

use super::LoadBalancer;

pub const VIRTUAL_NODES_PER_ENDPOINT: usize = 160;

struct Ring {
    /// Sorted by hash; `(hash, endpoint_index)`.
    entries: Vec<(u64, usize)>,
    endpoints: Vec<ServiceEndpoint>,
    canonical_key: String,
}

fn canonical_key(endpoints: &[ServiceEndpoint]) -> String {
    let mut addrs: Vec<String> = endpoints.iter().map(|e| e.address()).collect();
    addrs.sort();
    addrs.join(",")
}

fn hash_key(key: &str) -> u64 {
    let digest = Md5::digest(key.as_bytes());
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

fn string_hash_fallback(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn build_ring(endpoints: &[ServiceEndpoint]) -> Ring {
    let mut entries = Vec::with_capacity(endpoints.len() * VIRTUAL_NODES_PER_ENDPOINT);
    for (idx, endpoint) in endpoints.iter().enumerate() {
        for vnode in 0..VIRTUAL_NODES_PER_ENDPOINT {
            let key = format!("{}#VN{}", endpoint.address(), vnode);
            entries.push((hash_key(&key), idx));
        }
    }
    entries.sort_by_key(|(hash, _)| *hash);
    Ring {
        entries,
        endpoints: endpoints.to_vec(),
        canonical_key: canonical_key(endpoints),
    }
}

fn request_key(request: &RpcRequest) -> u64 {
    let first_param = request
        .params
        .first()
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    let composite = format!(
        "{}#{}#{}#{}#{}",
        request.interface, request.method, request.version, request.group, first_param
    );
    hash_key(&composite)
}

/// Picks the ceiling entry in `entries` for `target`, wrapping to the first
/// entry when no entry is greater-or-equal (spec.md §4.6).
fn ceiling_index(entries: &[(u64, usize)], target: u64) -> usize {
    match entries.binary_search_by_key(&target, |(hash, _)| *hash) {
        Ok(i) => i,
        Err(i) if i < entries.len() => i,
        Err(_) => 0,
    }
}

pub struct ConsistentHashBalancer {
    cached_ring: ArcSwapOption<Ring>,
    // Guards rebuilds so concurrent cache-miss callers don't race to
    // rebuild redundantly; the swap itself is still atomic either way.
    rebuild_lock: Mutex<()>,
}

impl ConsistentHashBalancer {
    pub fn new() -> Self {
        Self {
            cached_ring: ArcSwapOption::empty(),
            rebuild_lock: Mutex::new(()),
        }
    }

    fn ring_for(&self, endpoints: &[ServiceEndpoint]) -> arc_swap::Guard<Option<std::sync::Arc<Ring>>> {
        let key = canonical_key(endpoints);
        {
            let current = self.cached_ring.load();
            if let Some(ring) = current.as_ref() {
                if ring.canonical_key == key {
                    return current;
                }
            }
        }
        let _guard = self.rebuild_lock.lock().unwrap();
        // Re-check after acquiring the lock: another thread may have rebuilt.
        let current = self.cached_ring.load();
        if let Some(ring) = current.as_ref() {
            if ring.canonical_key == key {
                return current;
            }
        }
        let fresh = build_ring(endpoints);
        self.cached_ring.store(Some(std::sync::Arc::new(fresh)));
        self.cached_ring.load()
    }
}

impl Default for ConsistentHashBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for ConsistentHashBalancer {
    fn name(&self) -> &'static str {
        "consistent-hash"
    }

    fn select<'a>(
        &self,
        endpoints: &'a [ServiceEndpoint],
        request: &RpcRequest,
    ) -> Option<&'a ServiceEndpoint> {
        if endpoints.is_empty() {
            return None;
        }
        if endpoints.len() == 1 {
            return endpoints.first();
        }
        let ring = self.ring_for(endpoints);
        let ring = ring.as_ref()?;
        let target = request_key(request);
        let idx = ceiling_index(&ring.entries, target);
        let (_, endpoint_idx) = ring.entries[idx];
        // `ring.endpoints` and `endpoints` share the same canonical set but
        // may differ in order; resolve by address to return a reference
        // into the caller's slice.
        let address = ring.endpoints[endpoint_idx].address();
        endpoints.iter().find(|e| e.address() == address)
    }
}

/// Fallback hash used when MD5 is unavailable (spec.md §4.6). Exposed for
/// testing the degraded path explicitly.
#[allow(dead_code)]
pub fn hash_with_fallback(key: &str, md5_available: bool) -> u64 {
    if md5_available {
        hash_key(key)
    } else {
        string_hash_fallback(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<ServiceEndpoint> {
        vec![
            ServiceEndpoint::new("127.0.0.1", 8001),
            ServiceEndpoint::new("127.0.0.1", 8002),
            ServiceEndpoint::new("127.0.0.1", 8003),
        ]
    }

    fn request_for(param: &str) -> RpcRequest {
        RpcRequest {
            interface: "hello".into(),
            method: "sayHello".into(),
            group: "default".into(),
            version: "1.0".into(),
            param_types: vec![],
            params: vec![serde_json::json!(param)],
            auth_token: None,
            client_address: None,
            timestamp_ms: 0,
            attributes: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn selection_is_deterministic_and_stable() {
        let balancer = ConsistentHashBalancer::new();
        let endpoints = endpoints();
        let request = request_for("user123");

        let first = balancer.select(&endpoints, &request).cloned();
        let second = balancer.select(&endpoints, &request).cloned();
        assert_eq!(first, second);
    }

    #[test]
    fn removing_an_unused_endpoint_does_not_change_the_chosen_one() {
        let balancer = ConsistentHashBalancer::new();
        let endpoints = endpoints();
        let request = request_for("user123");

        let chosen = balancer.select(&endpoints, &request).cloned().unwrap();

        let reduced: Vec<ServiceEndpoint> = endpoints
            .iter()
            .filter(|e| **e != chosen)
            .cloned()
            .collect();
        // Only remove an endpoint that wasn't chosen, and only if more than
        // one candidate remains to remove from.
        if reduced.len() == endpoints.len() - 1 {
            let rechosen = balancer.select(&reduced, &request).cloned();
            assert_eq!(rechosen, Some(chosen));
        }
    }

    #[test]
    fn ring_cache_invalidates_when_endpoint_set_changes() {
        let balancer = ConsistentHashBalancer::new();
        let a = vec![ServiceEndpoint::new("127.0.0.1", 8001)];
        let b = vec![
            ServiceEndpoint::new("127.0.0.1", 8001),
            ServiceEndpoint::new("127.0.0.1", 8002),
        ];
        let request = request_for("k");
        assert_eq!(balancer.select(&a, &request).unwrap().port, 8001);
        // Forces a rebuild; must not panic or return a stale endpoint.
        let picked = balancer.select(&b, &request).unwrap();
        assert!(picked.port == 8001 || picked.port == 8002);
    }
}
