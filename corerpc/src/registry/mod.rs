//! Registry client: ephemeral endpoint registration, discovery, and
//! watch-driven cache invalidation (spec.md §4.5).

mod coordinator;
mod memory;

pub use coordinator::Coordinator;
pub use memory::InMemoryCoordinator;

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::warn;
use tokio::sync::mpsc;

use crate::balancer::LoadBalancer;
use crate::model::{RpcRequest, ServiceEndpoint};
use crate::{Result, RpcError};

const SERVICE_PATH_PREFIX: &str = "/rpc-services";
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_CONNECT_ATTEMPTS: u32 = 3;

fn service_path(service_name: &str) -> String {
    format!("{SERVICE_PATH_PREFIX}/{service_name}")
}

/// Registers and discovers endpoints against a [`Coordinator`], caching the
/// discovered list and keeping it fresh via watch callbacks (spec.md §4.5).
pub struct RegistryClient {
    coordinator: Arc<dyn Coordinator>,
    balancer: Arc<dyn LoadBalancer>,
    caches: RwLock<std::collections::HashMap<String, Arc<Vec<ServiceEndpoint>>>>,
    watched: RwLock<HashSet<String>>,
}

impl RegistryClient {
    pub fn new(coordinator: Arc<dyn Coordinator>, balancer: Arc<dyn LoadBalancer>) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            balancer,
            caches: RwLock::new(std::collections::HashMap::new()),
            watched: RwLock::new(HashSet::new()),
        })
    }

    /// Registers an ephemeral-sequential child under the service's
    /// persistent parent, retrying connection loss with exponential backoff
    /// (initial 1s, up to 3 attempts) (spec.md §4.5).
    pub async fn register(&self, service_name: &str, endpoint: &ServiceEndpoint) -> Result<()> {
        let path = service_path(service_name);
        let payload = endpoint.address();
        let mut attempt = 0;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            attempt += 1;
            match self.coordinator.create_ephemeral_sequential(&path, &payload).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < MAX_CONNECT_ATTEMPTS => {
                    warn!("registry registration attempt {attempt} failed: {err}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn unregister(&self, service_name: &str, endpoint: &ServiceEndpoint) -> Result<()> {
        let path = service_path(service_name);
        self.coordinator.remove_child(&path, &endpoint.address()).await
    }

    /// Reads children once, installs a watch that keeps the cache fresh, and
    /// returns the initial endpoint list. Discovery before any registrant
    /// exists yields an empty list, not an error (spec.md §4.5).
    pub async fn lookup(self: &Arc<Self>, service_name: &str) -> Result<Arc<Vec<ServiceEndpoint>>> {
        if let Some(cached) = self.caches.read().unwrap().get(service_name).cloned() {
            return Ok(cached);
        }

        let path = service_path(service_name);
        let children = self.coordinator.children(&path).await?;
        let endpoints = Arc::new(parse_children(&children));
        self.caches
            .write()
            .unwrap()
            .insert(service_name.to_string(), endpoints.clone());

        let newly_watched = self.watched.write().unwrap().insert(service_name.to_string());
        if newly_watched {
            spawn_watch_loop(self.clone(), service_name.to_string());
        }
        Ok(endpoints)
    }

    /// Atomically replaces the cached endpoint list for `service_name` in
    /// response to a watch callback (spec.md §4.5: "replace the cached list
    /// atomically... read-safe under concurrent lookups").
    pub fn replace_cache(&self, service_name: &str, children: &[String]) {
        let endpoints = Arc::new(parse_children(children));
        self.caches
            .write()
            .unwrap()
            .insert(service_name.to_string(), endpoints);
    }

    /// Consults the configured load balancer over the cached list for
    /// `request`'s service. Returns `NoEndpoints` if discovery has not yet
    /// populated a non-empty cache (spec.md §4.5).
    pub async fn select_endpoint(self: &Arc<Self>, request: &RpcRequest) -> Result<ServiceEndpoint> {
        let service_name = request.service_key().to_string();
        let endpoints = self.lookup(&service_name).await?;
        self.balancer
            .select(&endpoints, request)
            .cloned()
            .ok_or_else(|| RpcError::NoEndpoints(service_name))
    }
}

/// Spawns a task draining `watch_children` notifications for `service_name`
/// into `client`'s cache. Requires the client wrapped in an `Arc` so the
/// task can outlive the caller (spec.md §4.5 watch-driven invalidation).
pub fn spawn_watch_loop(client: Arc<RegistryClient>, service_name: String) {
    let path = service_path(&service_name);
    let (tx, mut rx) = mpsc::channel::<Vec<String>>(16);
    client.coordinator.watch_children(&path, tx);
    tokio::spawn(async move {
        while let Some(children) = rx.recv().await {
            client.replace_cache(&service_name, &children);
        }
    });
}

fn parse_children(children: &[String]) -> Vec<ServiceEndpoint> {
    children
        .iter()
        .filter_map(|payload| payload.parse().ok())
        .collect()
}
