//! Abstraction over the external coordination service (etcd, ZooKeeper, or
//! similar), deliberately out of scope for this crate to implement
//! (spec.md §1). Only the operations the registry client needs are modeled.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// A coordination-service client capable of ephemeral-sequential node
/// creation, one-shot children reads, and child-watch subscriptions
/// (spec.md §4.5).
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Creates the persistent parent at `path` if absent, then an ephemeral
    /// sequential child under it carrying `payload`. The coordination
    /// service is responsible for deleting the child when this client
    /// disconnects.
    async fn create_ephemeral_sequential(&self, path: &str, payload: &str) -> Result<()>;

    /// Removes the child under `path` whose payload equals `payload`, if
    /// present.
    async fn remove_child(&self, path: &str, payload: &str) -> Result<()>;

    /// Reads the current children of `path` once.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Subscribes to child-set changes under `path`; each change sends the
    /// full, current children list on `sender`.
    fn watch_children(&self, path: &str, sender: mpsc::Sender<Vec<String>>);
}
