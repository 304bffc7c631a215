//! In-process [`Coordinator`] used by tests and by callers that embed their
//! own coordination rather than reaching out to etcd/ZooKeeper.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Coordinator;
use crate::Result;

struct Node {
    children: Vec<String>,
    watchers: Vec<mpsc::Sender<Vec<String>>>,
}

/// Plain `Mutex<HashMap>`-backed coordinator with no persistence and no
/// real ephemerality (nothing ever disconnects). Good enough to exercise
/// [`super::RegistryClient`] without an external service.
#[derive(Default)]
pub struct InMemoryCoordinator {
    nodes: Mutex<HashMap<String, Node>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify_watchers(node: &mut Node) {
        node.watchers
            .retain(|sender| sender.try_send(node.children.clone()).is_ok());
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn create_ephemeral_sequential(&self, path: &str, payload: &str) -> Result<()> {
        let mut guard = self.nodes.lock().unwrap();
        let node = guard.entry(path.to_string()).or_insert_with(|| Node {
            children: Vec::new(),
            watchers: Vec::new(),
        });
        node.children.push(payload.to_string());
        Self::notify_watchers(node);
        Ok(())
    }

    async fn remove_child(&self, path: &str, payload: &str) -> Result<()> {
        let mut guard = self.nodes.lock().unwrap();
        if let Some(node) = guard.get_mut(path) {
            node.children.retain(|child| child != payload);
            Self::notify_watchers(node);
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let guard = self.nodes.lock().unwrap();
        Ok(guard.get(path).map(|n| n.children.clone()).unwrap_or_default())
    }

    fn watch_children(&self, path: &str, sender: mpsc::Sender<Vec<String>>) {
        let mut guard = self.nodes.lock().unwrap();
        let node = guard.entry(path.to_string()).or_insert_with(|| Node {
            children: Vec::new(),
            watchers: Vec::new(),
        });
        node.watchers.push(sender);
    }
}
