//! Graceful shutdown: an ordered registry of shutdown hooks run with a
//! global timeout (spec.md §4.16).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, warn};

/// A single unit of cleanup run at shutdown (spec.md §4.16).
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    fn name(&self) -> &str;
    /// Smaller runs earlier.
    fn priority(&self) -> i32 {
        0
    }
    /// Per-hook timeout in milliseconds; `0` defers to the registry's
    /// global timeout.
    fn timeout_ms(&self) -> u64 {
        0
    }
    fn should_execute(&self) -> bool {
        true
    }
    async fn shutdown(&self);
}

struct Entry {
    hook: Arc<dyn ShutdownHook>,
}

/// Process-global registry of shutdown hooks (spec.md §4.16, §6). A single
/// process-level sentinel is registered once by the caller; this type
/// itself holds no hidden static state (Design Note in spec.md §9).
pub struct GracefulShutdownManager {
    hooks: Mutex<Vec<Entry>>,
    global_timeout: Duration,
    shutting_down: AtomicBool,
}

impl GracefulShutdownManager {
    pub fn new(global_timeout: Duration) -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            global_timeout,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn register(&self, hook: Arc<dyn ShutdownHook>) {
        let mut hooks = self.hooks.lock().unwrap();
        hooks.push(Entry { hook });
        hooks.sort_by_key(|e| e.hook.priority());
    }

    /// Runs every eligible hook in priority order, each on its own task, and
    /// waits up to the configured global timeout (spec.md §4.16).
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks: Vec<Arc<dyn ShutdownHook>> = self
            .hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.hook.should_execute())
            .map(|e| e.hook.clone())
            .collect();

        for hook in hooks {
            let per_hook_timeout = if hook.timeout_ms() > 0 {
                Duration::from_millis(hook.timeout_ms())
            } else {
                self.global_timeout
            };
            let name = hook.name().to_string();
            let task = tokio::spawn(async move { hook.shutdown().await });
            match tokio::time::timeout(per_hook_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => error!("shutdown hook {name} panicked: {join_err}"),
                Err(_) => warn!("shutdown hook {name} exceeded its timeout"),
            }
        }
    }

    /// Executes every eligible hook in the calling context without waiting
    /// for individual completions to be bounded by a timeout (spec.md
    /// §4.16 "forceShutdown").
    pub async fn force_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let hooks: Vec<Arc<dyn ShutdownHook>> = self
            .hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.hook.should_execute())
            .map(|e| e.hook.clone())
            .collect();
        for hook in hooks {
            hook.shutdown().await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

impl Default for GracefulShutdownManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct RecordingHook {
        name: &'static str,
        priority: i32,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ShutdownHook for RecordingHook {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn shutdown(&self) {
            self.order.lock().unwrap().push(self.name);
        }
    }

    #[tokio::test]
    async fn hooks_run_in_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let manager = GracefulShutdownManager::default();
        manager.register(Arc::new(RecordingHook {
            name: "second",
            priority: 10,
            order: order.clone(),
        }));
        manager.register(Arc::new(RecordingHook {
            name: "first",
            priority: 0,
            order: order.clone(),
        }));
        manager.shutdown().await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    struct SlowHook {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ShutdownHook for SlowHook {
        fn name(&self) -> &str {
            "slow"
        }
        fn timeout_ms(&self) -> u64 {
            10
        }
        async fn shutdown(&self) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hook_exceeding_its_timeout_does_not_block_shutdown() {
        let calls = Arc::new(AtomicU32::new(0));
        let manager = GracefulShutdownManager::new(Duration::from_secs(30));
        manager.register(Arc::new(SlowHook { calls: calls.clone() }));

        let shutdown = tokio::spawn(async move {
            manager.shutdown().await;
        });
        tokio::time::advance(Duration::from_millis(20)).await;
        shutdown.await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let manager = GracefulShutdownManager::default();
        manager.register(Arc::new(RecordingHook {
            name: "once",
            priority: 0,
            order: order.clone(),
        }));
        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(order.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hooks_that_decline_to_execute_are_skipped() {
        struct Declining;
        #[async_trait]
        impl ShutdownHook for Declining {
            fn name(&self) -> &str {
                "declining"
            }
            fn should_execute(&self) -> bool {
                false
            }
            async fn shutdown(&self) {
                panic!("should never run");
            }
        }
        let manager = GracefulShutdownManager::default();
        manager.register(Arc::new(Declining));
        manager.shutdown().await;
    }
}
