//! Per-endpoint connection pool: create, reuse, health-check, idle-evict,
//! warmup, pending-queue, backpressure (spec.md §4.7).
//!
//! Each physical connection is split into independent read/write halves
//! (`tokio::io::split`) on creation: the pool gates the *write* half behind
//! Available/InUse bookkeeping (spec.md §4.8 "release connection after the
//! write completes"), while the read half is handed to `on_create` once, up
//! front, so the client multiplexer (§4.8) can run a persistent reader that
//! keeps working regardless of the write half's pool state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::model::ServiceEndpoint;
use crate::{Result, RpcError};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_per_endpoint: usize,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_pending: usize,
    pub connect_timeout: Duration,
    pub warmup_count: usize,
    pub enabled: bool,
    pub health_check_enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_endpoint: 10,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            max_pending: 1000,
            connect_timeout: Duration::from_secs(5),
            warmup_count: 2,
            enabled: true,
            health_check_enabled: true,
        }
    }
}

/// Connects to an endpoint, producing a full-duplex transport stream
/// (spec.md §4.7). A trait so tests can substitute an in-memory transport
/// for a real `TcpStream`.
#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self, endpoint: &ServiceEndpoint) -> Result<Self::Conn>;
}

/// Real TCP connector used in production (spec.md §6 wire protocol).
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

#[async_trait]
impl Connector for TcpConnector {
    type Conn = TcpStream;

    async fn connect(&self, endpoint: &ServiceEndpoint) -> Result<TcpStream> {
        tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint.address()))
            .await
            .map_err(|_| RpcError::ConnectTimeout)?
            .map_err(|e| RpcError::TransportError(e.to_string()))
    }
}

const AVAILABLE: u8 = 0;
const IN_USE: u8 = 1;
const CLOSED: u8 = 2;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A pooled connection's *write* half: unique ID, writer handle,
/// creation/last-used timestamps, usage counter, and state (spec.md §3
/// "Pooled connection").
pub struct PooledConnection<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> {
    pub id: u64,
    writer: Mutex<Option<WriteHalf<C>>>,
    created_at: Instant,
    last_used_ms: AtomicU64,
    usage_count: AtomicU64,
    state: AtomicU8,
}

impl<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> PooledConnection<C> {
    fn new(id: u64, writer: WriteHalf<C>) -> Arc<Self> {
        Arc::new(Self {
            id,
            writer: Mutex::new(Some(writer)),
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(now_ms()),
            usage_count: AtomicU64::new(0),
            state: AtomicU8::new(AVAILABLE),
        })
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Relaxed)
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_used_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms().saturating_sub(last))
    }

    fn touch(&self) {
        self.last_used_ms.store(now_ms(), Ordering::Relaxed);
        self.usage_count.fetch_add(1, Ordering::Relaxed);
    }

    fn is_healthy(&self) -> bool {
        self.state.load(Ordering::Acquire) != CLOSED && self.writer.lock().unwrap().is_some()
    }

    /// Available → InUse, atomic CAS on acquire (spec.md §3 invariant).
    fn try_acquire(self: &Arc<Self>) -> bool {
        self.state
            .compare_exchange(AVAILABLE, IN_USE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_available(&self) {
        self.touch();
        self.state.store(AVAILABLE, Ordering::Release);
    }

    /// Any → Closed, one-way terminal (spec.md §3 invariant).
    fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.writer.lock().unwrap().take();
    }

    /// Writes `bytes` out the held write half, releasing the pool lock
    /// around the actual I/O (spec.md §4.1 "write frame").
    pub async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        // Taken out for the duration of the write so the lock is never
        // held across the whole `.await`; `InUse` already guarantees
        // exclusivity, this just keeps the std Mutex uncontended.
        let mut writer = {
            let mut guard = self.writer.lock().unwrap();
            guard.take()
        };
        let result = match writer.as_mut() {
            Some(w) => w.write_all(bytes).await.and_then(|_| {
                // no-op; write_all returns () on success
                Ok(())
            }),
            None => return Err(RpcError::TransportError("connection closed".to_string())),
        };
        let mut guard = self.writer.lock().unwrap();
        *guard = writer;
        result.map_err(|e| RpcError::TransportError(e.to_string()))
    }
}

/// RAII handle returned by [`ConnectionPool::acquire`]. Dropping it without
/// calling [`PoolGuard::poison`] releases the connection back to
/// `Available`; `poison` closes it instead (spec.md §4.7 "returning an
/// unhealthy connection must close it").
pub struct PoolGuard<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> {
    pool: Option<Arc<ConnectionPool<C>>>,
    conn: Option<Arc<PooledConnection<C>>>,
    poisoned: bool,
}

impl<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> PoolGuard<C> {
    pub fn connection(&self) -> &Arc<PooledConnection<C>> {
        self.conn.as_ref().expect("guard used after release")
    }

    /// Marks the connection unhealthy; it is closed rather than returned to
    /// the pool on drop (spec.md §3 "returning an unhealthy connection must
    /// close it").
    pub fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> Drop for PoolGuard<C> {
    fn drop(&mut self) {
        if let (Some(pool), Some(conn)) = (self.pool.take(), self.conn.take()) {
            pool.release(conn, !self.poisoned);
        }
    }
}

struct Shared<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> {
    endpoint: ServiceEndpoint,
    config: PoolConfig,
    all: Mutex<Vec<Arc<PooledConnection<C>>>>,
    available: Mutex<VecDeque<Arc<PooledConnection<C>>>>,
    waiters: Mutex<VecDeque<oneshot::Sender<Result<Arc<PooledConnection<C>>>>>>,
    next_id: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

/// Callback invoked once per physical connection, immediately after
/// creation, with that connection's read half — the client multiplexer uses
/// this to spawn its persistent per-connection reader (spec.md §4.8).
pub type OnConnectionCreated<C> = Arc<dyn Fn(u64, ReadHalf<C>) + Send + Sync>;

/// Per-endpoint pool (spec.md §4.7). Generic over [`Connector`] so tests can
/// swap in an in-memory transport.
pub struct ConnectionPool<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> {
    shared: Arc<Shared<C>>,
    connector: Arc<dyn Connector<Conn = C>>,
    on_create: OnConnectionCreated<C>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> ConnectionPool<C> {
    pub fn new(
        endpoint: ServiceEndpoint,
        config: PoolConfig,
        connector: Arc<dyn Connector<Conn = C>>,
        on_create: OnConnectionCreated<C>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            shared: Arc::new(Shared {
                endpoint,
                config,
                all: Mutex::new(Vec::new()),
                available: Mutex::new(VecDeque::new()),
                waiters: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
            connector,
            on_create,
            tasks: Mutex::new(Vec::new()),
        });
        if pool.shared.config.enabled {
            pool.spawn_background_tasks();
        }
        pool
    }

    /// Eagerly opens `warmup_count` connections (spec.md §4.7).
    pub async fn warmup(self: &Arc<Self>) -> Result<()> {
        for _ in 0..self.shared.config.warmup_count {
            let conn = self.create_connection().await?;
            conn.mark_available();
            self.shared.available.lock().unwrap().push_back(conn);
        }
        Ok(())
    }

    async fn create_connection(&self) -> Result<Arc<PooledConnection<C>>> {
        let raw = self.connector.connect(&self.shared.endpoint).await?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = split(raw);
        (self.on_create)(id, read_half);
        let conn = PooledConnection::new(id, write_half);
        self.shared.all.lock().unwrap().push(conn.clone());
        Ok(conn)
    }

    fn total(&self) -> usize {
        self.shared.all.lock().unwrap().len()
    }

    fn remove_from_all(&self, id: u64) {
        self.shared.all.lock().unwrap().retain(|c| c.id != id);
    }

    /// Acquire algorithm (spec.md §4.7): pop Available and CAS to InUse;
    /// else create if under the per-endpoint max; else enqueue a waiter
    /// bounded by `max_pending`; else fail with `PoolSaturated`.
    pub async fn acquire(self: &Arc<Self>) -> Result<PoolGuard<C>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RpcError::PoolClosed);
        }
        loop {
            let popped = self.shared.available.lock().unwrap().pop_front();
            if let Some(conn) = popped {
                if conn.is_healthy() {
                    if conn.try_acquire() {
                        return Ok(PoolGuard {
                            pool: Some(self.clone()),
                            conn: Some(conn),
                            poisoned: false,
                        });
                    }
                    continue;
                }
                conn.close();
                self.remove_from_all(conn.id);
                continue;
            }

            if self.total() < self.shared.config.max_per_endpoint {
                let conn = self.create_connection().await?;
                if !conn.try_acquire() {
                    continue;
                }
                return Ok(PoolGuard {
                    pool: Some(self.clone()),
                    conn: Some(conn),
                    poisoned: false,
                });
            }

            let mut waiters = self.shared.waiters.lock().unwrap();
            if waiters.len() >= self.shared.config.max_pending {
                return Err(RpcError::PoolSaturated);
            }
            let (tx, rx) = oneshot::channel();
            waiters.push_back(tx);
            drop(waiters);
            let conn = rx.await.map_err(|_| RpcError::PoolClosed)??;
            return Ok(PoolGuard {
                pool: Some(self.clone()),
                conn: Some(conn),
                poisoned: false,
            });
        }
    }

    /// Returns a connection: satisfies the oldest waiter first (FIFO),
    /// otherwise goes back to `Available`; unhealthy connections are closed
    /// instead (spec.md §4.7).
    fn release(&self, conn: Arc<PooledConnection<C>>, healthy: bool) {
        if !healthy || self.shared.closed.load(Ordering::Acquire) {
            conn.close();
            self.remove_from_all(conn.id);
            return;
        }

        let mut waiters = self.shared.waiters.lock().unwrap();
        while let Some(waiter) = waiters.pop_front() {
            match waiter.send(Ok(conn.clone())) {
                Ok(()) => return,
                Err(_) => continue,
            }
        }
        drop(waiters);
        conn.mark_available();
        self.shared.available.lock().unwrap().push_back(conn);
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let health = self.clone();
        let health_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health.shared.config.health_check_interval);
            loop {
                ticker.tick().await;
                if health.shared.closed.load(Ordering::Acquire) {
                    return;
                }
                health.run_health_check().await;
            }
        });

        let idle = self.clone();
        let idle_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle.shared.config.health_check_interval);
            loop {
                ticker.tick().await;
                if idle.shared.closed.load(Ordering::Acquire) {
                    return;
                }
                idle.run_idle_eviction();
            }
        });

        self.tasks.lock().unwrap().push(health_handle);
        self.tasks.lock().unwrap().push(idle_handle);
    }

    /// Removes unhealthy connections, then opportunistically creates up to
    /// `min(2, max)` to maintain a floor (spec.md §4.7).
    async fn run_health_check(self: &Arc<Self>) {
        if !self.shared.config.health_check_enabled {
            return;
        }
        let unhealthy: Vec<u64> = self
            .shared
            .all
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_healthy())
            .map(|c| c.id)
            .collect();
        for id in unhealthy {
            self.remove_from_all(id);
            self.shared.available.lock().unwrap().retain(|c| c.id != id);
            debug!("pool[{}] evicted unhealthy connection {id}", self.shared.endpoint);
        }

        let floor = self.shared.config.max_per_endpoint.min(2);
        while self.total() < floor {
            match self.create_connection().await {
                Ok(conn) => {
                    conn.mark_available();
                    self.shared.available.lock().unwrap().push_back(conn);
                }
                Err(e) => {
                    warn!("pool[{}] failed to maintain floor: {e}", self.shared.endpoint);
                    break;
                }
            }
        }
    }

    /// Removes `Available` connections idle past the configured threshold
    /// (spec.md §4.7).
    fn run_idle_eviction(&self) {
        let mut available = self.shared.available.lock().unwrap();
        let mut keep = VecDeque::with_capacity(available.len());
        while let Some(conn) = available.pop_front() {
            if conn.idle_for() > self.shared.config.idle_timeout {
                conn.close();
                self.remove_from_all(conn.id);
            } else {
                keep.push_back(conn);
            }
        }
        *available = keep;
    }

    /// Cancels all pending waiters with `PoolClosed`, closes all
    /// connections, stops background tasks. Idempotent (spec.md §4.7).
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for waiter in self.shared.waiters.lock().unwrap().drain(..) {
            let _ = waiter.send(Err(RpcError::PoolClosed));
        }
        for conn in self.shared.all.lock().unwrap().drain(..) {
            conn.close();
        }
        self.shared.available.lock().unwrap().clear();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    pub fn current_total(&self) -> usize {
        self.total()
    }
}

impl<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use tokio::io::DuplexStream;

    /// In-memory connector pairing each pool connection with a loopback
    /// echo task, so acquire/release/health-check logic can be exercised
    /// without real sockets.
    pub struct LoopbackConnector;

    #[async_trait]
    impl Connector for LoopbackConnector {
        type Conn = DuplexStream;

        async fn connect(&self, _endpoint: &ServiceEndpoint) -> Result<DuplexStream> {
            let (client, mut server) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut tokio::io::empty(), &mut server).await;
            });
            Ok(client)
        }
    }

    pub fn noop_on_create() -> OnConnectionCreated<DuplexStream> {
        Arc::new(|_id, _reader| {})
    }
}
