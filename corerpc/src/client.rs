//! Client request multiplexer: request-ID allocation, pending-request
//! correlation, timeout reclamation (spec.md §4.8).
//!
//! A `Client` is cheap to clone and share across callers. A persistent
//! per-connection reader task is spawned the moment the pool creates a
//! connection (via its `on_create` hook), and owns response routing; writes
//! stay gated by the pool's Available/InUse bookkeeping and are released
//! the instant the frame is on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::breaker::CircuitBreakerManager;
use crate::codec::{self, CodecRegistry};
use crate::compression::{self, CompressorRegistry};
use crate::metrics::MetricsManager;
use crate::model::{RpcRequest, RpcResponse, ServiceEndpoint};
use crate::pool::{ConnectionPool, Connector, OnConnectionCreated, PoolConfig, TcpConnector};
use crate::protocol;
use crate::retry::RetryPolicy;
use crate::trace::TraceManager;
use crate::{Result, RpcError};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub request_timeout_check_interval: Duration,
    /// The client-side admission semaphore is sized `2 ×` this (spec.md §5).
    pub max_pending_requests: usize,
    pub codec_tag: u8,
    pub compression_tag: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            request_timeout_check_interval: Duration::from_secs(10),
            max_pending_requests: 1000,
            codec_tag: codec::JSON_TAG,
            compression_tag: compression::NONE_TAG,
        }
    }
}

/// Optional process-wide collaborators the call path consults (spec.md §2
/// data flow: tracing start → breaker admission → retry loop → ... →
/// metrics/tracing end).
pub struct ClientDeps {
    pub breaker: Option<Arc<CircuitBreakerManager>>,
    pub trace: Option<Arc<TraceManager>>,
    pub metrics: Option<Arc<MetricsManager>>,
    pub retry: RetryPolicy,
}

impl Default for ClientDeps {
    fn default() -> Self {
        Self {
            breaker: None,
            trace: None,
            metrics: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Request-ID → completion handle, plus when it was enqueued for the
/// sweeper (spec.md §3 "pending request").
struct PendingEntry {
    tx: oneshot::Sender<Result<RpcResponse>>,
    enqueued_at: Instant,
}

/// A connected RPC client (spec.md §4.8).
pub struct Client<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> {
    pool: Arc<ConnectionPool<C>>,
    pending: Arc<DashMap<u64, PendingEntry>>,
    codecs: Arc<CodecRegistry>,
    compressors: Arc<CompressorRegistry>,
    config: ClientConfig,
    semaphore: Arc<Semaphore>,
    next_request_id: AtomicU64,
    service_name: String,
    breaker: Option<Arc<CircuitBreakerManager>>,
    trace: Option<Arc<TraceManager>>,
    metrics: Option<Arc<MetricsManager>>,
    retry: RetryPolicy,
    sweeper: JoinHandle<()>,
}

impl Client<TcpStream> {
    pub async fn connect(endpoint: ServiceEndpoint, service_name: impl Into<String>) -> Result<Arc<Self>> {
        Self::connect_with(
            endpoint,
            service_name,
            ClientConfig::default(),
            PoolConfig::default(),
            ClientDeps::default(),
        )
        .await
    }

    pub async fn connect_with(
        endpoint: ServiceEndpoint,
        service_name: impl Into<String>,
        config: ClientConfig,
        pool_config: PoolConfig,
        deps: ClientDeps,
    ) -> Result<Arc<Self>> {
        let connector: Arc<dyn Connector<Conn = TcpStream>> = Arc::new(TcpConnector {
            connect_timeout: pool_config.connect_timeout,
        });
        Self::with_connector(endpoint, service_name, config, pool_config, deps, connector).await
    }
}

impl<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> Client<C> {
    /// Generic over [`Connector`] so tests can substitute an in-memory
    /// transport for real TCP.
    pub async fn with_connector(
        endpoint: ServiceEndpoint,
        service_name: impl Into<String>,
        config: ClientConfig,
        pool_config: PoolConfig,
        deps: ClientDeps,
        connector: Arc<dyn Connector<Conn = C>>,
    ) -> Result<Arc<Self>> {
        let codecs = Arc::new(CodecRegistry::with_defaults());
        let compressors = Arc::new(CompressorRegistry::with_defaults());
        let pending: Arc<DashMap<u64, PendingEntry>> = Arc::new(DashMap::new());

        let on_create = build_reader_spawn(pending.clone(), codecs.clone(), compressors.clone());
        let pool = ConnectionPool::new(endpoint, pool_config, connector, on_create);
        pool.warmup().await?;

        let semaphore = Arc::new(Semaphore::new(config.max_pending_requests.saturating_mul(2)));
        let sweeper = spawn_sweeper(
            pending.clone(),
            config.request_timeout,
            config.request_timeout_check_interval,
        );

        Ok(Arc::new(Self {
            pool,
            pending,
            codecs,
            compressors,
            config,
            semaphore,
            next_request_id: AtomicU64::new(1),
            service_name: service_name.into(),
            breaker: deps.breaker,
            trace: deps.trace,
            metrics: deps.metrics,
            retry: deps.retry,
            sweeper,
        }))
    }

    /// Full call path (spec.md §2): breaker admission, a retry loop around
    /// individual send attempts, metrics and tracing on completion.
    pub async fn call(self: &Arc<Self>, request: RpcRequest) -> Result<RpcResponse> {
        if let Some(breaker) = &self.breaker {
            breaker.admit(&self.service_name)?;
        }
        if let Some(trace) = &self.trace {
            trace.start_child_trace(&request.interface, &request.method);
        }
        let started_at = Instant::now();

        let mut attempt = 0u32;
        let result = loop {
            let outcome = self.send_once(&request).await;
            match outcome {
                Ok(response) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success(&self.service_name);
                    }
                    break Ok(response);
                }
                Err(err) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_failure(&self.service_name);
                    }
                    if self.retry.should_retry(attempt, &err) {
                        tokio::time::sleep(self.retry.retry_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    break Err(err);
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record(
                &self.service_name,
                &request.method,
                started_at.elapsed().as_millis() as u64,
                result.is_ok(),
            );
        }
        if let Some(trace) = &self.trace {
            match &result {
                Ok(_) => {
                    trace.finish_trace();
                }
                Err(e) => {
                    trace.finish_trace_with_error(&e.to_string());
                }
            }
        }
        result
    }

    /// One attempt: register a pending handle, acquire a connection, write
    /// the frame, release the connection immediately, await the matching
    /// response (spec.md §4.8).
    async fn send_once(&self, request: &RpcRequest) -> Result<RpcResponse> {
        let _permit = self.semaphore.acquire().await.map_err(|_| RpcError::PoolClosed)?;

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingEntry {
                tx,
                enqueued_at: Instant::now(),
            },
        );

        let mut guard = match self.pool.acquire().await {
            Ok(g) => g,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e);
            }
        };

        let bytes = match protocol::encode_request(
            &self.codecs,
            &self.compressors,
            self.config.codec_tag,
            self.config.compression_tag,
            id,
            request,
        )
        .await
        {
            Ok(b) => b,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e);
            }
        };

        if let Err(e) = guard.connection().write_all(&bytes).await {
            guard.poison();
            self.pending.remove(&id);
            return Err(e);
        }
        drop(guard);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::RequestTimeout),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl<C: AsyncRead + AsyncWrite + Send + Unpin + 'static> Drop for Client<C> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Builds the pool's `on_create` hook: spawns one persistent reader task per
/// physical connection, routing inbound frames to the pending map by
/// request ID (spec.md §4.8).
fn build_reader_spawn<C: AsyncRead + AsyncWrite + Send + Unpin + 'static>(
    pending: Arc<DashMap<u64, PendingEntry>>,
    codecs: Arc<CodecRegistry>,
    compressors: Arc<CompressorRegistry>,
) -> OnConnectionCreated<C> {
    Arc::new(move |_id, read_half: ReadHalf<C>| {
        let pending = pending.clone();
        let codecs = codecs.clone();
        let compressors = compressors.clone();
        tokio::spawn(async move {
            run_reader(read_half, pending, codecs, compressors).await;
        });
    })
}

async fn run_reader<C: AsyncRead + AsyncWrite + Send + Unpin + 'static>(
    mut reader: ReadHalf<C>,
    pending: Arc<DashMap<u64, PendingEntry>>,
    codecs: Arc<CodecRegistry>,
    compressors: Arc<CompressorRegistry>,
) {
    loop {
        let frame = match protocol::read_frame(&mut reader, &compressors).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if frame.message_type != protocol::MessageType::Response {
            warn!("client reader received a non-response frame, discarding");
            continue;
        }
        let response = match frame.decode_response(&codecs) {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to decode response for request {}: {e}", frame.request_id);
                continue;
            }
        };
        match pending.remove(&frame.request_id) {
            Some((_, entry)) => {
                let _ = entry.tx.send(Ok(response));
            }
            None => debug!("response for unknown or already-completed request id {}", frame.request_id),
        }
    }
}

/// Expires pending entries older than `request_timeout`, completing each
/// with `RequestTimeout` (spec.md §4.8 "on sweep").
fn spawn_sweeper(
    pending: Arc<DashMap<u64, PendingEntry>>,
    request_timeout: Duration,
    check_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let expired: Vec<u64> = pending
                .iter()
                .filter(|entry| now.saturating_duration_since(entry.enqueued_at) > request_timeout)
                .map(|entry| *entry.key())
                .collect();
            for id in expired {
                if let Some((_, entry)) = pending.remove(&id) {
                    let _ = entry.tx.send(Err(RpcError::RequestTimeout));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::io::DuplexStream;

    fn sample_request() -> RpcRequest {
        RpcRequest {
            interface: "com.example.Greeter".into(),
            method: "sayHello".into(),
            group: "default".into(),
            version: "1.0".into(),
            param_types: vec![],
            params: vec![serde_json::json!("world")],
            auth_token: None,
            client_address: None,
            timestamp_ms: 0,
            attributes: HashMap::new(),
        }
    }

    /// Reads requests off the server half of a loopback duplex and echoes a
    /// successful response, exercising the full frame round trip.
    struct EchoConnector;

    #[async_trait]
    impl Connector for EchoConnector {
        type Conn = DuplexStream;

        async fn connect(&self, _endpoint: &ServiceEndpoint) -> Result<DuplexStream> {
            let (client, mut server) = tokio::io::duplex(8192);
            tokio::spawn(async move {
                let codecs = CodecRegistry::with_defaults();
                let compressors = CompressorRegistry::with_defaults();
                loop {
                    let frame = match protocol::read_frame(&mut server, &compressors).await {
                        Ok(f) => f,
                        Err(_) => return,
                    };
                    let request = match frame.decode_request(&codecs) {
                        Ok(r) => r,
                        Err(_) => return,
                    };
                    let response = RpcResponse::ok(serde_json::json!({ "echo": request.method }));
                    let bytes = match protocol::encode_response(
                        &codecs,
                        &compressors,
                        frame.codec_tag,
                        frame.compression_tag,
                        frame.request_id,
                        &response,
                    )
                    .await
                    {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    if protocol::write_frame(&mut server, &bytes).await.is_err() {
                        return;
                    }
                }
            });
            Ok(client)
        }
    }

    struct SilentConnector;

    #[async_trait]
    impl Connector for SilentConnector {
        type Conn = DuplexStream;

        async fn connect(&self, _endpoint: &ServiceEndpoint) -> Result<DuplexStream> {
            let (client, _server) = tokio::io::duplex(4096);
            Ok(client)
        }
    }

    fn disabled_pool_config() -> PoolConfig {
        PoolConfig {
            enabled: false,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn call_round_trips_through_echo_server() {
        let client = Client::with_connector(
            ServiceEndpoint::new("127.0.0.1", 9100),
            "echo-service",
            ClientConfig::default(),
            disabled_pool_config(),
            ClientDeps::default(),
            Arc::new(EchoConnector),
        )
        .await
        .unwrap();

        let response = client.call(sample_request()).await.unwrap();
        assert!(response.is_success());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_are_correlated_independently() {
        let client = Client::with_connector(
            ServiceEndpoint::new("127.0.0.1", 9101),
            "echo-service",
            ClientConfig::default(),
            PoolConfig {
                max_per_endpoint: 4,
                enabled: false,
                ..PoolConfig::default()
            },
            ClientDeps::default(),
            Arc::new(EchoConnector),
        )
        .await
        .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.call(sample_request()).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_success());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reclaims_pending_entry_when_peer_never_replies() {
        let config = ClientConfig {
            request_timeout: Duration::from_millis(50),
            request_timeout_check_interval: Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let client = Client::with_connector(
            ServiceEndpoint::new("127.0.0.1", 9102),
            "silent-service",
            config,
            disabled_pool_config(),
            ClientDeps::default(),
            Arc::new(SilentConnector),
        )
        .await
        .unwrap();

        let call_client = client.clone();
        let handle = tokio::spawn(async move { call_client.call(sample_request()).await });
        tokio::time::advance(Duration::from_millis(200)).await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::RequestTimeout));
        assert_eq!(client.pending_count(), 0);
    }
}
