//! Server dispatcher: method handlers, the interceptor chain, and the
//! accept loop that ties frame decode → interceptors → dispatch → frame
//! encode together (spec.md §2 "On the server", §4.13).
//!
//! Per spec.md §9 Design Note ("reflection-based method dispatch ... source
//! uses runtime interface lookup"): each service is an explicit name→handler
//! map built at registration time; dispatch is a map lookup, never runtime
//! reflection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::codec::CodecRegistry;
use crate::compression::CompressorRegistry;
use crate::interceptor::InterceptorChain;
use crate::model::{status, RpcRequest, RpcResponse, ServiceKey};
use crate::protocol::{self, MessageType};
use crate::RpcError;

/// One RPC method: accepts a request, returns its result payload or an
/// error the dispatcher turns into a failure response (spec.md §9 Design
/// Note).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &RpcRequest) -> crate::Result<serde_json::Value>;
}

/// A blanket impl so a plain async closure can be registered directly,
/// without hand-writing a struct per method.
#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(RpcRequest) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = crate::Result<serde_json::Value>> + Send,
{
    async fn handle(&self, request: &RpcRequest) -> crate::Result<serde_json::Value> {
        (self)(request.clone()).await
    }
}

/// One service's method→handler map, built once at registration (spec.md
/// §9 Design Note).
#[derive(Default)]
pub struct Service {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    fn get(&self, method: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(method)
    }
}

/// Explicit `ServiceKey → Service` dispatch table (spec.md §3 "composite
/// service identity ... for registry and dispatch").
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceKey, Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: ServiceKey, service: Service) {
        self.services.insert(key, service);
    }

    fn dispatch(&self, request: &RpcRequest) -> Option<&Arc<dyn Handler>> {
        self.services
            .get(&request.service_key())
            .and_then(|service| service.get(&request.method))
    }
}

/// Ties the interceptor chain, codec/compressor registries, and the
/// explicit dispatch table together (spec.md §2 server-side data flow).
pub struct Server {
    registry: ServiceRegistry,
    interceptors: InterceptorChain,
    codecs: Arc<CodecRegistry>,
    compressors: Arc<CompressorRegistry>,
}

impl Server {
    pub fn new(registry: ServiceRegistry, interceptors: InterceptorChain) -> Arc<Self> {
        Arc::new(Self {
            registry,
            interceptors,
            codecs: Arc::new(CodecRegistry::with_defaults()),
            compressors: Arc::new(CompressorRegistry::with_defaults()),
        })
    }

    /// Accepts connections on `listener` forever, spawning one task per
    /// connection. Returns only on a listener-level I/O error.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> crate::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.map_err(|e| RpcError::TransportError(e.to_string()))?;
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, peer.to_string()).await;
            });
        }
    }

    /// Runs the interceptor chain, dispatches to the registered handler,
    /// and converts the outcome into a response (spec.md §2, §4.13).
    pub async fn dispatch(&self, mut request: RpcRequest) -> RpcResponse {
        let mut response = RpcResponse::ok(serde_json::Value::Null);

        if !self.interceptors.pre_process(&mut request, &mut response).await {
            return response;
        }

        let outcome = match self.registry.dispatch(&request) {
            Some(handler) => handler.handle(&request).await,
            None => Err(RpcError::ServiceNotFound(request.service_key().to_string())),
        };

        let mut response = match outcome {
            Ok(payload) => RpcResponse::ok(payload),
            Err(err) => {
                let mut failure = RpcResponse::failure(err.to_string());
                failure.status = err.status_code();
                self.interceptors.on_exception(&request, &mut failure, &err).await;
                failure
            }
        };

        self.interceptors.post_process(&request, &mut response).await;
        response
    }

    async fn handle_connection<C: AsyncRead + AsyncWrite + Send + Unpin + 'static>(
        self: Arc<Self>,
        stream: C,
        peer: String,
    ) {
        let (mut reader, writer) = split(stream);
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(run_writer(writer, rx));

        loop {
            let frame = match protocol::read_frame(&mut reader, &self.compressors).await {
                Ok(frame) => frame,
                Err(RpcError::Io(_)) => return,
                Err(err) => {
                    debug!("closing connection from {peer} after frame error: {err}");
                    return;
                }
            };
            if frame.message_type != MessageType::Request {
                warn!("server received a non-request frame from {peer}, discarding");
                continue;
            }

            let server = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                server.handle_frame(frame, peer.clone(), tx).await;
            });
        }
    }

    async fn handle_frame(
        self: Arc<Self>,
        frame: protocol::Frame,
        peer: String,
        tx: mpsc::Sender<Vec<u8>>,
    ) {
        let codec_tag = frame.codec_tag;
        let compression_tag = frame.compression_tag;
        let request_id = frame.request_id;

        let mut request = match frame.decode_request(&self.codecs) {
            Ok(r) => r,
            Err(err) => {
                warn!("failed to decode request {request_id} from {peer}: {err}");
                return;
            }
        };
        request.client_address = Some(peer);
        request.timestamp_ms = now_ms();

        let response = self.dispatch(request).await;
        let status_code = if response.status == 0 { status::FAILURE } else { response.status };
        let mut response = response;
        response.status = status_code;

        match protocol::encode_response(
            &self.codecs,
            &self.compressors,
            codec_tag,
            compression_tag,
            request_id,
            &response,
        )
        .await
        {
            Ok(bytes) => {
                let _ = tx.send(bytes).await;
            }
            Err(err) => warn!("failed to encode response for request {request_id}: {err}"),
        }
    }
}

async fn run_writer<W: AsyncWrite + Send + Unpin + 'static>(mut writer: W, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
