//! Interceptor chain: ordered pre/post hooks with short-circuit on
//! rejection (spec.md §4.13).

use async_trait::async_trait;

use crate::auth::{failure_code, AuthenticationManager};
use crate::model::{status, RpcRequest, RpcResponse};
use crate::ratelimit::RateLimitManager;
use crate::RpcError;

/// One entry in the server's interceptor chain (spec.md §4.13).
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;
    /// Smaller runs earlier.
    fn priority(&self) -> i32;

    /// `false` short-circuits dispatch; the interceptor is responsible for
    /// populating `response` with its rejection code/message.
    async fn pre_process(&self, request: &mut RpcRequest, response: &mut RpcResponse) -> bool;

    /// Runs in reverse chain order after dispatch.
    async fn post_process(&self, _request: &RpcRequest, _response: &mut RpcResponse) {}

    /// Runs when business dispatch raises an error.
    async fn on_exception(&self, _request: &RpcRequest, response: &mut RpcResponse, error: &RpcError) {
        *response = RpcResponse::failure(error.to_string());
        response.status = error.status_code();
    }
}

/// Verifies the caller's token and authorizes against the dispatched
/// method's role policy (spec.md §4.12, §4.13). Registered first in the
/// default chain.
pub struct SecurityInterceptor {
    auth: std::sync::Arc<AuthenticationManager>,
}

impl SecurityInterceptor {
    pub fn new(auth: std::sync::Arc<AuthenticationManager>) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl Interceptor for SecurityInterceptor {
    fn name(&self) -> &'static str {
        "security"
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn pre_process(&self, request: &mut RpcRequest, response: &mut RpcResponse) -> bool {
        if self.auth.is_public(&request.interface) {
            return true;
        }
        let Some(token) = request.auth_token.as_deref() else {
            *response = RpcResponse::failure("missing auth token");
            response.status = status::UNAUTHENTICATED;
            response
                .extensions
                .insert("code".to_string(), failure_code::MISSING_TOKEN.to_string());
            return false;
        };
        let context = match self.auth.authenticate(token, Some(&request.interface)) {
            Ok(ctx) => ctx,
            Err(_) => {
                *response = RpcResponse::failure("invalid auth token");
                response.status = status::UNAUTHENTICATED;
                response
                    .extensions
                    .insert("code".to_string(), failure_code::INVALID_TOKEN.to_string());
                return false;
            }
        };
        if let Err(err) = self.auth.authorize(&context, request.is_read_intent()) {
            *response = RpcResponse::failure(err.to_string());
            response.status = err.status_code();
            response
                .extensions
                .insert("code".to_string(), failure_code::INSUFFICIENT_PERMISSIONS.to_string());
            return false;
        }
        request
            .attributes
            .insert("principal".to_string(), context.principal);
        true
    }
}

/// Admits IP → user → service → method in order, denying fast on the first
/// exceeded limit (spec.md §4.11, §4.13). Registered second in the default
/// chain.
pub struct RateLimitInterceptor {
    limiter: std::sync::Arc<RateLimitManager>,
}

impl RateLimitInterceptor {
    pub fn new(limiter: std::sync::Arc<RateLimitManager>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Interceptor for RateLimitInterceptor {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn pre_process(&self, request: &mut RpcRequest, response: &mut RpcResponse) -> bool {
        let ip = request.client_address.clone().unwrap_or_default();
        let user = request.attributes.get("principal").cloned();
        let service = request.service_key().to_string();
        match self
            .limiter
            .admit(&ip, user.as_deref(), &service, &request.method)
        {
            Ok(()) => true,
            Err(RpcError::RateLimited { retry_after_ms }) => {
                *response = RpcResponse::failure("rate limited");
                response.status = status::RATE_LIMITED;
                response
                    .extensions
                    .insert("retryAfter".to_string(), retry_after_ms.to_string());
                false
            }
            Err(_) => true,
        }
    }
}

/// Ordered chain run by the server dispatcher (spec.md §4.13).
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    /// Default chain: security first, then rate-limit (spec.md §4.13).
    pub fn with_defaults(
        auth: std::sync::Arc<AuthenticationManager>,
        limiter: std::sync::Arc<RateLimitManager>,
    ) -> Self {
        let mut chain = Self::new();
        chain.register(Box::new(SecurityInterceptor::new(auth)));
        chain.register(Box::new(RateLimitInterceptor::new(limiter)));
        chain
    }

    pub fn register(&mut self, interceptor: Box<dyn Interceptor>) {
        self.interceptors.push(interceptor);
        self.interceptors.sort_by_key(|i| i.priority());
    }

    /// Runs pre-processors in priority order; returns `false` (and a
    /// populated `response`) on the first rejection (spec.md §4.13).
    pub async fn pre_process(&self, request: &mut RpcRequest, response: &mut RpcResponse) -> bool {
        for interceptor in &self.interceptors {
            if !interceptor.pre_process(request, response).await {
                return false;
            }
        }
        true
    }

    /// Runs post-processors in reverse order (spec.md §4.13).
    pub async fn post_process(&self, request: &RpcRequest, response: &mut RpcResponse) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.post_process(request, response).await;
        }
    }

    pub async fn on_exception(&self, request: &RpcRequest, response: &mut RpcResponse, error: &RpcError) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.on_exception(request, response, error).await;
        }
    }
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn sample_request() -> RpcRequest {
        RpcRequest {
            interface: "com.example.Greeter".into(),
            method: "sayHello".into(),
            group: "default".into(),
            version: "1.0".into(),
            param_types: vec![],
            params: vec![],
            auth_token: None,
            client_address: Some("127.0.0.1".into()),
            timestamp_ms: 0,
            attributes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn missing_token_short_circuits_with_missing_code() {
        let auth = Arc::new(AuthenticationManager::new(AuthConfig {
            public_interface_prefixes: vec![],
            ..AuthConfig::default()
        }));
        let limiter = Arc::new(RateLimitManager::default());
        let chain = InterceptorChain::with_defaults(auth, limiter);

        let mut request = sample_request();
        let mut response = RpcResponse::ok(serde_json::json!(null));
        let admitted = chain.pre_process(&mut request, &mut response).await;
        assert!(!admitted);
        assert_eq!(response.status, status::UNAUTHENTICATED);
        assert_eq!(
            response.extensions.get("code").map(String::as_str),
            Some(failure_code::MISSING_TOKEN)
        );
    }

    #[tokio::test]
    async fn public_interface_bypasses_security_then_rate_limit_runs() {
        let auth = Arc::new(AuthenticationManager::new(AuthConfig {
            public_interface_prefixes: vec!["com.example.".into()],
            ..AuthConfig::default()
        }));
        let limiter = Arc::new(RateLimitManager::default());
        let chain = InterceptorChain::with_defaults(auth, limiter);

        let mut request = sample_request();
        let mut response = RpcResponse::ok(serde_json::json!(null));
        assert!(chain.pre_process(&mut request, &mut response).await);
    }

    #[tokio::test]
    async fn valid_signed_token_is_admitted_and_annotates_principal() {
        let auth = Arc::new(AuthenticationManager::new(AuthConfig {
            public_interface_prefixes: vec![],
            ..AuthConfig::default()
        }));
        let token = auth
            .issue_signed_token("alice", vec!["read".into()])
            .unwrap();
        let limiter = Arc::new(RateLimitManager::default());
        let chain = InterceptorChain::with_defaults(auth, limiter);

        let mut request = sample_request();
        request.auth_token = Some(token);
        request.method = "getGreeting".into();
        let mut response = RpcResponse::ok(serde_json::json!(null));
        assert!(chain.pre_process(&mut request, &mut response).await);
        assert_eq!(request.attributes.get("principal").unwrap(), "alice");
    }
}
