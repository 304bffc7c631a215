//! Authentication: signed (JWT-style) tokens and opaque keys, plus the
//! role-based authorization policy consumed by the security interceptor
//! (spec.md §4.12).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{Result, RpcError};

type HmacSha256 = Hmac<Sha256>;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub const SIGNED_TOKEN_DEFAULT_EXPIRY_SECS: i64 = 24 * 60 * 60;
pub const OPAQUE_KEY_DEFAULT_EXPIRY_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthType {
    Signed,
    Opaque,
}

/// The result of a successful validation, handed to authorization policy
/// (spec.md §4.12).
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: String,
    pub roles: Vec<String>,
    pub auth_type: AuthType,
    pub expires_at: i64,
}

impl AuthContext {
    fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    sub: String,
    iat: i64,
    exp: i64,
    roles: Vec<String>,
}

fn b64_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn b64_decode(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| RpcError::Unauthenticated(format!("bad base64: {e}")))
}

/// Active signing secrets: newest used for signing, any accepted for
/// verification, enabling rotation without invalidating older tokens
/// (spec.md §9 Open Question, resolved in DESIGN.md).
#[derive(Clone)]
pub struct SigningSecrets {
    secrets: Vec<Vec<u8>>,
}

impl SigningSecrets {
    pub fn new(secrets: Vec<Vec<u8>>) -> Self {
        assert!(!secrets.is_empty(), "at least one signing secret required");
        Self { secrets }
    }

    fn signing_secret(&self) -> &[u8] {
        self.secrets.last().unwrap()
    }
}

/// Issues and verifies `{header}.{payload}.{signature}` tokens signed with
/// HMAC-SHA256 (spec.md §4.12).
pub struct SignedTokenIssuer {
    secrets: SigningSecrets,
}

impl SignedTokenIssuer {
    pub fn new(secrets: SigningSecrets) -> Self {
        Self { secrets }
    }

    fn sign(secret: &[u8], signing_input: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| RpcError::Unauthenticated(format!("bad signing secret: {e}")))?;
        mac.update(signing_input.as_bytes());
        Ok(b64_encode(&mac.finalize().into_bytes()))
    }

    pub fn issue(&self, subject: &str, roles: Vec<String>, expiry_secs: i64) -> Result<String> {
        let header = Header {
            alg: "HS256".into(),
            typ: "JWT".into(),
        };
        let now = now_secs();
        let payload = Payload {
            sub: subject.to_string(),
            iat: now,
            exp: now + expiry_secs,
            roles,
        };
        let header_b64 = b64_encode(
            &serde_json::to_vec(&header)
                .map_err(|e| RpcError::SerializationError(e.to_string()))?,
        );
        let payload_b64 = b64_encode(
            &serde_json::to_vec(&payload)
                .map_err(|e| RpcError::SerializationError(e.to_string()))?,
        );
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = Self::sign(self.secrets.signing_secret(), &signing_input)?;
        Ok(format!("{signing_input}.{signature}"))
    }

    /// Format check, signature equality against any active secret, then
    /// expiry (spec.md §4.12).
    pub fn verify(&self, token: &str) -> Result<AuthContext> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(RpcError::Unauthenticated("malformed token".to_string()));
        }
        let signing_input = format!("{}.{}", parts[0], parts[1]);
        let matches = self
            .secrets
            .secrets
            .iter()
            .any(|secret| match Self::sign(secret, &signing_input) {
                Ok(expected) => expected == parts[2],
                Err(_) => false,
            });
        if !matches {
            return Err(RpcError::Unauthenticated("bad signature".to_string()));
        }
        let payload_bytes = b64_decode(parts[1])?;
        let payload: Payload = serde_json::from_slice(&payload_bytes)
            .map_err(|e| RpcError::Unauthenticated(format!("bad payload: {e}")))?;
        if now_secs() >= payload.exp {
            return Err(RpcError::Unauthenticated("token expired".to_string()));
        }
        Ok(AuthContext {
            principal: payload.sub,
            roles: payload.roles,
            auth_type: AuthType::Signed,
            expires_at: payload.exp,
        })
    }
}

/// Server-side opaque key registry entry (spec.md §3, §4.12).
#[derive(Debug, Clone)]
pub struct OpaqueKeyEntry {
    pub service_id: Option<String>,
    pub roles: Vec<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub enabled: bool,
}

#[derive(Default)]
pub struct OpaqueKeyRegistry {
    keys: DashMap<String, OpaqueKeyEntry>,
}

impl OpaqueKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self, service_id: Option<String>, roles: Vec<String>, expiry_secs: i64) -> String {
        let key = uuid::Uuid::new_v4().to_string();
        let now = now_secs();
        self.keys.insert(
            key.clone(),
            OpaqueKeyEntry {
                service_id,
                roles,
                created_at: now,
                expires_at: now + expiry_secs,
                enabled: true,
            },
        );
        key
    }

    /// Existence, enabled, optional service-ID match, and expiry
    /// (spec.md §4.12).
    pub fn validate(&self, key: &str, service_id: Option<&str>) -> Result<AuthContext> {
        let entry = self
            .keys
            .get(key)
            .ok_or_else(|| RpcError::Unauthenticated("unknown opaque key".to_string()))?;
        if !entry.enabled {
            return Err(RpcError::Unauthenticated("opaque key disabled".to_string()));
        }
        if let (Some(expected), Some(actual)) = (service_id, entry.service_id.as_deref()) {
            if expected != actual {
                return Err(RpcError::Unauthenticated("service id mismatch".to_string()));
            }
        }
        if now_secs() >= entry.expires_at {
            return Err(RpcError::Unauthenticated("opaque key expired".to_string()));
        }
        Ok(AuthContext {
            principal: entry.service_id.clone().unwrap_or_else(|| key.to_string()),
            roles: entry.roles.clone(),
            auth_type: AuthType::Opaque,
            expires_at: entry.expires_at,
        })
    }
}

/// Failure codes surfaced by the security interceptor (spec.md §4.12).
pub mod failure_code {
    pub const MISSING_TOKEN: &str = "MISSING_TOKEN";
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const INSUFFICIENT_PERMISSIONS: &str = "INSUFFICIENT_PERMISSIONS";
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secrets: Vec<Vec<u8>>,
    /// Interface-name prefixes that bypass authentication entirely
    /// (spec.md §4.12 "public service").
    pub public_interface_prefixes: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secrets: vec![b"change-me".to_vec()],
            public_interface_prefixes: vec!["public.".to_string()],
        }
    }
}

struct CachedValidation {
    context: AuthContext,
}

/// Process-wide authentication manager: caches successful validations keyed
/// by token (or `token#service_id` for opaque keys), with a periodic sweep
/// removing expired entries (spec.md §4.12, §6).
pub struct AuthenticationManager {
    signed: SignedTokenIssuer,
    opaque: OpaqueKeyRegistry,
    config: AuthConfig,
    cache: DashMap<String, CachedValidation>,
    sweeps_run: AtomicI64,
}

impl AuthenticationManager {
    pub fn new(config: AuthConfig) -> Self {
        let signed = SignedTokenIssuer::new(SigningSecrets::new(config.secrets.clone()));
        Self {
            signed,
            opaque: OpaqueKeyRegistry::new(),
            config,
            cache: DashMap::new(),
            sweeps_run: AtomicI64::new(0),
        }
    }

    pub fn issue_signed_token(&self, subject: &str, roles: Vec<String>) -> Result<String> {
        self.signed
            .issue(subject, roles, SIGNED_TOKEN_DEFAULT_EXPIRY_SECS)
    }

    pub fn generate_opaque_key(&self, service_id: Option<String>, roles: Vec<String>) -> String {
        self.opaque
            .generate(service_id, roles, OPAQUE_KEY_DEFAULT_EXPIRY_SECS)
    }

    pub fn is_public(&self, interface: &str) -> bool {
        self.config
            .public_interface_prefixes
            .iter()
            .any(|prefix| interface.starts_with(prefix.as_str()))
    }

    /// If the token has three dot-separated segments, the signed-token path
    /// is attempted first, then the opaque-key path (spec.md §4.12).
    pub fn authenticate(&self, token: &str, service_id: Option<&str>) -> Result<AuthContext> {
        let cache_key = match service_id {
            Some(sid) => format!("{token}#{sid}"),
            None => token.to_string(),
        };
        if let Some(cached) = self.cache.get(&cache_key) {
            if !cached.context.is_expired(now_secs()) {
                return Ok(cached.context.clone());
            }
            drop(cached);
            self.cache.remove(&cache_key);
        }

        let looks_signed = token.split('.').count() == 3;
        let context = if looks_signed {
            self.signed
                .verify(token)
                .or_else(|_| self.opaque.validate(token, service_id))?
        } else {
            self.opaque.validate(token, service_id)?
        };

        self.cache.insert(
            cache_key,
            CachedValidation {
                context: context.clone(),
            },
        );
        Ok(context)
    }

    /// Removes expired cache entries; returns the count removed (spec.md
    /// §4.12 "periodic sweep").
    pub fn sweep_expired(&self) -> usize {
        self.sweeps_run.fetch_add(1, Ordering::Relaxed);
        let now = now_secs();
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|entry| entry.context.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &expired {
            self.cache.remove(key);
        }
        expired.len()
    }

    /// Role policy: `admin`/`service` pass unconditionally; `read` passes
    /// only for read-intent methods; `write` passes for everything else
    /// (spec.md §4.12).
    pub fn authorize(&self, context: &AuthContext, method_is_read_intent: bool) -> Result<()> {
        let roles: HashMap<&str, ()> = context.roles.iter().map(|r| (r.as_str(), ())).collect();
        if roles.contains_key("admin") || roles.contains_key("service") {
            return Ok(());
        }
        if method_is_read_intent && roles.contains_key("read") {
            return Ok(());
        }
        if !method_is_read_intent && roles.contains_key("write") {
            return Ok(());
        }
        Err(RpcError::InsufficientPermissions(
            failure_code::INSUFFICIENT_PERMISSIONS.to_string(),
        ))
    }
}

impl Default for AuthenticationManager {
    fn default() -> Self {
        Self::new(AuthConfig::default())
    }
}
