//! Signed transport client.
//!
//! Every request to the control plane is signed with the tenant shared
//! key: `X-Agent-Signature` carries
//! `base64(HMAC-SHA256(key, "<timestamp>.<payload>"))` where the payload
//! is the request body (empty for GET). The signature is recomputed per
//! call and the `X-Agent-Nonce` is fresh 128-bit randomness per call.
//!
//! The legacy heartbeat path (`/mtls/hello`) predates the `X-Agent-*`
//! header family and uses the `X-Request-*` / `X-Client-*` set instead;
//! [`SignedTransport::post_legacy_signed`] keeps that contract.
//!
//! The actual HTTP engine (TLS, connection reuse, proxies) lives behind
//! [`HttpExchange`] and is injected at construction, so the client here
//! owns only header construction and error mapping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use secrecy::ExposeSecret;
use thiserror::Error;

use crate::config::Config;
use crate::crypto::{self, SignError};

/// `X-Agent-Identity` header name.
pub const HEADER_IDENTITY: &str = "X-Agent-Identity";
/// `X-Agent-Nonce` header name.
pub const HEADER_NONCE: &str = "X-Agent-Nonce";
/// `X-Agent-Timestamp` header name.
pub const HEADER_TIMESTAMP: &str = "X-Agent-Timestamp";
/// `X-Agent-Signature` header name.
pub const HEADER_SIGNATURE: &str = "X-Agent-Signature";
/// `X-API-Key` header name.
pub const HEADER_API_KEY: &str = "X-API-Key";

/// Default connect timeout for outbound requests.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for outbound requests.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP method subset used by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET request with an empty body.
    Get,
    /// POST request with a JSON body.
    Post,
}

/// A fully-prepared outbound request handed to the [`HttpExchange`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs, already including signing headers.
    pub headers: Vec<(String, String)>,
    /// Request body (empty for GET).
    pub body: Vec<u8>,
    /// Connect timeout the exchange must honour.
    pub connect_timeout: Duration,
    /// Read timeout the exchange must honour.
    pub read_timeout: Duration,
}

/// Response surface the agent cares about.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Whether the status is in the 2xx range.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// First few hundred bytes of the body, lossily decoded, for
    /// diagnostics.
    #[must_use]
    pub fn body_head(&self) -> String {
        let head = &self.body[..self.body.len().min(256)];
        String::from_utf8_lossy(head).into_owned()
    }
}

/// Transport-level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The exchange could not reach the endpoint.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The endpoint answered outside the 2xx range.
    #[error("http status {status}: {body_head}")]
    HttpNon2xx {
        /// Response status code.
        status: u16,
        /// Leading bytes of the response body.
        body_head: String,
    },

    /// Signing was requested without a shared key.
    #[error("signing unavailable")]
    SigningUnavailable(#[from] SignError),
}

/// Boundary to the concrete HTTP engine.
///
/// Implementations own TLS, connection reuse, and timeout enforcement;
/// they must map connection failures to
/// [`TransportError::TransportUnavailable`] and report every received
/// status code as an [`HttpResponse`] rather than an error.
#[async_trait]
pub trait HttpExchange: Send + Sync {
    /// Perform one request/response round trip.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Generate a fresh 128-bit nonce as 32 lowercase hex characters.
#[must_use]
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Signed HTTP client over an injected exchange.
#[derive(Clone)]
pub struct SignedTransport {
    config: Arc<Config>,
    exchange: Arc<dyn HttpExchange>,
}

impl SignedTransport {
    /// Create a transport for the given configuration and exchange.
    #[must_use]
    pub fn new(config: Arc<Config>, exchange: Arc<dyn HttpExchange>) -> Self {
        Self { config, exchange }
    }

    /// The configuration this transport signs for.
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Signed GET against `transport_url`.
    ///
    /// # Errors
    ///
    /// [`TransportError::SigningUnavailable`] without a shared key,
    /// [`TransportError::TransportUnavailable`] on connection failure.
    /// Non-2xx statuses are returned as responses; callers that need a
    /// 2xx use [`expect_success`].
    pub async fn get_signed(&self, path_and_query: &str) -> Result<HttpResponse, TransportError> {
        let request = HttpRequest {
            method: Method::Get,
            url: join_url(&self.config.transport_url, path_and_query),
            headers: self.signed_headers(b"", false)?,
            body: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        };
        self.exchange.send(request).await
    }

    /// Signed POST against `transport_url`.
    ///
    /// # Errors
    ///
    /// See [`SignedTransport::get_signed`].
    pub async fn post_signed(
        &self,
        path: &str,
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        self.post_to(&self.config.transport_url, path, body).await
    }

    /// Signed POST against `ingestion_url` (evidence and patch-result
    /// sidechannels).
    ///
    /// # Errors
    ///
    /// See [`SignedTransport::get_signed`].
    pub async fn post_ingestion(
        &self,
        path: &str,
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        self.post_to(&self.config.ingestion_url, path, body).await
    }

    /// POST with the legacy heartbeat header set (`X-Request-*` /
    /// `X-Client-*`).
    ///
    /// # Errors
    ///
    /// See [`SignedTransport::get_signed`].
    pub async fn post_legacy_signed(
        &self,
        path: &str,
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        let timestamp = chrono::Utc::now().timestamp();
        let signature =
            crypto::sign_payload(self.config.shared_key.expose_secret(), body, timestamp)?;

        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("X-Request-Signature".to_string(), signature),
            ("X-Request-Timestamp".to_string(), timestamp.to_string()),
            (
                "X-Client-Identity".to_string(),
                self.config.identity_header.clone(),
            ),
            (
                "X-Client-Cert-Sha256".to_string(),
                self.config.cert_fingerprint.clone(),
            ),
            ("X-Client-MTLS".to_string(), "success".to_string()),
            ("X-Forwarded-Proto".to_string(), "https".to_string()),
        ];

        let request = HttpRequest {
            method: Method::Post,
            url: join_url(&self.config.transport_url, path),
            headers,
            body: body.to_vec(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        };
        self.exchange.send(request).await
    }

    async fn post_to(
        &self,
        base: &str,
        path: &str,
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        let request = HttpRequest {
            method: Method::Post,
            url: join_url(base, path),
            headers: self.signed_headers(body, true)?,
            body: body.to_vec(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        };
        self.exchange.send(request).await
    }

    /// Build the `X-Agent-*` header set for a canonical payload.
    fn signed_headers(
        &self,
        payload: &[u8],
        has_body: bool,
    ) -> Result<Vec<(String, String)>, TransportError> {
        let timestamp = chrono::Utc::now().timestamp();
        let signature =
            crypto::sign_payload(self.config.shared_key.expose_secret(), payload, timestamp)?;

        let mut headers = Vec::with_capacity(7);
        if has_body {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        headers.push(("X-Forwarded-Proto".to_string(), "https".to_string()));
        headers.push((HEADER_IDENTITY.to_string(), self.config.identity_header.clone()));
        headers.push((HEADER_NONCE.to_string(), generate_nonce()));
        headers.push((HEADER_TIMESTAMP.to_string(), timestamp.to_string()));
        headers.push((HEADER_SIGNATURE.to_string(), signature));
        if let Some(api_key) = &self.config.api_key {
            headers.push((HEADER_API_KEY.to_string(), api_key.clone()));
        }
        Ok(headers)
    }
}

/// Convert a non-2xx response into [`TransportError::HttpNon2xx`].
///
/// # Errors
///
/// Returns the mapped error for any status outside the 2xx range.
pub fn expect_success(response: HttpResponse) -> Result<HttpResponse, TransportError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(TransportError::HttpNon2xx {
            status: response.status,
            body_head: response.body_head(),
        })
    }
}

/// Join a base URL and a path without duplicating the separator.
#[must_use]
pub fn join_url(base: &str, path: &str) -> String {
    let trimmed_base = base.trim_end_matches('/');
    let trimmed_path = path.trim_start_matches('/');
    format!("{trimmed_base}/{trimmed_path}")
}
