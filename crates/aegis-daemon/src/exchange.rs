//! Concrete HTTP exchange over `reqwest`.
//!
//! The transport client in `aegis-core` only builds signed requests; this
//! adapter performs them. Connection failures become
//! `TransportUnavailable`; every received status code is reported as a
//! response so the caller decides what non-2xx means.

use aegis_core::transport::{
    HttpExchange, HttpRequest, HttpResponse, Method, TransportError,
};
use async_trait::async_trait;

/// [`HttpExchange`] backed by a shared `reqwest` client.
pub struct ReqwestExchange {
    client: reqwest::Client,
}

impl ReqwestExchange {
    /// Build the exchange.
    ///
    /// # Errors
    ///
    /// Returns the underlying builder error when TLS initialisation
    /// fails.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(aegis_core::transport::DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|error| TransportError::TransportUnavailable(error.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpExchange for ReqwestExchange {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url).body(request.body.clone()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = builder.timeout(request.read_timeout);

        let response = builder
            .send()
            .await
            .map_err(|error| TransportError::TransportUnavailable(error.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|error| TransportError::TransportUnavailable(error.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }
}
