//! The network seam of [`GatewayClient`](super::GatewayClient).
//!
//! Everything above this trait (caching, deduplication, throttling, retries)
//! is transport-agnostic; [`ReqwestTransport`] is the production
//! implementation and tests substitute their own.

use async_trait::async_trait;
use bytes::Bytes;

use super::GatewayError;
use crate::http::{Headers, Method};

/// One outbound HTTP exchange, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

/// What came back, before any interpretation of status or body.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the exchange. Errors are reserved for failures to get an
    /// answer at all; any HTTP status is a successful exchange here.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, GatewayError>;
}

/// [`Transport`] backed by a pooled [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, GatewayError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
            .collect();
        let body = response.bytes().await.map_err(classify)?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(e: reqwest::Error) -> GatewayError {
    if e.is_builder() {
        GatewayError::InvalidRequest(e.to_string())
    } else if e.is_decode() {
        GatewayError::Decode(e.to_string())
    } else {
        GatewayError::Transport(e.to_string())
    }
}
