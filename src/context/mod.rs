//! Per-request context threaded through the middleware pipeline.
//!
//! A [`Context`] is built once per inbound request. It carries the request,
//! the [`RequestMeta`] every stage reads (start time, request id, negotiated
//! version, caller identity), response headers staged by earlier stages, and
//! a type-erased [`Extensions`] map for anything else a stage wants to hand
//! downstream.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use tokio::time::Instant;
use uuid::Uuid;

use crate::{Headers, Request, Response};

/// Identifier used when a request carries no usable client address.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Type-erased request extensions map: lets one stage hand typed state to a
/// later one without either knowing the other.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value`, replacing any earlier value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Facts about the request established when it enters the pipeline.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub start_time: Instant,
    /// Taken from an inbound `X-Request-ID` when present, otherwise a new v4 UUID.
    pub request_id: String,
    /// Set by the versioning stage.
    pub negotiated_version: Option<String>,
    /// See [`resolve_client_identifier`].
    pub client_identifier: String,
    pub user_agent: Option<String>,
}

impl RequestMeta {
    fn from_request(request: &Request) -> Self {
        let request_id = request
            .headers()
            .get("X-Request-ID")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);

        Self {
            start_time: Instant::now(),
            request_id,
            negotiated_version: None,
            client_identifier: resolve_client_identifier(request),
            user_agent: request.headers().get("User-Agent").map(str::to_owned),
        }
    }
}

/// Identifies the caller for rate limiting: the first `X-Forwarded-For`
/// entry, then `X-Real-IP`, then the TCP peer address, then
/// [`ANONYMOUS_CLIENT`].
pub fn resolve_client_identifier(request: &Request) -> String {
    let headers = request.headers();
    let forwarded = headers
        .get("X-Forwarded-For")
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    let real_ip = headers
        .get("X-Real-IP")
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_owned)
        .or_else(|| request.peer_addr().map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| ANONYMOUS_CLIENT.to_owned())
}

/// Per-request state handed from stage to stage.
pub struct Context {
    request: Request,
    meta: RequestMeta,
    response_headers: Headers,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: Request) -> Self {
        let meta = RequestMeta::from_request(&request);
        Self {
            request,
            meta,
            response_headers: Headers::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut RequestMeta {
        &mut self.meta
    }

    pub fn request_id(&self) -> &str {
        &self.meta.request_id
    }

    /// Headers staged so far for the eventual response.
    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    /// Stages a header for the response, replacing an earlier staged value.
    ///
    /// Staged headers are applied to whatever response leaves the pipeline,
    /// whether it comes from the endpoint or from a stage that short-circuits
    /// through [`respond`](Self::respond).
    pub fn stage_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers.set(name, value);
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }

    /// Finishes the request with `response`, applying every staged header.
    pub fn respond(self, mut response: Response) -> Response {
        response.headers_mut().merge(&self.response_headers);
        response
    }

    /// Removes and returns the staged headers.
    pub(crate) fn take_response_headers(&mut self) -> Headers {
        std::mem::take(&mut self.response_headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Method, StatusCode};

    #[test]
    fn forwarded_for_takes_precedence() {
        let request = Request::new(Method::Get, "/")
            .with_header("X-Forwarded-For", " 203.0.113.9, 10.0.0.1")
            .with_header("X-Real-IP", "10.0.0.2")
            .with_peer_addr("127.0.0.1:5000".parse().unwrap());
        assert_eq!(resolve_client_identifier(&request), "203.0.113.9");
    }

    #[test]
    fn falls_back_through_real_ip_and_peer() {
        let real_ip = Request::new(Method::Get, "/")
            .with_header("X-Real-IP", "10.0.0.2")
            .with_peer_addr("127.0.0.1:5000".parse().unwrap());
        assert_eq!(resolve_client_identifier(&real_ip), "10.0.0.2");

        let peer = Request::new(Method::Get, "/").with_peer_addr("127.0.0.1:5000".parse().unwrap());
        assert_eq!(resolve_client_identifier(&peer), "127.0.0.1");

        let nobody = Request::new(Method::Get, "/");
        assert_eq!(resolve_client_identifier(&nobody), ANONYMOUS_CLIENT);
    }

    #[test]
    fn request_id_is_reused_or_generated() {
        let supplied = Context::new(Request::new(Method::Get, "/").with_header("X-Request-ID", "abc-123"));
        assert_eq!(supplied.request_id(), "abc-123");

        let generated = Context::new(Request::new(Method::Get, "/"));
        assert!(Uuid::parse_str(generated.request_id()).is_ok());
    }

    #[test]
    fn staged_headers_apply_on_respond() {
        let mut ctx = Context::new(Request::new(Method::Get, "/"));
        ctx.stage_header("X-Rate-Limit-Limit", "100");
        ctx.stage_header("X-Rate-Limit-Limit", "50");
        let response = ctx.respond(Response::new(StatusCode::TooManyRequests));
        assert_eq!(response.headers().get("x-rate-limit-limit"), Some("50"));
        assert_eq!(response.headers().get_all("x-rate-limit-limit").count(), 1);
    }

    #[test]
    fn extensions_round_trip_by_type() {
        struct Tenant(&'static str);
        let mut ext = Extensions::new();
        ext.insert(Tenant("acme"));
        ext.insert(7_u32);
        assert_eq!(ext.get::<Tenant>().map(|t| t.0), Some("acme"));
        *ext.get_mut::<u32>().unwrap() += 1;
        assert_eq!(ext.remove::<u32>(), Some(8));
        assert!(ext.get::<u32>().is_none());
    }
}
