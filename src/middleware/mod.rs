//! Middleware pipeline: composable before/after request handler logic.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware wraps the next layer, enabling request inspection, short-circuit
//! responses, and response decoration without coupling endpoints to gateway
//! concerns.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer, ending at the endpoint.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`Endpoint`]: the terminal handler producing the actual response.
//! - [`Pipeline`]: owns the stack, builds the per-request [`Context`] and
//!   catches stage panics.
//!
//! ## Built-in stages
//!
//! | Stage | Enabled by |
//! |-------|------------|
//! | [`RequestIdMiddleware`] | always, first |
//! | [`LoggerMiddleware`] | [`Pipeline::add`] |
//! | [`RateLimitMiddleware`] | [`Feature::RateLimiting`] |
//! | [`VersioningMiddleware`] | [`Feature::Versioning`] |
//! | [`ThrottleMiddleware`] | [`Feature::Throttling`] |
//! | [`MonitoringMiddleware`] | [`Feature::Monitoring`] |
//! | [`CacheHeadersMiddleware`] | [`Feature::CacheHeaders`] |
//! | [`ValidationMiddleware`] | [`Feature::Validation`] |
//! | [`CompressionMiddleware`] | [`Feature::Compression`] |
//! | [`CorsMiddleware`](crate::security::CorsMiddleware) | [`Feature::Cors`] |

mod cache_headers;
mod compression;
mod monitoring;
mod pipeline;
mod rate_limit;
mod throttling;
mod validation;
mod versioning;

pub use cache_headers::{CacheHeaderPolicy, CacheHeadersMiddleware};
pub use compression::CompressionMiddleware;
pub use monitoring::MonitoringMiddleware;
pub use pipeline::{Feature, Pipeline};
pub use rate_limit::RateLimitMiddleware;
pub use throttling::ThrottleMiddleware;
pub use validation::ValidationMiddleware;
pub use versioning::VersioningMiddleware;

use std::{future::Future, pin::Pin, sync::Arc};

use tracing::info;

use crate::{Response, StatusCode, context::Context};

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
///
/// Construct one with [`from_middleware`] or from an async closure with [`from_fn`]:
///
/// ```rust,no_run
/// use apigate::{context::Context, middleware::{MiddlewareHandler, Next, from_fn}};
///
/// let handler: MiddlewareHandler = from_fn(|ctx: Context, next: Next| async move {
///     next.run(ctx).await
/// });
/// ```
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// The handler at the end of the chain.
pub type Endpoint =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Wraps an async function as an [`Endpoint`].
///
/// # Examples
///
/// ```rust
/// use apigate::{Response, StatusCode, context::Context, middleware::endpoint};
///
/// let hello = endpoint(|_ctx: Context| async { Response::new(StatusCode::Ok).body("hello") });
/// ```
pub fn endpoint<F, Fut>(handler: F) -> Endpoint
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(
        move |ctx: Context| -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(handler(ctx))
        },
    )
}

/// Wraps an async function of `(Context, Next)` as a [`MiddlewareHandler`].
pub fn from_fn<F, Fut>(handler: F) -> MiddlewareHandler
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(
        move |ctx: Context, next: Next| -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(handler(ctx, next))
        },
    )
}

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Arguments
///
/// - `middleware`: a reference-counted [`Middleware`] to wrap.
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware, or the endpoint once every middleware has run.
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
///
/// # Examples
///
/// ```rust,no_run
/// use std::pin::Pin;
/// use apigate::{Response, context::Context, middleware::{Middleware, Next}};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(
///         &self,
///         ctx: Context,
///         next: Next,
///     ) -> Pin<Box<dyn std::future::Future<Output = Response> + Send>> {
///         Box::pin(async move { next.run(ctx).await })
///     }
/// }
/// ```
pub struct Next {
    middlewares: Vec<MiddlewareHandler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
    endpoint: Option<Endpoint>,
}

impl Next {
    /// Creates a cursor over `middlewares` with no endpoint; an exhausted
    /// chain answers `500`.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares,
            index: 0,
            endpoint: None,
        }
    }

    /// Creates a cursor over `middlewares` that ends at `endpoint`.
    pub fn with_endpoint(middlewares: Vec<MiddlewareHandler>, endpoint: Endpoint) -> Self {
        Self {
            middlewares,
            index: 0,
            endpoint: Some(endpoint),
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// Once the chain is exhausted the endpoint runs and every header staged
    /// on the context is applied to its response. Without an endpoint a
    /// `500 Internal Server Error` is returned as a safe fallback.
    ///
    /// # Arguments
    ///
    /// - `ctx`: the per-request [`Context`] to pass to the next middleware.
    ///
    /// # Returns
    ///
    /// The [`Response`] produced by the next middleware or the endpoint.
    pub async fn run(mut self, mut ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            return handler(ctx, self).await;
        }

        match self.endpoint.take() {
            Some(endpoint) => {
                let staged = ctx.take_response_headers();
                let mut response = endpoint(ctx).await;
                response.headers_mut().merge(&staged);
                response
            }
            None => ctx.respond(Response::error(
                StatusCode::InternalServerError,
                "no_response",
                "No response generated by middleware pipeline",
            )),
        }
    }
}

/// The core trait for all gateway middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: answer through [`Context::respond`] without calling
///   `next`, so headers staged by earlier stages are kept.
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited across
///   `.await` points in multi-threaded runtimes.
/// - Implementations **should not** hold locks on shared state across an
///   `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    ///
    /// # Arguments
    ///
    /// - `ctx`: the per-request [`Context`] carrying the request, its
    ///   metadata, staged response headers and extensions.
    /// - `next`: cursor into the remainder of the middleware chain; call
    ///   [`Next::run`] to forward the request.
    ///
    /// # Returns
    ///
    /// A [`Response`], either produced by this middleware directly (short-circuit)
    /// or forwarded from a downstream handler.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// Echoes the request id back to the caller as `X-Request-ID`.
///
/// The id itself is settled when the [`Context`] is built; the pipeline always
/// installs this stage first.
pub struct RequestIdMiddleware;

impl Middleware for RequestIdMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let request_id = ctx.request_id().to_owned();
            ctx.stage_header("X-Request-ID", request_id);
            next.run(ctx).await
        })
    }
}

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` record after the downstream handler
/// completes, carrying the request id and the resolved client identifier.
///
/// `LoggerMiddleware` does not short-circuit; it always delegates to the next
/// middleware and records the outcome after the fact.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use apigate::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = ctx.meta().start_time;
            let method = ctx.request().method().as_str().to_owned();
            let path = ctx.request().path().to_owned();
            let request_id = ctx.request_id().to_owned();
            let client = ctx.meta().client_identifier.clone();

            let response = next.run(ctx).await;

            info!(
                request_id = %request_id,
                client = %client,
                status = response.status().as_u16(),
                duration = ?start.elapsed(),
                "{method} {path}"
            );
            response
        })
    }
}
