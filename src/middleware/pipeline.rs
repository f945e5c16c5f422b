use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::error;

use super::{
    CacheHeaderPolicy, CacheHeadersMiddleware, CompressionMiddleware, Endpoint, Middleware,
    MiddlewareHandler, MonitoringMiddleware, Next, RateLimitMiddleware, RequestIdMiddleware,
    ThrottleMiddleware, ValidationMiddleware, VersioningMiddleware, from_middleware,
    monitoring::endpoint_label,
};
use crate::{
    Request, Response, StatusCode,
    config::{CompressionConfig, CorsConfig, ValidationConfig},
    context::Context,
    limiter::RateLimiter,
    monitor::Monitor,
    security::CorsMiddleware,
    throttle::Throttler,
    version::VersionNegotiator,
};

/// An opt-in pipeline stage together with the shared component it drives.
pub enum Feature {
    RateLimiting(Arc<RateLimiter>),
    Versioning(Arc<VersionNegotiator>),
    Throttling(Arc<Throttler>),
    Monitoring(Arc<Monitor>),
    CacheHeaders(CacheHeaderPolicy),
    Validation(ValidationConfig),
    Compression(CompressionConfig),
    Cors(CorsConfig),
}

/// Ordered middleware stack in front of an endpoint.
///
/// Stages run in registration order. [`RequestIdMiddleware`] is always first.
/// A panic anywhere in the chain is caught here once: it is logged with the
/// request id, recorded as a failed call when monitoring is enabled, and
/// answered with a generic `500`.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use apigate::{Method, Request, Response, StatusCode};
/// use apigate::context::Context;
/// use apigate::limiter::RateLimiter;
/// use apigate::middleware::{Feature, LoggerMiddleware, Pipeline, endpoint};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut pipeline = Pipeline::new(endpoint(|_ctx: Context| async {
///     Response::new(StatusCode::Ok).body("hello")
/// }));
/// pipeline
///     .add(LoggerMiddleware)
///     .enable_feature(Feature::RateLimiting(Arc::new(RateLimiter::new(
///         Duration::from_secs(60),
///         100,
///     ))));
///
/// let response = pipeline.handle(Request::new(Method::Get, "/hello")).await;
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert!(response.headers().contains("X-Rate-Limit-Remaining"));
/// # }
/// ```
pub struct Pipeline {
    middlewares: Vec<MiddlewareHandler>,
    endpoint: Endpoint,
    monitor: Option<Arc<Monitor>>,
}

impl Pipeline {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            middlewares: vec![from_middleware(Arc::new(RequestIdMiddleware))],
            endpoint,
            monitor: None,
        }
    }

    /// Appends a middleware.
    pub fn add<M>(&mut self, middleware: M) -> &mut Self
    where
        M: Middleware + 'static,
    {
        self.add_handler(from_middleware(Arc::new(middleware)))
    }

    /// Appends an already type-erased handler.
    pub fn add_handler(&mut self, handler: MiddlewareHandler) -> &mut Self {
        self.middlewares.push(handler);
        self
    }

    /// Appends the stage implementing `feature`.
    pub fn enable_feature(&mut self, feature: Feature) -> &mut Self {
        match feature {
            Feature::RateLimiting(limiter) => self.add(RateLimitMiddleware::new(limiter)),
            Feature::Versioning(negotiator) => self.add(VersioningMiddleware::new(negotiator)),
            Feature::Throttling(throttler) => self.add(ThrottleMiddleware::new(throttler)),
            Feature::Monitoring(monitor) => {
                self.monitor = Some(Arc::clone(&monitor));
                self.add(MonitoringMiddleware::new(monitor))
            }
            Feature::CacheHeaders(policy) => self.add(CacheHeadersMiddleware::new(policy)),
            Feature::Validation(config) => self.add(ValidationMiddleware::new(&config)),
            Feature::Compression(config) => self.add(CompressionMiddleware::new(&config)),
            Feature::Cors(config) => self.add(CorsMiddleware::from_config(&config)),
        }
    }

    /// Number of stages, including the request-id stage.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs `request` through every stage and the endpoint.
    pub async fn handle(&self, request: Request) -> Response {
        let ctx = Context::new(request);
        let request_id = ctx.request_id().to_owned();
        let label = endpoint_label(&ctx);
        let start = ctx.meta().start_time;

        let next = Next::with_endpoint(self.middlewares.clone(), Arc::clone(&self.endpoint));
        match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
            Ok(response) => response,
            Err(panic) => {
                error!(
                    request_id = %request_id,
                    endpoint = %label,
                    panic = panic_message(panic.as_ref()),
                    "unhandled failure in request pipeline"
                );
                if let Some(monitor) = &self.monitor {
                    monitor.record(&label, start.elapsed(), false);
                }
                Response::error(
                    StatusCode::InternalServerError,
                    "internal_error",
                    "Internal server error",
                )
                .header("X-Request-ID", request_id)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{endpoint, from_fn};
    use crate::Method;

    fn exploding_endpoint() -> Endpoint {
        endpoint(|ctx: Context| async move {
            if ctx.request().path() == "/boom" {
                panic!("endpoint exploded");
            }
            Response::new(StatusCode::Ok)
        })
    }

    #[tokio::test]
    async fn panics_become_500_with_request_id() {
        let monitor = Arc::new(Monitor::new());
        let mut pipeline = Pipeline::new(exploding_endpoint());
        pipeline.enable_feature(Feature::Monitoring(Arc::clone(&monitor)));

        let request = Request::new(Method::Get, "/boom").with_header("X-Request-ID", "req-1");
        let response = pipeline.handle(request).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(response.headers().get("X-Request-ID"), Some("req-1"));
        let body: serde_json::Value = serde_json::from_slice(response.body_ref()).unwrap();
        assert_eq!(body["error"]["code"], "internal_error");
        assert_eq!(monitor.stats("GET /boom").unwrap().errors, 1);

        let healthy = pipeline.handle(Request::new(Method::Get, "/ok")).await;
        assert_eq!(healthy.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn stage_panics_are_caught_too() {
        let mut pipeline = Pipeline::new(exploding_endpoint());
        pipeline.add_handler(from_fn(|ctx: Context, next: Next| async move {
            if ctx.request().headers().contains("X-Explode") {
                panic!("stage exploded");
            }
            next.run(ctx).await
        }));

        let request = Request::new(Method::Get, "/").with_header("X-Explode", "1");
        let response = pipeline.handle(request).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn short_circuit_skips_later_stages() {
        let mut pipeline = Pipeline::new(exploding_endpoint());
        pipeline
            .add_handler(from_fn(|ctx: Context, _next: Next| async move {
                ctx.respond(Response::new(StatusCode::Forbidden))
            }))
            .add_handler(from_fn(|ctx: Context, next: Next| async move {
                let reached = true;
                assert!(!reached, "must not run");
                next.run(ctx).await
            }));

        let response = pipeline.handle(Request::new(Method::Get, "/boom")).await;
        assert_eq!(response.status(), StatusCode::Forbidden);
        assert!(response.headers().contains("X-Request-ID"));
        assert_eq!(pipeline.len(), 3);
    }

    #[test]
    fn extracts_panic_messages() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
    }
}
