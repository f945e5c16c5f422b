use std::{future::Future, pin::Pin, sync::Arc};

use super::{Middleware, Next};
use crate::{Response, context::Context, monitor::Monitor};

/// Times each request from pipeline entry, adds `X-Response-Time` and
/// records the call in the shared [`Monitor`] under `"METHOD /path"`.
///
/// Responses with a status of `400` or above count as failures.
pub struct MonitoringMiddleware {
    monitor: Arc<Monitor>,
}

impl MonitoringMiddleware {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }
}

/// Key under which a request is recorded in the [`Monitor`].
pub(crate) fn endpoint_label(ctx: &Context) -> String {
    format!("{} {}", ctx.request().method(), ctx.request().path())
}

impl Middleware for MonitoringMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let monitor = Arc::clone(&self.monitor);
        Box::pin(async move {
            let start = ctx.meta().start_time;
            let label = endpoint_label(&ctx);

            let mut response = next.run(ctx).await;

            let elapsed = start.elapsed();
            monitor.record(&label, elapsed, response.status().as_u16() < 400);
            response.headers_mut().set(
                "X-Response-Time",
                format!("{:.3}ms", elapsed.as_secs_f64() * 1000.0),
            );
            response
        })
    }
}
