use std::{future::Future, pin::Pin, sync::Arc};

use tracing::warn;

use super::{Middleware, Next};
use crate::{Response, StatusCode, context::Context, limiter::RateLimiter};

/// Admits requests per client identifier through a shared [`RateLimiter`].
///
/// Every response carries `X-Rate-Limit-Limit`, `X-Rate-Limit-Remaining` and
/// `X-Rate-Limit-Reset` (Unix seconds). Rejected requests get `429` with
/// `Retry-After` and never reach later stages.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let limiter = Arc::clone(&self.limiter);
        Box::pin(async move {
            let decision = limiter.is_allowed(&ctx.meta().client_identifier);
            ctx.stage_header("X-Rate-Limit-Limit", decision.limit.to_string());
            ctx.stage_header("X-Rate-Limit-Remaining", decision.remaining.to_string());
            ctx.stage_header("X-Rate-Limit-Reset", decision.reset_epoch_secs().to_string());

            if decision.allowed {
                return next.run(ctx).await;
            }

            warn!(
                request_id = %ctx.request_id(),
                client = %ctx.meta().client_identifier,
                "request rejected by rate limiter"
            );
            let retry_after = decision.retry_after_secs();
            ctx.respond(
                Response::error(
                    StatusCode::TooManyRequests,
                    "rate_limited",
                    format!("Too many requests, retry in {retry_after}s"),
                )
                .header("Retry-After", retry_after.to_string()),
            )
        })
    }
}
