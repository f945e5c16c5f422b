use std::{future::Future, pin::Pin};

use tracing::debug;

use super::{Middleware, Next};
use crate::{Response, StatusCode, config::ValidationConfig, context::Context};

/// Rejects malformed payloads before they reach the endpoint.
///
/// - a declared or actual body larger than the limit: `413`
/// - a `POST`/`PUT`/`PATCH` body that is not declared as JSON: `415`
/// - a JSON body that does not parse: `400`
///
/// Requests without a body pass untouched.
pub struct ValidationMiddleware {
    max_body_bytes: usize,
}

impl ValidationMiddleware {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            max_body_bytes: config.max_body_bytes,
        }
    }
}

impl Middleware for ValidationMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let max_body_bytes = self.max_body_bytes;
        Box::pin(async move {
            match check(&ctx, max_body_bytes) {
                Ok(()) => next.run(ctx).await,
                Err(rejection) => {
                    debug!(request_id = %ctx.request_id(), status = rejection.status().as_u16(), "request failed validation");
                    ctx.respond(rejection)
                }
            }
        })
    }
}

fn check(ctx: &Context, max_body_bytes: usize) -> Result<(), Response> {
    let request = ctx.request();
    let declared = request.content_length().unwrap_or(0);
    if declared > max_body_bytes || request.body().len() > max_body_bytes {
        return Err(Response::error(
            StatusCode::PayloadTooLarge,
            "payload_too_large",
            format!("Request body exceeds {max_body_bytes} bytes"),
        ));
    }

    if !request.method().is_mutating() || request.body().is_empty() {
        return Ok(());
    }

    let is_json = request
        .headers()
        .get("Content-Type")
        .map(|ct| ct.split(';').next().unwrap_or("").trim())
        .is_some_and(|mime| mime.eq_ignore_ascii_case("application/json") || mime.ends_with("+json"));
    if !is_json {
        return Err(Response::error(
            StatusCode::UnsupportedMediaType,
            "unsupported_media_type",
            "Content-Type must be application/json",
        ));
    }

    if let Err(e) = serde_json::from_slice::<serde_json::Value>(request.body()) {
        return Err(Response::error(
            StatusCode::BadRequest,
            "invalid_json",
            format!("Malformed JSON body: {e}"),
        ));
    }
    Ok(())
}
