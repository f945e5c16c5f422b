use std::{future::Future, pin::Pin, sync::Arc};

use serde_json::json;
use tracing::{debug, warn};

use super::{Middleware, Next};
use crate::{Response, StatusCode, context::Context, version::VersionNegotiator};

/// Resolves the API version of each request.
///
/// The negotiated version is stored in [`RequestMeta`](crate::context::RequestMeta)
/// for later stages and announced on the response, together with deprecation
/// notices. A request explicitly asking for an unknown or retired version is
/// answered `400` with the list of versions that can be served.
pub struct VersioningMiddleware {
    negotiator: Arc<VersionNegotiator>,
}

impl VersioningMiddleware {
    pub fn new(negotiator: Arc<VersionNegotiator>) -> Self {
        Self { negotiator }
    }
}

impl Middleware for VersioningMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let negotiator = Arc::clone(&self.negotiator);
        Box::pin(async move {
            let version = match negotiator.requested_version(ctx.request().headers()) {
                Some(requested) if !negotiator.is_version_supported(&requested) => {
                    warn!(
                        request_id = %ctx.request_id(),
                        version = %requested,
                        "unsupported API version requested"
                    );
                    let body = json!({
                        "error": {
                            "code": "unsupported_version",
                            "message": format!("API version {requested} is not supported"),
                        },
                        "supported_versions": negotiator.supported_versions(),
                    });
                    return ctx.respond(Response::json(StatusCode::BadRequest, &body));
                }
                Some(requested) => requested,
                None => negotiator.current_version(),
            };

            debug!(request_id = %ctx.request_id(), version = %version, "API version negotiated");
            for (name, value) in negotiator.create_version_headers(&version).iter() {
                ctx.stage_header(name, value);
            }
            ctx.meta_mut().negotiated_version = Some(version);
            next.run(ctx).await
        })
    }
}
