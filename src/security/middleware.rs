//! Cross-Origin Resource Sharing for the gateway pipeline.
//!
//! [`CorsMiddleware`] validates the `Origin` header against the configured
//! allow-list, answers preflight (`OPTIONS`) requests itself, and decorates
//! actual responses with `Access-Control-*` headers.

use std::pin::Pin;

use crate::{
    Method, Response, StatusCode,
    config::CorsConfig,
    context::Context,
    middleware::{Middleware, Next},
};

/// CORS middleware: validates the `Origin` header, handles preflight requests,
/// and injects `Access-Control-*` headers on actual responses.
///
/// Usually built from configuration with [`CorsMiddleware::from_config`];
/// the builder methods [`allow_origin`](Self::allow_origin),
/// [`allow_method`](Self::allow_method) and [`allow_header`](Self::allow_header)
/// extend the lists further.
///
/// # Behavior
///
/// - If no `Origin` header is present the request passes through unmodified.
/// - If the origin is not in the allow-list the request passes through without
///   CORS headers, so the browser blocks the response.
/// - `OPTIONS` preflight requests are short-circuited with `204 No Content` and the
///   appropriate `Access-Control-*` headers; the endpoint is **not** called.
/// - For all other requests the endpoint runs normally and the CORS headers are
///   appended to the response, along with `Access-Control-Expose-Headers` so
///   browser code can read the gateway's own headers (`X-Request-ID`,
///   `X-Rate-Limit-*`, `API-Version`, ...).
/// - When the wildcard origin `"*"` is used, a `Vary: Origin` header is **not** added;
///   for specific origins it is added to ensure correct cache behavior.
///
/// # Examples
///
/// ```rust
/// use apigate::config::CorsConfig;
/// use apigate::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::from_config(&CorsConfig {
///     allowed_origins: vec!["https://news.example.com".to_owned()],
///     ..CorsConfig::default()
/// })
/// .allow_method("PATCH");
/// ```
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
}

/// Gateway headers browsers may read from cross-origin responses.
const EXPOSED_HEADERS: &str = "X-Request-ID, X-Rate-Limit-Limit, X-Rate-Limit-Remaining, \
     X-Rate-Limit-Reset, API-Version, X-API-Version, X-Response-Time, ETag";

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::from_config(&CorsConfig::default())
    }
}

impl CorsMiddleware {
    /// Creates the middleware from the `cors` section of the gateway config.
    pub fn from_config(config: &CorsConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            allowed_methods: config.allowed_methods.clone(),
            allowed_headers: config.allowed_headers.clone(),
        }
    }

    /// Adds an allowed origin.
    ///
    /// Pass `"*"` to permit all origins. When the allow-list contains `"*"`,
    /// every `Origin` value is accepted and the response carries
    /// `Access-Control-Allow-Origin: *`.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Adds an allowed HTTP method, sent verbatim in
    /// `Access-Control-Allow-Methods`.
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    /// Adds an allowed request header, sent verbatim in
    /// `Access-Control-Allow-Headers`.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    /// The `Access-Control-Allow-Origin` value for `origin`, or `None` when
    /// the origin is not allowed.
    fn allow_origin_for(&self, origin: &str) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else if self
            .allowed_origins
            .iter()
            .any(|o| o.trim_end_matches('/').eq_ignore_ascii_case(origin))
        {
            Some(origin.to_owned())
        } else {
            None
        }
    }
}

impl Middleware for CorsMiddleware {
    /// Process a request through the CORS policy and return the appropriate response.
    ///
    /// # Returns
    ///
    /// A [`Response`] with CORS headers applied, or the unmodified downstream
    /// response when the origin check does not pass.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let allow_origin = ctx
            .request()
            .headers()
            .get("origin")
            .and_then(|origin| self.allow_origin_for(origin));
        let methods = self.allowed_methods.join(", ");
        let headers = self.allowed_headers.join(", ");

        Box::pin(async move {
            let Some(allow_origin) = allow_origin else {
                return next.run(ctx).await;
            };
            let is_wildcard = allow_origin == "*";

            if ctx.request().method() == &Method::Options {
                let mut resp = Response::new(StatusCode::NoContent)
                    .header("Access-Control-Allow-Origin", &allow_origin)
                    .header("Access-Control-Allow-Methods", &methods)
                    .header("Access-Control-Allow-Headers", &headers)
                    .header("Access-Control-Max-Age", "3600");
                if !is_wildcard {
                    resp.add_header("Vary", "Origin");
                }
                return ctx.respond(resp);
            }

            let mut resp = next.run(ctx).await;
            resp.add_header("Access-Control-Allow-Origin", &allow_origin);
            resp.add_header("Access-Control-Allow-Methods", &methods);
            resp.add_header("Access-Control-Allow-Headers", &headers);
            resp.add_header("Access-Control-Expose-Headers", EXPOSED_HEADERS);
            if !is_wildcard {
                resp.add_header("Vary", "Origin");
            }
            resp
        })
    }
}
