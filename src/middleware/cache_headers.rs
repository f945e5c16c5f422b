use std::{future::Future, pin::Pin, time::Duration};

use sha2::{Digest, Sha256};

use super::{Middleware, Next};
use crate::{Method, Response, StatusCode, context::Context};

/// `Cache-Control` values applied by [`CacheHeadersMiddleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHeaderPolicy {
    /// `max-age` advertised for successful reads.
    pub max_age: Duration,
    /// Whether shared caches may store reads (`public`) or only the client (`private`).
    pub public: bool,
    /// Emit weak (`W/`) tags. Set when a later stage may re-encode the body,
    /// since a strong tag must not cover both the gzip and identity bytes.
    pub weak_etags: bool,
}

impl Default for CacheHeaderPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(300),
            public: true,
            weak_etags: false,
        }
    }
}

impl CacheHeaderPolicy {
    fn read_directive(&self) -> String {
        let scope = if self.public { "public" } else { "private" };
        format!("{scope}, max-age={}", self.max_age.as_secs())
    }
}

/// Adds HTTP caching headers.
///
/// Successful `GET`/`HEAD` responses get the policy's `Cache-Control` and an
/// `ETag` derived from the body, weak if the policy says so; a request whose `If-None-Match`
/// already names that tag is answered `304 Not Modified` without a body.
/// Other methods get `Cache-Control: no-store`. Headers set by the endpoint
/// itself are left alone.
pub struct CacheHeadersMiddleware {
    policy: CacheHeaderPolicy,
}

impl CacheHeadersMiddleware {
    pub fn new(policy: CacheHeaderPolicy) -> Self {
        Self { policy }
    }
}

impl Middleware for CacheHeadersMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let directive = self.policy.read_directive();
        let weak = self.policy.weak_etags;
        Box::pin(async move {
            let cacheable = matches!(ctx.request().method(), Method::Get | Method::Head);
            let if_none_match = ctx
                .request()
                .headers()
                .get("If-None-Match")
                .map(str::to_owned);

            let mut response = next.run(ctx).await;

            if !cacheable {
                if !response.headers().contains("Cache-Control") {
                    response.headers_mut().set("Cache-Control", "no-store");
                }
                return response;
            }
            if response.status() != StatusCode::Ok {
                return response;
            }

            if !response.headers().contains("Cache-Control") {
                response.headers_mut().set("Cache-Control", directive);
            }
            let etag = match response.headers().get("ETag") {
                Some(existing) => existing.to_owned(),
                None => {
                    let etag = if weak {
                        format!("W/{}", body_etag(response.body_ref()))
                    } else {
                        body_etag(response.body_ref())
                    };
                    response.headers_mut().set("ETag", etag.as_str());
                    etag
                }
            };

            if if_none_match.is_some_and(|tags| etag_matches(&tags, &etag)) {
                response.set_status(StatusCode::NotModified);
                response.set_body(Vec::new());
                response.headers_mut().remove("Content-Type");
            }
            response
        })
    }
}

/// Strong entity tag: quoted, first 128 bits of the body's SHA-256 in hex.
pub(crate) fn body_etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{}\"", hex::encode(&digest[..16]))
}

fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let bare = etag.trim_start_matches("W/");
    if_none_match.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.trim_start_matches("W/") == bare
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Feature, Pipeline, endpoint};
    use crate::Request;

    fn pipeline() -> Pipeline {
        let mut pipeline = Pipeline::new(endpoint(|_ctx: Context| async {
            Response::new(StatusCode::Ok)
                .header("Content-Type", "application/json")
                .body(r#"{"id":42}"#)
        }));
        pipeline.enable_feature(Feature::CacheHeaders(CacheHeaderPolicy::default()));
        pipeline
    }

    #[tokio::test]
    async fn reads_get_cache_control_and_etag() {
        let response = pipeline().handle(Request::new(Method::Get, "/news/42")).await;
        assert_eq!(
            response.headers().get("Cache-Control"),
            Some("public, max-age=300")
        );
        let etag = response.headers().get("ETag").unwrap();
        assert_eq!(etag, body_etag(br#"{"id":42}"#));
        assert_eq!(etag.len(), 34);
    }

    #[tokio::test]
    async fn matching_if_none_match_yields_304() {
        let etag = body_etag(br#"{"id":42}"#);
        let request = Request::new(Method::Get, "/news/42")
            .with_header("If-None-Match", format!("\"other\", {etag}"));
        let response = pipeline().handle(request).await;
        assert_eq!(response.status(), StatusCode::NotModified);
        assert!(response.body_ref().is_empty());
        assert_eq!(response.headers().get("ETag"), Some(etag.as_str()));
    }

    #[tokio::test]
    async fn writes_are_not_stored() {
        let response = pipeline().handle(Request::new(Method::Post, "/news")).await;
        assert_eq!(response.headers().get("Cache-Control"), Some("no-store"));
        assert!(!response.headers().contains("ETag"));
    }

    #[tokio::test]
    async fn weak_policy_tags_and_matches_weakly() {
        let mut pipeline = Pipeline::new(endpoint(|_ctx: Context| async {
            Response::new(StatusCode::Ok).body("hello")
        }));
        pipeline.enable_feature(Feature::CacheHeaders(CacheHeaderPolicy {
            weak_etags: true,
            ..CacheHeaderPolicy::default()
        }));

        let response = pipeline.handle(Request::new(Method::Get, "/greeting")).await;
        let etag = response.headers().get("ETag").unwrap().to_owned();
        assert_eq!(etag, format!("W/{}", body_etag(b"hello")));

        let revalidate = Request::new(Method::Get, "/greeting").with_header("If-None-Match", etag);
        assert_eq!(pipeline.handle(revalidate).await.status(), StatusCode::NotModified);
    }

    #[test]
    fn weak_and_wildcard_tags_match() {
        assert!(etag_matches("W/\"abc\"", "\"abc\""));
        assert!(etag_matches("*", "\"abc\""));
        assert!(!etag_matches("\"abd\"", "\"abc\""));
    }
}
