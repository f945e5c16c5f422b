use std::{future::Future, io::Write, pin::Pin};

use flate2::{Compression, write::GzEncoder};
use tracing::warn;

use super::{Middleware, Next};
use crate::{Response, StatusCode, config::CompressionConfig, context::Context};

/// Gzips response bodies for clients that accept it.
///
/// Bodies smaller than the configured threshold, bodies that already carry a
/// `Content-Encoding`, and bodiless statuses are sent as they are.
pub struct CompressionMiddleware {
    enabled: bool,
    min_size_bytes: usize,
}

impl CompressionMiddleware {
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_size_bytes: config.min_size_bytes,
        }
    }
}

impl Middleware for CompressionMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let enabled = self.enabled;
        let min_size_bytes = self.min_size_bytes;
        Box::pin(async move {
            let wants_gzip = ctx
                .request()
                .headers()
                .get("Accept-Encoding")
                .is_some_and(accepts_gzip);

            let mut response = next.run(ctx).await;
            if !enabled
                || !wants_gzip
                || response.body_ref().len() < min_size_bytes
                || response.headers().contains("Content-Encoding")
                || matches!(response.status(), StatusCode::NoContent | StatusCode::NotModified)
            {
                return response;
            }

            match gzip(response.body_ref()) {
                Ok(compressed) => {
                    response.set_body(compressed);
                    response.headers_mut().set("Content-Encoding", "gzip");
                    response.headers_mut().insert("Vary", "Accept-Encoding");
                }
                Err(e) => warn!(error = %e, "gzip failed, sending identity body"),
            }
            response
        })
    }
}

// `gzip` or `*` listed without `q=0`.
fn accepts_gzip(accept_encoding: &str) -> bool {
    accept_encoding.split(',').any(|item| {
        let mut parts = item.split(';').map(str::trim);
        let coding = parts.next().unwrap_or("");
        let refused = parts.any(|param| {
            param
                .strip_prefix("q=")
                .and_then(|q| q.parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        });
        !refused && (coding.eq_ignore_ascii_case("gzip") || coding == "*")
    })
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::middleware::{Feature, Pipeline, endpoint};
    use crate::{Method, Request};

    fn pipeline(body: &'static str) -> Pipeline {
        let mut pipeline = Pipeline::new(endpoint(move |_ctx: Context| async move {
            Response::new(StatusCode::Ok).body(body)
        }));
        pipeline.enable_feature(Feature::Compression(CompressionConfig {
            enabled: true,
            min_size_bytes: 16,
        }));
        pipeline
    }

    fn get(accept_encoding: &str) -> Request {
        Request::new(Method::Get, "/").with_header("Accept-Encoding", accept_encoding)
    }

    #[tokio::test]
    async fn compresses_large_bodies() {
        let body = "all the news that fits, and then some more news";
        let response = pipeline(body).handle(get("br, gzip;q=0.8")).await;
        assert_eq!(response.headers().get("Content-Encoding"), Some("gzip"));

        let mut decoded = String::new();
        GzDecoder::new(response.body_ref())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn leaves_small_or_refused_bodies_alone() {
        let small = pipeline("tiny").handle(get("gzip")).await;
        assert!(!small.headers().contains("Content-Encoding"));

        let refused = pipeline("all the news that fits, and then some")
            .handle(get("gzip;q=0"))
            .await;
        assert!(!refused.headers().contains("Content-Encoding"));
    }

    #[test]
    fn parses_accept_encoding() {
        assert!(accepts_gzip("deflate, GZIP"));
        assert!(accepts_gzip("*"));
        assert!(!accepts_gzip("identity"));
        assert!(!accepts_gzip("gzip; q=0.0"));
    }
}
