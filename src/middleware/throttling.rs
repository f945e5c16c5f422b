use std::{future::Future, pin::Pin, sync::Arc};

use super::{Middleware, Next};
use crate::{Request, Response, context::Context, throttle::Throttler};

/// Header a caller may use to move its request up a throttle queue.
pub const PRIORITY_HEADER: &str = "X-Priority";

/// Runs the rest of the pipeline inside the throttle queue matching the
/// request path, so at most the configured number of requests per pattern
/// are being handled at once.
pub struct ThrottleMiddleware {
    throttler: Arc<Throttler>,
}

impl ThrottleMiddleware {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        Self { throttler }
    }
}

impl Middleware for ThrottleMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let throttler = Arc::clone(&self.throttler);
        Box::pin(async move {
            let path = ctx.request().path().to_owned();
            let priority = request_priority(ctx.request());
            throttler
                .throttle_with_priority(&path, next.run(ctx), priority)
                .await
        })
    }
}

/// `X-Priority` as an integer; absent or malformed values mean `0`.
fn request_priority(request: &Request) -> i32 {
    request
        .headers()
        .get(PRIORITY_HEADER)
        .and_then(|p| p.trim().parse::<i32>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::middleware::{Feature, Pipeline, endpoint};
    use crate::{Method, StatusCode};

    #[test]
    fn parses_priority_header() {
        let with = |value: &str| Request::new(Method::Get, "/").with_header(PRIORITY_HEADER, value);
        assert_eq!(request_priority(&with("7")), 7);
        assert_eq!(request_priority(&with(" -2 ")), -2);
        assert_eq!(request_priority(&with("urgent")), 0);
        assert_eq!(request_priority(&Request::new(Method::Get, "/")), 0);
    }

    #[tokio::test]
    async fn queued_requests_run_by_priority_header() {
        let throttler = Arc::new(Throttler::new(1, Duration::ZERO));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline = {
            let order = Arc::clone(&order);
            Pipeline::new(endpoint(move |ctx: Context| {
                order.lock().push(ctx.request().path().to_owned());
                async { Response::new(StatusCode::Ok) }
            }))
        };
        pipeline.enable_feature(Feature::Throttling(Arc::clone(&throttler)));
        let pipeline = Arc::new(pipeline);

        let held = throttler.acquire("/busy", 0).await;
        let mut handles = Vec::new();
        for (path, priority) in [("/low", "1"), ("/top", "9"), ("/mid", " 3 "), ("/none", "x")] {
            let pipeline = Arc::clone(&pipeline);
            let request = Request::new(Method::Get, path).with_header(PRIORITY_HEADER, priority);
            handles.push(tokio::spawn(async move { pipeline.handle(request).await }));
            let expected = handles.len();
            while throttler.stats("*").unwrap().queued < expected {
                tokio::task::yield_now().await;
            }
        }

        drop(held);
        for handle in handles {
            assert_eq!(handle.await.unwrap().status(), StatusCode::Ok);
        }
        assert_eq!(*order.lock(), ["/top", "/mid", "/low", "/none"]);
    }

    #[tokio::test(start_paused = true)]
    async fn limits_concurrent_requests_per_pattern() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let throttler = Throttler::new(10, Duration::ZERO);
        throttler.configure("/api/upload*", 2, Duration::ZERO);

        let mut pipeline = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            Pipeline::new(endpoint(move |_ctx: Context| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Response::new(StatusCode::Created)
                }
            }))
        };
        pipeline.enable_feature(Feature::Throttling(Arc::new(throttler)));

        let responses = futures::future::join_all(
            (0..5).map(|i| pipeline.handle(Request::new(Method::Post, &format!("/api/upload/{i}")))),
        )
        .await;

        assert!(responses.iter().all(|r| r.status() == StatusCode::Created));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
