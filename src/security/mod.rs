//! Security middleware for the gateway pipeline.

mod middleware;

pub use middleware::CorsMiddleware;
