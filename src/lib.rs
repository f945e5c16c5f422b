//! # apigate
//!
//! An adaptive API gateway layer: a response cache, in-flight request
//! deduplication, sliding-window rate limiting, per-endpoint concurrency
//! throttling and API version negotiation, exposed through an outbound
//! [`GatewayClient`](client::GatewayClient) and an inbound middleware
//! [`Pipeline`](middleware::Pipeline).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use apigate::config::GatewayConfig;
//! use apigate::context::Context;
//! use apigate::gateway::Gateway;
//! use apigate::middleware::endpoint;
//! use apigate::server::Server;
//! use apigate::http::{Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut gateway = Gateway::from_config(GatewayConfig::default())?;
//!     gateway.spawn_maintenance();
//!
//!     let pipeline = gateway.pipeline(endpoint(|_ctx: Context| async {
//!         Response::new(StatusCode::Ok).body("Hello, World!")
//!     }));
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.serve(Arc::new(pipeline)).await?;
//!     Ok(())
//! }
//! ```

// ── Wire types and request plumbing ───────────────────────────────────────────
pub mod context;
pub mod http;
pub mod middleware;
pub mod security;
pub mod server;

// ── Shared gateway components ─────────────────────────────────────────────────
pub mod background;
pub mod cache;
pub mod dedup;
pub mod limiter;
pub mod monitor;
pub mod pattern;
pub mod throttle;
pub mod version;

// ── Outbound client, configuration and assembly ──────────────────────────────
pub mod client;
pub mod config;
pub mod gateway;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use client::{ApiResponse, GatewayClient, GatewayError, RequestOptions};
pub use gateway::Gateway;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
