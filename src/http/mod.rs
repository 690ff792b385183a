//! HTTP request-lifecycle layer.
//!
//! This module implements the per-request and per-connection machinery of
//! the gateway: HTTP/1.1 parsing, the reply terminal-state machine, and the
//! bounded two-tier admission control that decides whether a postponed
//! request runs now, waits, or is rejected.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`status`**: Response status codes with their fixed reason phrases
//! - **`request`**: HTTP request representation and query parameter access
//! - **`parser`**: Parses incoming HTTP requests from byte buffers
//! - **`reply`**: Per-request output channel and terminal-state machine
//! - **`connection`**: Per-socket admission control over pending/backlog sets
//! - **`wire`**: Outbound frame queue between replies and the socket writer
//! - **`wake`**: Cross-thread wake-up and data-ready signalling primitives
//! - **`writer`**: Serializes response heads and body chunks
//!
//! # Reply State Machine
//!
//! Each request's reply advances through a one-way state machine:
//!
//! ```text
//!        ┌──────────────┐
//!        │ Initialized  │ ← Headers and status still changeable
//!        └──────┬───────┘
//!               │ First send queues the response head
//!               ▼
//!        ┌──────────────┐
//!        │   Started    │ ← Body streaming; output gate closed while a
//!        └──────┬───────┘   write is in flight
//!               │ Last send, error, cancel or connection loss
//!               ▼
//!        ┌──────────────┐
//!        │   Finished   │ ← Terminal; no further output of any kind
//!        └──────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use portcullis::config::Config;
//! use portcullis::server::daemon::Daemon;
//! use portcullis::server::router::Router;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let router = Router::new().add("/hello", |_req: &mut _, reply: &mut _| {
//!         reply.send_ok(b"hi")?;
//!         Ok(None)
//!     });
//!
//!     let daemon = Daemon::bind(Config::default(), Arc::new(router)).await?;
//!     daemon.run(|_| {}).await
//! }
//! ```

pub mod connection;
pub mod parser;
pub mod reply;
pub mod request;
pub mod status;
pub mod wake;
pub mod wire;
pub mod writer;
