//! Portcullis - Asynchronous HTTP Admission Gateway
//!
//! Core library for the request lifecycle, per-connection admission
//! control and the multi-worker daemon.

pub mod config;
pub mod handler;
pub mod http;
pub mod server;
