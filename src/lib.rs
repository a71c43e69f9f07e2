//! Warmstart - lazy backend bootstrap for serverless invocations
//!
//! This library adapts a long-running HTTP application to a per-invocation
//! execution model:
//! - Bootstraps the backend on the first invocation, exactly once even when
//!   invocations overlap
//! - Binds it on a free loopback port and caches its address for reuse
//! - Forwards each invocation with its fully buffered body
//! - Optionally tears the backend down after every invocation
//! - Supports a pre-started backend address for local development

pub mod address;
pub mod backend;
pub mod cache;
pub mod config;
pub mod echo;
pub mod error;
pub mod forward;
pub mod handler;
pub mod probe;
pub mod server;
pub mod tls;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
