//! Shepherd - a single-host agent hosting many small applications
//!
//! The agent is the only process a control plane needs to talk to on a
//! host:
//! - Keeps a durable registry of hosted applications in one JSON file
//! - Supervises application processes with a startup grace window
//! - Proxies HTTP and TLS traffic to applications by Host header and SNI
//! - Serves a shared-secret management API for lifecycle and diagnostics
//! - Installs and tracks per-application language runtime versions

pub mod api;
pub mod config;
pub mod error;
pub mod info;
pub mod package;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod runtime;
pub mod supervisor;
