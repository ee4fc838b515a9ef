//! Claim controller - namespaced leasing of templated Kubernetes workloads
//!
//! Clients acquire a **claim** over HTTP; the controller materializes the
//! claim's rendered resources, waits for them to become ready, and returns a
//! handle with harvested return values. Claims carry a bounded TTL: expiry or
//! an explicit release cascade-deletes everything the claim created. An
//! optional warm pool keeps pre-provisioned claims ready so acquire latency
//! is dominated by hand-off rather than resource readiness.
//!
//! # Modules
//!
//! - [`claim`] - Claim persistence model: one labeled/annotated ConfigMap per lease
//! - [`template`] - Pure renderer from (template, values, id) to resource documents
//! - [`platform`] - Typed CRUD over the orchestrator (claims + dynamic resources)
//! - [`controller`] - Reconciliation: materialization, readiness, expiry sweeps
//! - [`api`] - HTTP API: acquire/renew/release plus the warm-pool allocator
//! - [`values`] - Values providers (static file, watched ConfigMap)
//! - [`metrics`] - Prometheus collectors for the claim lifecycle
//! - [`config`] - CLI/env/file configuration resolution
//! - [`retry`] - Conflict retry for optimistic-concurrency writes
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod api;
pub mod claim;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod platform;
pub mod retry;
pub mod template;
pub mod values;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
