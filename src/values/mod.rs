//! Values providers feeding the template renderer.
//!
//! A provider supplies the YAML values document the renderer combines with
//! the resource template, and optionally an owner reference that makes every
//! created claim a dependent of the values source (deleting the source then
//! cascades through the claims to their resources).

mod configmap;
mod file;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::Error;

pub use configmap::ConfigMapValues;
pub use file::FileValues;

/// Source of the values document.
#[async_trait]
pub trait ValuesProvider: Send + Sync {
    /// Start background work (watchers); idempotent for static providers.
    async fn start(&self) -> Result<(), Error>;

    /// The current values document. Returned by copy so callers never alias
    /// the provider's cache.
    async fn values(&self) -> Result<Vec<u8>, Error>;

    /// Owner reference for created claims, when the source is an object.
    async fn owner_reference(&self) -> Option<OwnerReference>;

    /// Human-readable description of the source, for logs.
    fn description(&self) -> String;
}
