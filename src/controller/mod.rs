//! Controller implementation for claim ConfigMaps.
//!
//! The reconciler follows the Kubernetes controller pattern: observe the
//! claim, drive its rendered resources toward existence, evaluate readiness,
//! write status, and sweep expired leases.

mod claim;

pub use claim::{error_policy, next_check, reconcile, Context};
