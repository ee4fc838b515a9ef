//! Claim persistence model (C3).
//!
//! A claim is stored as a single labeled/annotated ConfigMap in the managed
//! namespace. This module owns the encoding: [`Claim`] round-trips the typed
//! model through the ConfigMap form, and the free functions give CAS writers
//! tolerant in-place access to the live object without a full decode.

mod labels;
mod store;

pub use labels::*;
pub use store::{
    claim_name, claimed_at, creation_timestamp, expires_at, format_timestamp, is_managed,
    is_pre_provisioned, new_claim_id, parse_timestamp, rendered_resources, resource_owner_reference,
    set_claimed_at, set_expires_at, set_pre_provisioned, status, status_message, Claim, ClaimState,
    ResourceStatus,
};
