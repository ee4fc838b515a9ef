//! Label, annotation, and data-key constants for the persisted claim encoding.

/// Label marking objects owned by this controller
pub const MANAGED_BY_LABEL_KEY: &str = "claim-controller.io/managed-by";
/// Value of the managed-by label
pub const MANAGED_BY_LABEL_VALUE: &str = "claim-controller";
/// Label carrying the owning claim's name
pub const CLAIM_LABEL_KEY: &str = "claim-controller.io/claim";
/// Label carrying the claim id
pub const CLAIM_ID_LABEL_KEY: &str = "claim-controller.io/claim.id";

/// Annotation carrying the RFC3339 expiry instant
pub const EXPIRES_AT_ANNOTATION_KEY: &str = "claim-controller.io/expires-at";
/// Annotation carrying the RFC3339 hand-out instant
pub const CLAIMED_AT_ANNOTATION_KEY: &str = "claim-controller.io/claimed-at";
/// Annotation naming the creator
pub const CREATED_BY_ANNOTATION_KEY: &str = "claim-controller.io/created-by";
/// Value of the created-by annotation
pub const CREATED_BY_ANNOTATION_VALUE: &str = "claim-controller";
/// Annotation flagging a warm-pool claim not yet handed out
pub const PRE_PROVISIONED_ANNOTATION_KEY: &str = "claim-controller.io/pre-provisioned";

/// Annotation deferring a rendered resource until hand-out.
/// The double-n spelling is what live data carries; see also
/// [`LAZY_PROVISIONING_ANNOTATION_KEY_ALT`].
pub const LAZY_PROVISIONING_ANNOTATION_KEY: &str = "claim.controller/lazy-provisionning";
/// Single-n spelling of the lazy-provisioning annotation, accepted equally.
pub const LAZY_PROVISIONING_ANNOTATION_KEY_ALT: &str = "claim.controller/lazy-provisioning";

/// Metadata directive harvested into the acquire response's return values
pub const RETURN_VALUES_DIRECTIVE_KEY: &str = "claim.controller/return";

/// Data key holding the frozen rendered-resources JSON array
pub const RENDERED_RESOURCES_DATA_KEY: &str = "renderedResources";
/// Data key holding the harvested return-values JSON object
pub const RETURN_VALUES_DATA_KEY: &str = "returnValues";
/// Data key holding the observable claim state
pub const CLAIM_STATUS_DATA_KEY: &str = "claimStatus";
/// Data key holding the human-readable status detail
pub const CLAIM_STATUS_MESSAGE_DATA_KEY: &str = "claimStatusMessage";
/// Data key holding the per-resource readiness JSON array
pub const CLAIM_RESOURCES_STATUS_DATA_KEY: &str = "claimResourcesStatus";
