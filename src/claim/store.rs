//! Typed claim model and ConfigMap codec.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::labels::*;
use crate::Error;

/// Observable claim state, written by the reconciler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimState {
    /// Resources are being materialized or are not yet ready
    #[default]
    Pending,
    /// Every required resource passes readiness
    Ready,
    /// A resource failed readiness terminally
    Failed,
}

impl ClaimState {
    /// Stable string form persisted in the claim data
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    /// Parse the persisted form; unknown values read as pending.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-resource readiness record persisted under `claimResourcesStatus`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Resource kind
    pub kind: String,
    /// Resource name
    pub name: String,
    /// Namespace, for namespaced resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Whether the readiness predicate passed
    pub ready: bool,
    /// Human-readable readiness detail
    pub message: String,
}

/// The authoritative lease record.
#[derive(Clone, Debug, PartialEq)]
pub struct Claim {
    /// Short opaque token, unique within the namespace
    pub id: String,
    /// Namespace the claim and its namespaced resources live in
    pub namespace: String,
    /// Observable state
    pub state: ClaimState,
    /// Human-readable status detail
    pub message: String,
    /// Per-resource readiness records
    pub resource_statuses: Vec<ResourceStatus>,
    /// Hand-out instant; absent while the claim sits in the warm pool
    pub claimed_at: Option<DateTime<Utc>>,
    /// Current expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the claim is in the warm pool and not yet handed out
    pub pre_provisioned: bool,
    /// Rendered resource documents, frozen at creation
    pub rendered_resources: Vec<serde_json::Value>,
    /// Return values harvested from the rendered resources
    pub return_values: BTreeMap<String, String>,
    /// Back-reference to the values source, for cascade deletion
    pub owner_reference: Option<OwnerReference>,
}

impl Claim {
    /// Build a fresh pending claim.
    pub fn new(
        namespace: impl Into<String>,
        id: impl Into<String>,
        rendered_resources: Vec<serde_json::Value>,
        return_values: BTreeMap<String, String>,
        expires_at: DateTime<Utc>,
        pre_provisioned: bool,
    ) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            state: ClaimState::Pending,
            message: "waiting for resources to be created".to_string(),
            resource_statuses: Vec::new(),
            claimed_at: None,
            expires_at: Some(expires_at),
            pre_provisioned,
            rendered_resources,
            return_values,
            owner_reference: None,
        }
    }

    /// Stable object name, `claim-<id>`.
    pub fn name(&self) -> String {
        claim_name(&self.id)
    }

    /// Serialize into the persisted ConfigMap form.
    pub fn encode(&self) -> Result<ConfigMap, Error> {
        let name = self.name();

        let mut object_labels = BTreeMap::new();
        object_labels.insert(
            MANAGED_BY_LABEL_KEY.to_string(),
            MANAGED_BY_LABEL_VALUE.to_string(),
        );
        object_labels.insert(CLAIM_LABEL_KEY.to_string(), name.clone());
        object_labels.insert(CLAIM_ID_LABEL_KEY.to_string(), self.id.clone());

        let mut annotations = BTreeMap::new();
        if let Some(expires_at) = self.expires_at {
            annotations.insert(
                EXPIRES_AT_ANNOTATION_KEY.to_string(),
                format_timestamp(expires_at),
            );
        }
        annotations.insert(
            CREATED_BY_ANNOTATION_KEY.to_string(),
            CREATED_BY_ANNOTATION_VALUE.to_string(),
        );
        annotations.insert(
            PRE_PROVISIONED_ANNOTATION_KEY.to_string(),
            self.pre_provisioned.to_string(),
        );
        if let Some(claimed_at) = self.claimed_at {
            annotations.insert(
                CLAIMED_AT_ANNOTATION_KEY.to_string(),
                format_timestamp(claimed_at),
            );
        }

        let rendered = serde_json::to_string(&self.rendered_resources)
            .map_err(|e| Error::serialization(format!("encode rendered resources: {e}")))?;
        let return_values = serde_json::to_string(&self.return_values)
            .map_err(|e| Error::serialization(format!("encode return values: {e}")))?;
        let resources_status = serde_json::to_string(&self.resource_statuses)
            .map_err(|e| Error::serialization(format!("encode resource statuses: {e}")))?;

        let mut data = BTreeMap::new();
        data.insert(RENDERED_RESOURCES_DATA_KEY.to_string(), rendered);
        data.insert(RETURN_VALUES_DATA_KEY.to_string(), return_values);
        data.insert(
            CLAIM_STATUS_DATA_KEY.to_string(),
            self.state.as_str().to_string(),
        );
        data.insert(
            CLAIM_STATUS_MESSAGE_DATA_KEY.to_string(),
            self.message.clone(),
        );
        data.insert(CLAIM_RESOURCES_STATUS_DATA_KEY.to_string(), resources_status);

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.clone()),
                labels: Some(object_labels),
                annotations: Some(annotations),
                owner_references: self.owner_reference.clone().map(|r| vec![r]),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..ConfigMap::default()
        })
    }

    /// Parse the persisted ConfigMap form back into the typed model.
    pub fn decode(cm: &ConfigMap) -> Result<Self, Error> {
        let id = cm
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CLAIM_ID_LABEL_KEY))
            .cloned()
            .ok_or_else(|| Error::serialization("claim missing id label"))?;

        let data = cm.data.as_ref();
        let rendered_resources = match data.and_then(|d| d.get(RENDERED_RESOURCES_DATA_KEY)) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
                .map_err(|e| Error::serialization(format!("decode rendered resources: {e}")))?,
            _ => Vec::new(),
        };
        let return_values = match data.and_then(|d| d.get(RETURN_VALUES_DATA_KEY)) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
                .map_err(|e| Error::serialization(format!("decode return values: {e}")))?,
            _ => BTreeMap::new(),
        };
        let resource_statuses = match data.and_then(|d| d.get(CLAIM_RESOURCES_STATUS_DATA_KEY)) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
                .map_err(|e| Error::serialization(format!("decode resource statuses: {e}")))?,
            _ => Vec::new(),
        };

        Ok(Self {
            id,
            namespace: cm.metadata.namespace.clone().unwrap_or_default(),
            state: data
                .and_then(|d| d.get(CLAIM_STATUS_DATA_KEY))
                .map(|s| ClaimState::parse(s))
                .unwrap_or_default(),
            message: data
                .and_then(|d| d.get(CLAIM_STATUS_MESSAGE_DATA_KEY))
                .cloned()
                .unwrap_or_default(),
            resource_statuses,
            claimed_at: claimed_at(cm),
            expires_at: expires_at(cm),
            pre_provisioned: is_pre_provisioned(cm),
            rendered_resources,
            return_values,
            owner_reference: cm
                .metadata
                .owner_references
                .as_ref()
                .and_then(|refs| refs.first().cloned()),
        })
    }
}

/// Object name for a claim id.
pub fn claim_name(id: &str) -> String {
    format!("claim-{id}")
}

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 8;

/// Generate a fresh claim id: eight lower-case alphanumeric characters.
pub fn new_claim_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect()
}

/// RFC3339 UTC with second precision, the persisted timestamp form.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a persisted RFC3339 timestamp.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn annotation<'a>(cm: &'a ConfigMap, key: &str) -> Option<&'a str> {
    cm.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn set_annotation(cm: &mut ConfigMap, key: &str, value: String) {
    cm.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value);
}

/// Whether the object carries the managed-by marker.
pub fn is_managed(cm: &ConfigMap) -> bool {
    cm.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_BY_LABEL_KEY))
        .is_some_and(|v| v == MANAGED_BY_LABEL_VALUE)
}

/// Whether the claim sits in the warm pool, not yet handed out.
pub fn is_pre_provisioned(cm: &ConfigMap) -> bool {
    annotation(cm, PRE_PROVISIONED_ANNOTATION_KEY)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Flip the pre-provisioned flag in place.
pub fn set_pre_provisioned(cm: &mut ConfigMap, value: bool) {
    set_annotation(cm, PRE_PROVISIONED_ANNOTATION_KEY, value.to_string());
}

/// Parse the expiry annotation; garbage reads as absent.
pub fn expires_at(cm: &ConfigMap) -> Option<DateTime<Utc>> {
    annotation(cm, EXPIRES_AT_ANNOTATION_KEY).and_then(parse_timestamp)
}

/// Write the expiry annotation in place.
pub fn set_expires_at(cm: &mut ConfigMap, t: DateTime<Utc>) {
    set_annotation(cm, EXPIRES_AT_ANNOTATION_KEY, format_timestamp(t));
}

/// Parse the claimed-at annotation; garbage reads as absent.
pub fn claimed_at(cm: &ConfigMap) -> Option<DateTime<Utc>> {
    annotation(cm, CLAIMED_AT_ANNOTATION_KEY).and_then(parse_timestamp)
}

/// Write the claimed-at annotation in place.
pub fn set_claimed_at(cm: &mut ConfigMap, t: DateTime<Utc>) {
    set_annotation(cm, CLAIMED_AT_ANNOTATION_KEY, format_timestamp(t));
}

/// The object's creation timestamp.
pub fn creation_timestamp(cm: &ConfigMap) -> Option<DateTime<Utc>> {
    cm.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// The persisted claim state.
pub fn status(cm: &ConfigMap) -> ClaimState {
    cm.data
        .as_ref()
        .and_then(|d| d.get(CLAIM_STATUS_DATA_KEY))
        .map(|s| ClaimState::parse(s))
        .unwrap_or_default()
}

/// The persisted status message.
pub fn status_message(cm: &ConfigMap) -> String {
    cm.data
        .as_ref()
        .and_then(|d| d.get(CLAIM_STATUS_MESSAGE_DATA_KEY))
        .cloned()
        .unwrap_or_default()
}

/// Decode and validate the frozen rendered-resources array.
///
/// Every document must carry `apiVersion`, `kind`, and `metadata.name`;
/// an absent or empty array is an error (a claim without resources cannot
/// exist past creation).
pub fn rendered_resources(cm: &ConfigMap) -> Result<Vec<serde_json::Value>, Error> {
    let raw = cm
        .data
        .as_ref()
        .and_then(|d| d.get(RENDERED_RESOURCES_DATA_KEY))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::serialization("claim missing rendered resources"))?;

    let resources: Vec<serde_json::Value> = serde_json::from_str(raw)
        .map_err(|e| Error::serialization(format!("decode rendered resources from claim: {e}")))?;
    if resources.is_empty() {
        return Err(Error::serialization(
            "claim rendered resources must contain at least one resource",
        ));
    }

    for resource in &resources {
        if resource["apiVersion"].as_str().unwrap_or("").is_empty() {
            return Err(Error::serialization("rendered resource missing apiVersion"));
        }
        if resource["kind"].as_str().unwrap_or("").is_empty() {
            return Err(Error::serialization("rendered resource missing kind"));
        }
        if resource["metadata"]["name"].as_str().unwrap_or("").is_empty() {
            return Err(Error::serialization(
                "rendered resource missing metadata.name",
            ));
        }
    }

    Ok(resources)
}

/// Controller owner reference pointing at the claim, stamped onto every
/// materialized resource so cascade deletion follows the claim.
pub fn resource_owner_reference(cm: &ConfigMap) -> Option<OwnerReference> {
    let name = cm.metadata.name.clone()?;
    let uid = cm.metadata.uid.clone()?;
    Some(OwnerReference {
        api_version: "v1".to_string(),
        kind: "ConfigMap".to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_claim() -> Claim {
        let rendered = vec![
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "workload-ab12cd34"},
            }),
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "endpoint-ab12cd34"},
            }),
        ];
        let mut return_values = BTreeMap::new();
        return_values.insert("host".to_string(), "endpoint-ab12cd34".to_string());
        return_values.insert("port".to_string(), "8080".to_string());

        let mut claim = Claim::new(
            "default",
            "ab12cd34",
            rendered,
            return_values,
            Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap(),
            false,
        );
        claim.claimed_at = Some(Utc.with_ymd_and_hms(2026, 8, 2, 11, 50, 0).unwrap());
        claim.state = ClaimState::Ready;
        claim.message = "all resources ready".to_string();
        claim.resource_statuses = vec![ResourceStatus {
            kind: "Pod".to_string(),
            name: "workload-ab12cd34".to_string(),
            namespace: Some("default".to_string()),
            ready: true,
            message: "pod ready".to_string(),
        }];
        claim
    }

    #[test]
    fn encode_decode_round_trips() {
        let claim = sample_claim();
        let cm = claim.encode().unwrap();
        let decoded = Claim::decode(&cm).unwrap();
        assert_eq!(decoded, claim);
    }

    #[test]
    fn encode_writes_the_persisted_schema() {
        let cm = sample_claim().encode().unwrap();

        assert_eq!(cm.metadata.name.as_deref(), Some("claim-ab12cd34"));
        let labels = cm.metadata.labels.as_ref().unwrap();
        assert_eq!(
            labels.get(MANAGED_BY_LABEL_KEY).map(String::as_str),
            Some(MANAGED_BY_LABEL_VALUE)
        );
        assert_eq!(
            labels.get(CLAIM_LABEL_KEY).map(String::as_str),
            Some("claim-ab12cd34")
        );
        assert_eq!(
            labels.get(CLAIM_ID_LABEL_KEY).map(String::as_str),
            Some("ab12cd34")
        );

        let annotations = cm.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations
                .get(EXPIRES_AT_ANNOTATION_KEY)
                .map(String::as_str),
            Some("2026-08-02T12:00:00Z")
        );
        assert_eq!(
            annotations
                .get(PRE_PROVISIONED_ANNOTATION_KEY)
                .map(String::as_str),
            Some("false")
        );

        let data = cm.data.as_ref().unwrap();
        assert_eq!(data.get(CLAIM_STATUS_DATA_KEY).map(String::as_str), Some("ready"));
        assert!(data.contains_key(RENDERED_RESOURCES_DATA_KEY));
        assert!(data.contains_key(RETURN_VALUES_DATA_KEY));
        assert!(data.contains_key(CLAIM_RESOURCES_STATUS_DATA_KEY));
    }

    #[test]
    fn pool_claim_omits_claimed_at() {
        let mut claim = sample_claim();
        claim.pre_provisioned = true;
        claim.claimed_at = None;
        let cm = claim.encode().unwrap();
        assert!(annotation(&cm, CLAIMED_AT_ANNOTATION_KEY).is_none());
        assert!(is_pre_provisioned(&cm));
    }

    #[test]
    fn garbage_annotations_read_as_absent() {
        let mut cm = sample_claim().encode().unwrap();
        set_annotation(&mut cm, EXPIRES_AT_ANNOTATION_KEY, "not-a-time".to_string());
        set_annotation(&mut cm, PRE_PROVISIONED_ANNOTATION_KEY, "maybe".to_string());
        assert!(expires_at(&cm).is_none());
        assert!(!is_pre_provisioned(&cm));
    }

    #[test]
    fn pre_provisioned_parsing_is_case_insensitive() {
        let mut cm = sample_claim().encode().unwrap();
        set_annotation(&mut cm, PRE_PROVISIONED_ANNOTATION_KEY, " True ".to_string());
        assert!(is_pre_provisioned(&cm));
    }

    #[test]
    fn rendered_resources_rejects_incomplete_documents() {
        let mut claim = sample_claim();
        claim.rendered_resources = vec![serde_json::json!({"kind": "Pod"})];
        let cm = claim.encode().unwrap();
        let err = rendered_resources(&cm).unwrap_err();
        assert!(err.to_string().contains("apiVersion"));
    }

    #[test]
    fn rendered_resources_rejects_empty_list() {
        let mut claim = sample_claim();
        claim.rendered_resources = Vec::new();
        let cm = claim.encode().unwrap();
        assert!(rendered_resources(&cm).is_err());
    }

    #[test]
    fn claim_ids_are_eight_lowercase_alphanumerics() {
        for _ in 0..32 {
            let id = new_claim_id();
            assert_eq!(id.len(), 8);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn unmanaged_objects_are_detected() {
        let mut cm = sample_claim().encode().unwrap();
        cm.metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(MANAGED_BY_LABEL_KEY);
        assert!(!is_managed(&cm));
    }
}
