//! Claim reconciliation: resource materialization, readiness, expiry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DynamicObject;
use kube::discovery::Scope;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::claim::{
    self, ClaimState, ResourceStatus, CLAIM_LABEL_KEY, CLAIM_RESOURCES_STATUS_DATA_KEY,
    CLAIM_STATUS_DATA_KEY, CLAIM_STATUS_MESSAGE_DATA_KEY, LAZY_PROVISIONING_ANNOTATION_KEY,
    LAZY_PROVISIONING_ANNOTATION_KEY_ALT, MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE,
};
use crate::metrics::Metrics;
use crate::platform::{ignore_not_found, ClaimStore, ResourceClient};
use crate::retry::{retry_on_conflict, DEFAULT_ATTEMPTS};
use crate::Error;

/// Shared state for every reconcile call.
pub struct Context {
    /// Claim store (trait object for testability)
    pub claims: Arc<dyn ClaimStore>,
    /// Dynamic resource client
    pub resources: Arc<dyn ResourceClient>,
    /// The single namespace this controller manages
    pub namespace: String,
    /// Fallback TTL for claims with an unparseable expiry
    pub default_ttl: Duration,
    /// Periodic requeue bound
    pub reconcile_interval: Duration,
    /// Shared metric registers
    pub metrics: Arc<Metrics>,
}

/// Reconcile one claim.
///
/// The controller framework serializes calls per claim key; across keys this
/// runs concurrently. Before per-claim work every reconcile sweeps expired
/// claims in the namespace so expiry never depends on a claim's own events.
#[instrument(skip(claim, ctx), fields(claim = %claim.name_any()))]
pub async fn reconcile(claim: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action, Error> {
    if claim.namespace().as_deref() != Some(ctx.namespace.as_str()) {
        return Ok(Action::await_change());
    }

    cleanup_expired_claims(&ctx).await?;

    let name = claim.name_any();
    let Some(current) = ctx.claims.get(&name).await? else {
        let _ = refresh_metrics(&ctx).await;
        return Ok(Action::await_change());
    };

    if !claim::is_managed(&current) {
        return Ok(Action::await_change());
    }

    let now = Utc::now();
    let pre_provisioned = claim::is_pre_provisioned(&current);
    // An unparseable expiry reads as now + default TTL, in memory only; the
    // annotation is left untouched.
    let expires_at = claim::expires_at(&current)
        .unwrap_or_else(|| now + chrono_duration(ctx.default_ttl));

    if !pre_provisioned && now >= expires_at {
        info!("claim expired, tearing down");
        cleanup_claim_resources(&ctx, &current).await?;
        ignore_not_found(ctx.claims.delete(&name).await)?;
        let _ = refresh_metrics(&ctx).await;
        return Ok(Action::await_change());
    }

    ensure_claim_resources(&ctx, &current).await?;

    let (all_ready, summary, statuses) = evaluate_claim_readiness(&ctx, &current).await?;
    update_claim_readiness_status(&ctx, &current, all_ready, &summary, &statuses).await?;

    let _ = refresh_metrics(&ctx).await;

    let delay = next_check(
        expires_at,
        all_ready,
        pre_provisioned,
        ctx.reconcile_interval,
        now,
    );
    debug!(?delay, all_ready, "reconcile complete");
    Ok(Action::requeue(delay))
}

/// Requeue strategy on reconcile failure: short fixed backoff.
pub fn error_policy(claim: Arc<ConfigMap>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, claim = %claim.name_any(), "reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

/// Compute the requeue delay for a claim.
///
/// Starts from the time until expiry (or the reconcile interval for
/// pre-provisioned claims), floors at 5s, caps at 3s while resources are not
/// ready, and never exceeds a positive reconcile interval.
pub fn next_check(
    expires_at: DateTime<Utc>,
    all_ready: bool,
    pre_provisioned: bool,
    reconcile_interval: Duration,
    now: DateTime<Utc>,
) -> Duration {
    let mut next_ms: i64 = if pre_provisioned {
        reconcile_interval.as_millis() as i64
    } else {
        (expires_at - now).num_milliseconds()
    };

    if next_ms < 5_000 {
        next_ms = 5_000;
    }
    if !all_ready && next_ms > 3_000 {
        next_ms = 3_000;
    }
    let interval_ms = reconcile_interval.as_millis() as i64;
    if interval_ms > 0 && interval_ms < next_ms {
        next_ms = interval_ms;
    }

    Duration::from_millis(next_ms.max(0) as u64)
}

/// Whether a rendered resource defers materialization until hand-out.
/// Both historical spellings of the annotation are honored.
fn is_lazy_resource(resource: &serde_json::Value) -> bool {
    let annotations = &resource["metadata"]["annotations"];
    [
        LAZY_PROVISIONING_ANNOTATION_KEY,
        LAZY_PROVISIONING_ANNOTATION_KEY_ALT,
    ]
    .iter()
    .any(|key| {
        annotations[*key]
            .as_str()
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    })
}

struct ResourceCoords<'a> {
    api_version: &'a str,
    kind: &'a str,
    name: &'a str,
}

fn resource_coords(resource: &serde_json::Value) -> Result<ResourceCoords<'_>, Error> {
    let api_version = resource["apiVersion"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::serialization("rendered resource missing apiVersion"))?;
    let kind = resource["kind"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::serialization("rendered resource missing kind"))?;
    let name = resource["metadata"]["name"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::serialization("rendered resource missing metadata.name"))?;
    Ok(ResourceCoords {
        api_version,
        kind,
        name,
    })
}

async fn resource_namespace(
    ctx: &Context,
    coords: &ResourceCoords<'_>,
) -> Result<Option<String>, Error> {
    let scope = match ctx
        .resources
        .resolve_scope(coords.api_version, coords.kind)
        .await
    {
        Ok(scope) => scope,
        Err(e) => {
            warn!(
                kind = %coords.kind,
                name = %coords.name,
                error = %e,
                "failed to resolve resource scope"
            );
            return Err(e);
        }
    };
    Ok(match scope {
        Scope::Namespaced => Some(ctx.namespace.clone()),
        Scope::Cluster => None,
    })
}

/// Delete every claim in the namespace whose lease has lapsed.
///
/// Pool claims are exempt: they idle at `created + max_ttl` until handed out
/// and are only replaced through the hand-out path.
async fn cleanup_expired_claims(ctx: &Context) -> Result<(), Error> {
    let claims = ctx.claims.list_managed().await?;
    let now = Utc::now();

    for cm in &claims {
        if claim::is_pre_provisioned(cm) {
            continue;
        }
        let Some(expires_at) = claim::expires_at(cm) else {
            continue;
        };
        if now < expires_at {
            continue;
        }

        info!(claim = %cm.name_any(), "sweeping expired claim");
        cleanup_claim_resources(ctx, cm).await?;
        ignore_not_found(ctx.claims.delete(&cm.name_any()).await)?;
    }

    Ok(())
}

/// Cascade-delete the materialized resources of a claim.
async fn cleanup_claim_resources(ctx: &Context, cm: &ConfigMap) -> Result<(), Error> {
    let resources = claim::rendered_resources(cm)?;

    for resource in &resources {
        let coords = resource_coords(resource)?;
        let namespace = resource_namespace(ctx, &coords).await?;
        ignore_not_found(
            ctx.resources
                .delete(
                    coords.api_version,
                    coords.kind,
                    namespace.as_deref().unwrap_or(""),
                    coords.name,
                )
                .await,
        )?;
    }

    Ok(())
}

/// Create any rendered resource that does not exist yet.
///
/// Existing objects are never mutated. Lazy resources are skipped while the
/// claim is pre-provisioned.
async fn ensure_claim_resources(ctx: &Context, cm: &ConfigMap) -> Result<(), Error> {
    let claim_name = cm.name_any();
    let resources = claim::rendered_resources(cm)?;
    let pre_provisioned = claim::is_pre_provisioned(cm);

    for resource in &resources {
        if pre_provisioned && is_lazy_resource(resource) {
            continue;
        }

        let coords = resource_coords(resource)?;
        let namespace = resource_namespace(ctx, &coords).await?;

        let existing = ctx
            .resources
            .get(
                coords.api_version,
                coords.kind,
                namespace.as_deref().unwrap_or(""),
                coords.name,
            )
            .await?;
        if existing.is_some() {
            continue;
        }

        let mut to_create = resource.clone();
        stamp_ownership(&mut to_create, &claim_name, cm);
        ctx.resources
            .create(namespace.as_deref().unwrap_or(""), &to_create)
            .await?;
        info!(
            kind = %coords.kind,
            name = %coords.name,
            claim = %claim_name,
            "created resource for claim"
        );
    }

    Ok(())
}

/// Stamp the managed-by and claim labels plus the controller owner reference
/// onto a resource document before creation.
fn stamp_ownership(resource: &mut serde_json::Value, claim_name: &str, cm: &ConfigMap) {
    let metadata = resource
        .as_object_mut()
        .map(|o| {
            o.entry("metadata")
                .or_insert_with(|| serde_json::json!({}))
        })
        .and_then(|m| m.as_object_mut());
    let Some(metadata) = metadata else { return };

    let labels = metadata
        .entry("labels")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(labels) = labels.as_object_mut() {
        labels.insert(
            MANAGED_BY_LABEL_KEY.to_string(),
            serde_json::Value::String(MANAGED_BY_LABEL_VALUE.to_string()),
        );
        labels.insert(
            CLAIM_LABEL_KEY.to_string(),
            serde_json::Value::String(claim_name.to_string()),
        );
    }

    if let Some(owner) = claim::resource_owner_reference(cm) {
        if let Ok(owner) = serde_json::to_value(vec![owner]) {
            metadata.insert("ownerReferences".to_string(), owner);
        }
    }
}

/// Evaluate the readiness of every non-lazy rendered resource.
async fn evaluate_claim_readiness(
    ctx: &Context,
    cm: &ConfigMap,
) -> Result<(bool, String, Vec<ResourceStatus>), Error> {
    let resources = claim::rendered_resources(cm)?;
    let pre_provisioned = claim::is_pre_provisioned(cm);

    let mut all_ready = true;
    let mut ready_count = 0usize;
    let mut statuses = Vec::with_capacity(resources.len());

    for resource in &resources {
        if pre_provisioned && is_lazy_resource(resource) {
            continue;
        }

        let coords = resource_coords(resource)?;
        let namespace = resource_namespace(ctx, &coords).await?;

        let Some(live) = ctx
            .resources
            .get(
                coords.api_version,
                coords.kind,
                namespace.as_deref().unwrap_or(""),
                coords.name,
            )
            .await?
        else {
            all_ready = false;
            statuses.push(ResourceStatus {
                kind: coords.kind.to_string(),
                name: coords.name.to_string(),
                namespace: namespace.clone(),
                ready: false,
                message: "not created yet".to_string(),
            });
            continue;
        };

        let (ready, message) = assess_resource_readiness(coords.kind, &live);
        if ready {
            ready_count += 1;
        } else {
            all_ready = false;
        }

        statuses.push(ResourceStatus {
            kind: coords.kind.to_string(),
            name: coords.name.to_string(),
            namespace,
            ready,
            message,
        });
    }

    let summary = if all_ready {
        "all resources ready".to_string()
    } else {
        format!("{ready_count}/{} resources ready", resources.len())
    };

    Ok((all_ready, summary, statuses))
}

/// Readiness predicate over a live object.
///
/// Pods and Deployments get real health checks; anything else is ready by
/// existing.
fn assess_resource_readiness(kind: &str, obj: &DynamicObject) -> (bool, String) {
    let data = &obj.data;
    match kind.to_ascii_lowercase().as_str() {
        "pod" => {
            let phase = data["status"]["phase"].as_str().unwrap_or_default();
            if phase == "Succeeded" {
                return (true, "pod succeeded".to_string());
            }
            if phase == "Failed" {
                return (false, "pod failed".to_string());
            }
            let (ready, found) = condition_status(&data["status"]["conditions"], "Ready");
            if phase == "Running" && found && ready {
                return (true, "pod ready".to_string());
            }
            (false, format!("pod phase={phase}"))
        }
        "deployment" => {
            let mut desired = data["spec"]["replicas"].as_i64().unwrap_or(0);
            if desired == 0 {
                desired = 1;
            }
            let ready_replicas = data["status"]["readyReplicas"].as_i64().unwrap_or(0);
            let (available, available_found) =
                condition_status(&data["status"]["conditions"], "Available");
            if ready_replicas >= desired && (!available_found || available) {
                (true, format!("deployment ready ({ready_replicas}/{desired})"))
            } else {
                (
                    false,
                    format!("deployment not ready ({ready_replicas}/{desired})"),
                )
            }
        }
        _ => (true, "resource exists".to_string()),
    }
}

/// Look up a condition by type in a conditions array.
///
/// Returns (status, found). A condition whose status does not parse as a
/// boolean counts as found-but-false.
fn condition_status(conditions: &serde_json::Value, condition_type: &str) -> (bool, bool) {
    let Some(conditions) = conditions.as_array() else {
        return (false, false);
    };
    for condition in conditions {
        let name = condition["type"].as_str().unwrap_or_default();
        if !name.eq_ignore_ascii_case(condition_type) {
            continue;
        }
        let status = condition["status"].as_str().unwrap_or_default();
        return if status.eq_ignore_ascii_case("true") {
            (true, true)
        } else {
            (false, true)
        };
    }
    (false, false)
}

/// CAS-write the status triplet onto the claim, skipping no-op writes.
async fn update_claim_readiness_status(
    ctx: &Context,
    cm: &ConfigMap,
    all_ready: bool,
    summary: &str,
    statuses: &[ResourceStatus],
) -> Result<(), Error> {
    let statuses_json = serde_json::to_string(statuses)
        .map_err(|e| Error::serialization(format!("encode resource statuses: {e}")))?;
    let state = if all_ready {
        ClaimState::Ready
    } else {
        ClaimState::Pending
    };

    let name = cm.name_any();
    retry_on_conflict(DEFAULT_ATTEMPTS, "update claim status", || {
        let name = name.clone();
        let statuses_json = statuses_json.clone();
        async move {
            let Some(mut current) = ctx.claims.get(&name).await? else {
                return Ok(());
            };

            let data = current.data.get_or_insert_with(BTreeMap::new);
            let unchanged = data.get(CLAIM_STATUS_DATA_KEY).map(String::as_str)
                == Some(state.as_str())
                && data.get(CLAIM_STATUS_MESSAGE_DATA_KEY).map(String::as_str) == Some(summary)
                && data.get(CLAIM_RESOURCES_STATUS_DATA_KEY).map(String::as_str)
                    == Some(statuses_json.as_str());
            if unchanged {
                return Ok(());
            }

            data.insert(CLAIM_STATUS_DATA_KEY.to_string(), state.as_str().to_string());
            data.insert(
                CLAIM_STATUS_MESSAGE_DATA_KEY.to_string(),
                summary.to_string(),
            );
            data.insert(CLAIM_RESOURCES_STATUS_DATA_KEY.to_string(), statuses_json);

            ctx.claims.update(&current).await.map(|_| ())
        }
    })
    .await
}

/// Recompute the active-claims and active-resources gauges.
///
/// Claims whose rendered data fails to parse are skipped rather than failing
/// the refresh; lazy resources of pool claims do not exist yet and are not
/// counted.
async fn refresh_metrics(ctx: &Context) -> Result<(), Error> {
    let claims = ctx.claims.list_managed().await?;
    ctx.metrics.active_claims.set(claims.len() as i64);

    let mut resources = 0i64;
    for cm in &claims {
        let Ok(templates) = claim::rendered_resources(cm) else {
            continue;
        };
        if claim::is_pre_provisioned(cm) {
            resources += templates.iter().filter(|r| !is_lazy_resource(r)).count() as i64;
        } else {
            resources += templates.len() as i64;
        }
    }
    ctx.metrics.active_resources.set(resources);

    Ok(())
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000))
}
