//! HTTP API (C5): acquire, renew, release, health.
//!
//! Thin axum handlers over [`ClaimService`]; error kinds map onto HTTP
//! statuses here and nowhere else.

mod claims;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tracing::{error, info};

use crate::claim::format_timestamp;
use crate::config::parse_duration;
use crate::Error;

pub use claims::{AcquiredClaim, ClaimService, WaitOutcome, READY_WAIT_TIMEOUT};

/// HTTP-facing error: every [`Error`] kind folds into one of these statuses.
#[derive(Debug, ThisError)]
pub enum ApiError {
    /// Malformed body, duration, or non-positive TTL
    #[error("{0}")]
    BadRequest(String),

    /// No claim with the given id
    #[error("claim not found")]
    NotFound,

    /// The object exists but is not ours
    #[error("claim not managed by controller")]
    NotManaged,

    /// Renewal past the absolute TTL cap
    #[error("max ttl already reached")]
    MaxTtlReached,

    /// The reconciler marked the claim failed; carries its message
    #[error("{0}")]
    ClaimFailed(String),

    /// Readiness did not arrive before the deadline
    #[error("timed out waiting for claim resources to become ready")]
    ReadyTimeout,

    /// An orchestrator call hit its deadline
    #[error("upstream timeout")]
    UpstreamTimeout,

    /// Template rendering failed; detail stays in the logs
    #[error("failed to render templates")]
    Render,

    /// Anything else; detail stays in the logs
    #[error("internal error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::NotManaged => StatusCode::FORBIDDEN,
            ApiError::MaxTtlReached => StatusCode::CONFLICT,
            ApiError::ReadyTimeout | ApiError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::ClaimFailed(_) | ApiError::Render | ApiError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Validation(msg) => ApiError::BadRequest(msg),
            Error::NotFound => ApiError::NotFound,
            Error::NotManaged => ApiError::NotManaged,
            Error::MaxTtlReached => ApiError::MaxTtlReached,
            Error::Timeout => ApiError::UpstreamTimeout,
            Error::Render(detail) => {
                error!(error = %detail, "template rendering failed");
                ApiError::Render
            }
            other => {
                error!(error = %other, "request failed");
                ApiError::Internal
            }
        }
    }
}

/// Acquire request body.
#[derive(Debug, Default, Deserialize)]
struct ClaimRequest {
    /// Requested lease duration, Go syntax
    ttl: Option<String>,
}

/// Acquire response body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    /// Constant "ok"
    pub status: String,
    /// Claim id for the release/renew paths
    pub id: String,
    /// RFC3339 expiry
    pub expires_at: String,
    /// Return values harvested from the rendered resources
    pub data: BTreeMap<String, String>,
    /// Path to release this claim
    pub release_path: String,
    /// Method for the release path
    pub release_method: String,
    /// Path to renew this claim
    pub renew_path: String,
    /// Method for the renew path
    pub renew_method: String,
    /// Whether the claim came from the warm pool
    pub pre_provisioned: bool,
}

/// Renew response body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewResponse {
    /// Constant "ok"
    pub status: String,
    /// Claim id
    pub id: String,
    /// New RFC3339 expiry
    pub expires_at: String,
    /// Path to renew again
    pub renew_path: String,
    /// Method for the renew path
    pub renew_method: String,
}

/// Parse the optional `{"ttl": "..."}` body into an effective TTL.
///
/// An empty body or blank ttl falls back to the default; a requested ttl is
/// clamped to the cap; zero or unparseable input is rejected.
fn ttl_from_body(body: &str, default_ttl: Duration, max_ttl: Duration) -> Result<Duration, ApiError> {
    if body.trim().is_empty() {
        return Ok(default_ttl);
    }

    let request: ClaimRequest = serde_json::from_str(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;

    let Some(ttl) = request.ttl.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(default_ttl);
    };

    let ttl = parse_duration(ttl)
        .map_err(|_| ApiError::BadRequest("invalid ttl duration".to_string()))?;
    if ttl.is_zero() {
        return Err(ApiError::BadRequest(
            "ttl must be greater than 0".to_string(),
        ));
    }
    Ok(ttl.min(max_ttl))
}

async fn handle_claim(
    State(service): State<Arc<ClaimService>>,
    body: String,
) -> Result<(StatusCode, Json<ClaimResponse>), ApiError> {
    let ttl = ttl_from_body(&body, service.default_ttl(), service.max_ttl())?;

    let acquired = service.acquire(ttl).await?;

    let ready_start = std::time::Instant::now();
    match service.wait_for_ready(&acquired.name).await? {
        WaitOutcome::Ready => {}
        WaitOutcome::Failed(message) => return Err(ApiError::ClaimFailed(message)),
        WaitOutcome::TimedOut => {
            service.metrics().timedout_claims_total.inc();
            return Err(ApiError::ReadyTimeout);
        }
    }
    let ready_seconds = ready_start.elapsed().as_secs_f64();
    service
        .metrics()
        .claim_ready_duration_seconds
        .observe(ready_seconds);
    info!(
        id = %acquired.id,
        claim = %acquired.name,
        ready_duration_seconds = ready_seconds,
        pre_provisioned = acquired.pre_provisioned,
        "claim became ready"
    );

    let response = ClaimResponse {
        status: "ok".to_string(),
        expires_at: format_timestamp(acquired.expires_at),
        data: acquired.return_values,
        release_path: format!("/release/{}", acquired.id),
        release_method: "POST".to_string(),
        renew_path: format!("/renew/{}", acquired.id),
        renew_method: "POST".to_string(),
        pre_provisioned: acquired.pre_provisioned,
        id: acquired.id,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

async fn handle_renew(
    State(service): State<Arc<ClaimService>>,
    Path(id): Path<String>,
    body: String,
) -> Result<Json<RenewResponse>, ApiError> {
    let id = id.trim().to_string();
    if id.is_empty() {
        return Err(ApiError::BadRequest("id is required".to_string()));
    }
    let ttl = ttl_from_body(&body, service.default_ttl(), service.max_ttl())?;

    let expires_at = service.renew(&id, ttl).await?;

    Ok(Json(RenewResponse {
        status: "ok".to_string(),
        expires_at: format_timestamp(expires_at),
        renew_path: format!("/renew/{id}"),
        renew_method: "POST".to_string(),
        id,
    }))
}

async fn handle_release(
    State(service): State<Arc<ClaimService>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::BadRequest("id is required".to_string()));
    }

    service.release(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// The claim API router.
pub fn api_router(service: Arc<ClaimService>) -> Router {
    Router::new()
        .route("/claim", post(handle_claim))
        .route("/renew/{id}", post(handle_renew))
        .route("/release/{id}", post(handle_release))
        .route("/healthz", get(health_handler))
        .route("/readyz", get(health_handler))
        .with_state(service)
}

/// Standalone probe router for the health listen address.
pub fn probe_router() -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/readyz", get(health_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{self, Claim};
    use crate::metrics::Metrics;
    use crate::platform::MockClaimStore;
    use crate::values::ValuesProvider;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use std::io::Write;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct StaticValues;

    #[async_trait]
    impl ValuesProvider for StaticValues {
        async fn start(&self) -> Result<(), Error> {
            Ok(())
        }
        async fn values(&self) -> Result<Vec<u8>, Error> {
            Ok(b"{}".to_vec())
        }
        async fn owner_reference(&self) -> Option<OwnerReference> {
            None
        }
        fn description(&self) -> String {
            "test:static".to_string()
        }
    }

    fn write_template() -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "claim-controller-api-template-{}-{:x}.yaml",
            std::process::id(),
            rand::random::<u64>()
        ));
        std::fs::File::create(&path)
            .and_then(|mut f| {
                f.write_all(
                    b"apiVersion: v1\nkind: Pod\nmetadata:\n  name: workload-{{ claim.id }}\n  labels:\n    claim.controller/return: \"host=workload-{{ claim.id }}\"\n",
                )
            })
            .unwrap();
        path
    }

    fn router_with(claims: MockClaimStore, template_path: &str) -> Router {
        let metrics =
            Arc::new(Metrics::new(Duration::from_secs(180), Duration::from_secs(600)).unwrap());
        let service = Arc::new(ClaimService::new(
            Arc::new(claims),
            Arc::new(StaticValues),
            metrics,
            "default".to_string(),
            template_path.to_string(),
            Duration::from_secs(180),
            Duration::from_secs(600),
            0,
        ));
        api_router(service)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Mock store where create persists a copy whose status is pre-set, so
    /// the readiness poll resolves on its first tick.
    fn store_resolving_to(state: claim::ClaimState, message: &str) -> MockClaimStore {
        let stored: Arc<Mutex<Option<ConfigMap>>> = Arc::new(Mutex::new(None));
        let mut claims = MockClaimStore::new();

        let write = stored.clone();
        let message = message.to_string();
        claims.expect_create().returning(move |cm| {
            let mut created = cm.clone();
            created.metadata.creation_timestamp = Some(Time(Utc::now()));
            let mut settled = created.clone();
            let data = settled.data.get_or_insert_with(Default::default);
            data.insert(
                claim::CLAIM_STATUS_DATA_KEY.to_string(),
                state.as_str().to_string(),
            );
            data.insert(
                claim::CLAIM_STATUS_MESSAGE_DATA_KEY.to_string(),
                message.clone(),
            );
            *write.lock().unwrap() = Some(settled);
            Ok(created)
        });

        let read = stored.clone();
        claims
            .expect_get()
            .returning(move |_| Ok(read.lock().unwrap().clone()));
        claims
    }

    #[tokio::test]
    async fn health_endpoints_answer_ok() {
        let router = router_with(MockClaimStore::new(), "unused");
        for path in ["/healthz", "/readyz"] {
            let response = router
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = axum::body::to_bytes(response.into_body(), 64).await.unwrap();
            assert_eq!(&bytes[..], b"ok");
        }
    }

    #[tokio::test]
    async fn acquire_happy_path_returns_handle() {
        let template = write_template();
        let router = router_with(
            store_resolving_to(claim::ClaimState::Ready, "all resources ready"),
            template.to_str().unwrap(),
        );

        let before = Utc::now();
        let response = router.oneshot(post("/claim", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body: ClaimResponse = body_json(response).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.id.len(), 8);
        assert_eq!(body.release_path, format!("/release/{}", body.id));
        assert_eq!(body.release_method, "POST");
        assert_eq!(body.renew_path, format!("/renew/{}", body.id));
        assert!(!body.pre_provisioned);
        assert_eq!(
            body.data.get("host").cloned(),
            Some(format!("workload-{}", body.id))
        );

        // default TTL applies when the body is empty
        let expires = claim::parse_timestamp(&body.expires_at).unwrap();
        let granted = (expires - before).num_seconds();
        assert!((175..=185).contains(&granted), "granted {granted}s");

        let _ = std::fs::remove_file(&template);
    }

    #[tokio::test]
    async fn acquire_clamps_ttl_to_the_cap() {
        let template = write_template();
        let router = router_with(
            store_resolving_to(claim::ClaimState::Ready, ""),
            template.to_str().unwrap(),
        );

        let before = Utc::now();
        let response = router
            .oneshot(post("/claim", r#"{"ttl": "45m"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body: ClaimResponse = body_json(response).await;
        let expires = claim::parse_timestamp(&body.expires_at).unwrap();
        let granted = (expires - before).num_seconds();
        assert!(granted <= 600, "granted {granted}s exceeds the cap");

        let _ = std::fs::remove_file(&template);
    }

    #[tokio::test]
    async fn acquire_with_bad_ttl_is_rejected() {
        let router = router_with(MockClaimStore::new(), "unused");
        for body in [r#"{"ttl": "tomorrow"}"#, r#"{"ttl": "0s"}"#, "{not json"] {
            let response = router.clone().oneshot(post("/claim", body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        }
    }

    #[tokio::test]
    async fn failed_claim_surfaces_the_stored_message() {
        let template = write_template();
        let router = router_with(
            store_resolving_to(claim::ClaimState::Failed, "pod failed"),
            template.to_str().unwrap(),
        );

        let response = router.oneshot(post("/claim", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: serde_json::Value = body_json(response).await;
        assert_eq!(body["error"].as_str(), Some("pod failed"));

        let _ = std::fs::remove_file(&template);
    }

    #[tokio::test]
    async fn release_unknown_id_is_not_found() {
        let mut claims = MockClaimStore::new();
        claims.expect_list_by_id().returning(|_| Ok(vec![]));
        let router = router_with(claims, "unused");

        let response = router.oneshot(post("/release/nothere1", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn release_unmanaged_claim_is_forbidden() {
        let claim = Claim::new(
            "default",
            "rogue001",
            vec![],
            BTreeMap::new(),
            Utc::now(),
            false,
        );
        let mut cm = claim.encode().unwrap();
        cm.metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(claim::MANAGED_BY_LABEL_KEY);

        let mut claims = MockClaimStore::new();
        claims
            .expect_list_by_id()
            .returning(move |_| Ok(vec![cm.clone()]));
        let router = router_with(claims, "unused");

        let response = router.oneshot(post("/release/rogue001", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn release_deletes_and_returns_no_content() {
        let claim = Claim::new(
            "default",
            "gone0001",
            vec![],
            BTreeMap::new(),
            Utc::now() + chrono::Duration::minutes(3),
            false,
        );
        let mut cm = claim.encode().unwrap();
        cm.metadata.creation_timestamp = Some(Time(Utc::now() - chrono::Duration::minutes(1)));

        let mut claims = MockClaimStore::new();
        claims
            .expect_list_by_id()
            .returning(move |_| Ok(vec![cm.clone()]));
        claims.expect_delete().times(1).returning(|_| Ok(()));
        let router = router_with(claims, "unused");

        let response = router.oneshot(post("/release/gone0001", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn renew_past_the_cap_conflicts() {
        let now = Utc::now();
        let claim = Claim::new(
            "default",
            "overdone1",
            vec![],
            BTreeMap::new(),
            now,
            false,
        );
        let mut cm = claim.encode().unwrap();
        // claimed 11 minutes ago with a 10 minute cap
        claim::set_claimed_at(&mut cm, now - chrono::Duration::minutes(11));

        let mut claims = MockClaimStore::new();
        claims
            .expect_list_by_id()
            .returning(move |_| Ok(vec![cm.clone()]));
        claims.expect_update().never();
        let router = router_with(claims, "unused");

        let response = router.oneshot(post("/renew/overdone1", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn renew_returns_the_new_expiry() {
        let now = Utc::now();
        let claim = Claim::new(
            "default",
            "renewme1",
            vec![],
            BTreeMap::new(),
            now + chrono::Duration::minutes(1),
            false,
        );
        let mut cm = claim.encode().unwrap();
        claim::set_claimed_at(&mut cm, now - chrono::Duration::minutes(2));

        let mut claims = MockClaimStore::new();
        let listed = cm.clone();
        claims
            .expect_list_by_id()
            .returning(move |_| Ok(vec![listed.clone()]));
        let fetched = cm.clone();
        claims
            .expect_get()
            .returning(move |_| Ok(Some(fetched.clone())));
        claims
            .expect_update()
            .times(1)
            .returning(|cm| Ok(cm.clone()));
        let router = router_with(claims, "unused");

        let response = router
            .oneshot(post("/renew/renewme1", r#"{"ttl": "5m"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: RenewResponse = body_json(response).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.id, "renewme1");
        let expires = claim::parse_timestamp(&body.expires_at).unwrap();
        let granted = (expires - now).num_seconds();
        // 5 minutes requested, 8 minutes of headroom left: request wins
        assert!((295..=305).contains(&granted), "granted {granted}s");
    }

    mod ttl_parsing {
        use super::*;

        #[test]
        fn empty_body_uses_the_default() {
            let ttl =
                ttl_from_body("", Duration::from_secs(180), Duration::from_secs(600)).unwrap();
            assert_eq!(ttl, Duration::from_secs(180));
        }

        #[test]
        fn blank_ttl_uses_the_default() {
            let ttl = ttl_from_body(
                r#"{"ttl": "  "}"#,
                Duration::from_secs(180),
                Duration::from_secs(600),
            )
            .unwrap();
            assert_eq!(ttl, Duration::from_secs(180));
        }

        #[test]
        fn requested_ttl_is_honored() {
            let ttl = ttl_from_body(
                r#"{"ttl": "5m"}"#,
                Duration::from_secs(180),
                Duration::from_secs(600),
            )
            .unwrap();
            assert_eq!(ttl, Duration::from_secs(300));
        }

        #[test]
        fn oversized_ttl_is_clamped() {
            let ttl = ttl_from_body(
                r#"{"ttl": "2h"}"#,
                Duration::from_secs(180),
                Duration::from_secs(600),
            )
            .unwrap();
            assert_eq!(ttl, Duration::from_secs(600));
        }

        #[test]
        fn zero_and_garbage_ttls_are_rejected() {
            for body in [r#"{"ttl": "0s"}"#, r#"{"ttl": "soon"}"#, "pure garbage"] {
                let result =
                    ttl_from_body(body, Duration::from_secs(180), Duration::from_secs(600));
                assert!(matches!(result, Err(ApiError::BadRequest(_))), "body: {body}");
            }
        }
    }
}
