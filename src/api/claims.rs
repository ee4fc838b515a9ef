//! Claim acquisition, renewal, release, and the warm-pool allocator.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::claim::{self, Claim};
use crate::metrics::Metrics;
use crate::platform::ClaimStore;
use crate::retry::{retry_on_conflict, DEFAULT_ATTEMPTS};
use crate::template::render_resources;
use crate::values::ValuesProvider;
use crate::Error;

/// Bound on every orchestrator call made from a request handler.
const KUBE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for an acquire waiting on readiness.
pub const READY_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Poll cadence of the readiness wait.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the warm-pool filler between nudges.
const POOL_FILL_INTERVAL: Duration = Duration::from_secs(15);

async fn bounded<T>(fut: impl Future<Output = Result<T, Error>>) -> Result<T, Error> {
    tokio::time::timeout(KUBE_CALL_TIMEOUT, fut)
        .await
        .map_err(|_| Error::Timeout)?
}

/// Outcome of waiting for a claim to become ready.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every resource passed readiness
    Ready,
    /// The reconciler marked the claim failed; carries the stored message
    Failed(String),
    /// The deadline elapsed first
    TimedOut,
}

/// A claim handed to an acquirer.
pub struct AcquiredClaim {
    /// Claim id for release/renew paths
    pub id: String,
    /// Object name in the store
    pub name: String,
    /// Expiry granted to this acquirer
    pub expires_at: DateTime<Utc>,
    /// Return values harvested at render time
    pub return_values: BTreeMap<String, String>,
    /// Whether the claim came from the warm pool
    pub pre_provisioned: bool,
}

/// Shared service behind the HTTP handlers and the pool filler.
pub struct ClaimService {
    claims: Arc<dyn ClaimStore>,
    values: Arc<dyn ValuesProvider>,
    metrics: Arc<Metrics>,
    namespace: String,
    template_path: String,
    default_ttl: Duration,
    max_ttl: Duration,
    pre_provision_count: usize,
    pool_refill: Notify,
}

impl ClaimService {
    /// Build the service. `max_ttl` is expected to be floored at
    /// `default_ttl` by configuration resolution.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        claims: Arc<dyn ClaimStore>,
        values: Arc<dyn ValuesProvider>,
        metrics: Arc<Metrics>,
        namespace: String,
        template_path: String,
        default_ttl: Duration,
        max_ttl: Duration,
        pre_provision_count: usize,
    ) -> Self {
        Self {
            claims,
            values,
            metrics,
            namespace,
            template_path,
            default_ttl,
            max_ttl,
            pre_provision_count,
            pool_refill: Notify::new(),
        }
    }

    /// The default TTL applied when a request does not specify one.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// The absolute TTL cap.
    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    /// The shared metric registers.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Acquire a claim: warm pool first, on-demand otherwise.
    pub async fn acquire(&self, ttl: Duration) -> Result<AcquiredClaim, Error> {
        if let Some(handed_out) = self.acquire_pre_provisioned(ttl).await? {
            let decoded = Claim::decode(&handed_out)?;
            self.metrics.claims_reused_preprovisioned_total.inc();
            self.pool_refill.notify_one();
            return Ok(AcquiredClaim {
                name: handed_out.name_any(),
                expires_at: claim::expires_at(&handed_out)
                    .unwrap_or_else(|| Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default()),
                id: decoded.id,
                return_values: decoded.return_values,
                pre_provisioned: true,
            });
        }

        let id = claim::new_claim_id();
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let created = self.create_claim(&id, expires_at, false).await?;
        let decoded = Claim::decode(&created)?;

        self.metrics.claims_created_total.inc();
        self.metrics.claims_created_ondemand_total.inc();
        Ok(AcquiredClaim {
            id,
            name: created.name_any(),
            expires_at,
            return_values: decoded.return_values,
            pre_provisioned: false,
        })
    }

    /// Try to hand out a warm-pool claim.
    ///
    /// For each candidate still flagged pre-provisioned, a CAS loop
    /// re-fetches the object, re-checks the flag, and atomically flips it
    /// while stamping claimed-at and shrinking the expiry. Under concurrent
    /// acquirers at most one observes the flip; the losers move on to the
    /// next candidate. A candidate whose pool residency already exhausted
    /// the max TTL is skipped as stale.
    async fn acquire_pre_provisioned(&self, ttl: Duration) -> Result<Option<ConfigMap>, Error> {
        if self.pre_provision_count == 0 {
            return Ok(None);
        }

        let candidates = bounded(self.claims.list_managed()).await?;
        for candidate in &candidates {
            if !claim::is_pre_provisioned(candidate) {
                continue;
            }
            let name = candidate.name_any();

            let taken = retry_on_conflict(DEFAULT_ATTEMPTS, "acquire pool claim", || {
                let name = name.clone();
                async move {
                    let Some(mut current) = bounded(self.claims.get(&name)).await? else {
                        return Err(Error::conflict("pool claim disappeared"));
                    };
                    if !claim::is_pre_provisioned(&current) {
                        return Err(Error::conflict("already claimed"));
                    }

                    let now = Utc::now();
                    let claimed_at = claim::claimed_at(&current).unwrap_or(now);
                    let max_expires_at =
                        claimed_at + chrono::Duration::from_std(self.max_ttl).unwrap_or_default();
                    if max_expires_at <= now {
                        return Err(Error::conflict("pre-provisioned claim too old"));
                    }

                    let mut expires_at =
                        now + chrono::Duration::from_std(ttl).unwrap_or_default();
                    if expires_at > max_expires_at {
                        expires_at = max_expires_at;
                    }

                    claim::set_pre_provisioned(&mut current, false);
                    claim::set_claimed_at(&mut current, now);
                    claim::set_expires_at(&mut current, expires_at);
                    bounded(self.claims.update(&current)).await.map(|_| ())
                }
            })
            .await;

            match taken {
                Ok(()) => {
                    let fresh = bounded(self.claims.get(&name))
                        .await?
                        .ok_or(Error::NotFound)?;
                    self.metrics.claims_created_total.inc();
                    debug!(claim = %name, "handed out pre-provisioned claim");
                    return Ok(Some(fresh));
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Render and persist a new claim.
    async fn create_claim(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
        pre_provisioned: bool,
    ) -> Result<ConfigMap, Error> {
        let template_text = tokio::fs::read_to_string(&self.template_path)
            .await
            .map_err(|e| Error::render(format!("read template file {}: {e}", self.template_path)))?;
        let values_data = self.values.values().await?;
        let rendered = render_resources(&template_text, &values_data, id)?;

        let mut new_claim = Claim::new(
            &self.namespace,
            id,
            rendered.resources,
            rendered.return_values,
            expires_at,
            pre_provisioned,
        );
        if !pre_provisioned {
            new_claim.claimed_at = Some(Utc::now());
        }
        new_claim.owner_reference = self.values.owner_reference().await;

        let cm = new_claim.encode()?;
        let created = retry_on_conflict(DEFAULT_ATTEMPTS, "create claim", || {
            let cm = cm.clone();
            async move { bounded(self.claims.create(&cm)).await }
        })
        .await?;

        info!(claim = %created.name_any(), pre_provisioned, "created claim");
        Ok(created)
    }

    /// Poll the claim's status until it is ready, failed, or the deadline
    /// elapses. The caller's request context bounds this additionally.
    pub async fn wait_for_ready(&self, name: &str) -> Result<WaitOutcome, Error> {
        let poll = async {
            let mut ticker = tokio::time::interval(READY_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                match self.claims.get(name).await {
                    Ok(Some(cm)) => match claim::status(&cm) {
                        claim::ClaimState::Ready => return Ok(WaitOutcome::Ready),
                        claim::ClaimState::Failed => {
                            let mut message = claim::status_message(&cm);
                            if message.trim().is_empty() {
                                message = "resource readiness failed".to_string();
                            }
                            return Ok(WaitOutcome::Failed(message));
                        }
                        claim::ClaimState::Pending => {}
                    },
                    // a claim mid-creation may not be visible yet
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(READY_WAIT_TIMEOUT, poll).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(WaitOutcome::TimedOut),
        }
    }

    async fn find_managed_claims_by_id(&self, id: &str) -> Result<Vec<ConfigMap>, Error> {
        let claims = bounded(self.claims.list_by_id(id)).await?;
        if claims.is_empty() {
            return Err(Error::NotFound);
        }
        if claims.iter().any(|cm| !claim::is_managed(cm)) {
            return Err(Error::NotManaged);
        }
        Ok(claims)
    }

    /// Renew a claim, raising its expiry up to `claimed-at + max_ttl`.
    pub async fn renew(&self, id: &str, ttl: Duration) -> Result<DateTime<Utc>, Error> {
        let claims = self.find_managed_claims_by_id(id).await?;
        let target = &claims[0];

        let now = Utc::now();
        let claimed_at = claim::claimed_at(target)
            .or_else(|| claim::creation_timestamp(target))
            .unwrap_or(now);
        let max_expires_at =
            claimed_at + chrono::Duration::from_std(self.max_ttl).unwrap_or_default();
        if max_expires_at <= now {
            return Err(Error::MaxTtlReached);
        }

        let mut new_expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        if new_expires_at > max_expires_at {
            new_expires_at = max_expires_at;
        }

        let name = target.name_any();
        retry_on_conflict(DEFAULT_ATTEMPTS, "renew claim", || {
            let name = name.clone();
            async move {
                let Some(mut current) = bounded(self.claims.get(&name)).await? else {
                    return Err(Error::NotFound);
                };
                claim::set_expires_at(&mut current, new_expires_at);
                bounded(self.claims.update(&current)).await.map(|_| ())
            }
        })
        .await?;

        info!(claim = %name, expires_at = %claim::format_timestamp(new_expires_at), "renewed claim");
        Ok(new_expires_at)
    }

    /// Release a claim: delete it (owner references cascade to the
    /// materialized resources) and record its lifecycle observations.
    pub async fn release(&self, id: &str) -> Result<(), Error> {
        let claims = self.find_managed_claims_by_id(id).await?;

        for cm in &claims {
            match bounded(self.claims.delete(&cm.name_any())).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => return Err(Error::NotFound),
                Err(e) => return Err(e),
            }
            self.observe_release(cm, Utc::now());
        }

        self.metrics
            .claims_released_total
            .inc_by(claims.len() as u64);
        Ok(())
    }

    fn observe_release(&self, cm: &ConfigMap, now: DateTime<Utc>) {
        if let Some(total) = total_actual_seconds(cm, now) {
            self.metrics.claim_lifetime_duration_seconds.observe(total);
        }
        if let Some(expected) = expected_lifetime_seconds(cm) {
            self.metrics.claim_total_duration_seconds.observe(expected);
        }
        if let Some(idle) = idle_seconds(cm) {
            self.metrics.claim_idle_duration_seconds.observe(idle);
        }
        if let Some(usage) = usage_actual_seconds(cm, now) {
            self.metrics.claim_usage_duration_seconds.observe(usage);
        }
        if let Some(ratio) = lifetime_ratio(cm, now) {
            self.metrics.claim_lifetime_expected_ratio.observe(ratio);
        }
        if let Some(ratio) = usage_ratio(cm, now) {
            self.metrics.claim_usage_expected_ratio.observe(ratio);
        }
    }

    /// One filler pass: create pool claims until the target is met.
    ///
    /// Pool claims get the full max TTL and no claimed-at; their lazy
    /// resources stay unmaterialized until hand-out.
    pub async fn ensure_pre_provisioned(&self) -> Result<(), Error> {
        if self.pre_provision_count == 0 {
            return Ok(());
        }

        let claims = bounded(self.claims.list_managed()).await?;
        let current = claims
            .iter()
            .filter(|cm| claim::is_pre_provisioned(cm))
            .count();

        let missing = self.pre_provision_count.saturating_sub(current);
        for _ in 0..missing {
            let id = claim::new_claim_id();
            let expires_at =
                Utc::now() + chrono::Duration::from_std(self.max_ttl).unwrap_or_default();
            self.create_claim(&id, expires_at, true).await?;
            self.metrics.claims_preprovisioned_created_total.inc();
        }

        if missing > 0 {
            info!(created = missing, target = self.pre_provision_count, "refilled warm pool");
        }
        Ok(())
    }

    /// Long-lived filler task: runs a pass every 15 seconds and immediately
    /// after a hand-out consumes a pool entry.
    pub async fn run_pool_filler(self: Arc<Self>) {
        if self.pre_provision_count == 0 {
            return;
        }

        let mut ticker = tokio::time::interval(POOL_FILL_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.pool_refill.notified() => {}
            }
            if let Err(e) = self.ensure_pre_provisioned().await {
                warn!(error = %e, "warm pool refill failed");
            }
        }
    }
}

/// Anchor for idle/usage observations: the claimed-at annotation when
/// present, else the creation timestamp.
fn anchored_claimed_at(cm: &ConfigMap) -> Option<DateTime<Utc>> {
    claim::creation_timestamp(cm)?;
    claim::claimed_at(cm).or_else(|| claim::creation_timestamp(cm))
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 1000.0
}

/// Seconds the claim existed, creation to now.
fn total_actual_seconds(cm: &ConfigMap, now: DateTime<Utc>) -> Option<f64> {
    Some(seconds_between(claim::creation_timestamp(cm)?, now))
}

/// Expected lifetime in seconds, creation to expiry; None when non-positive.
fn expected_lifetime_seconds(cm: &ConfigMap) -> Option<f64> {
    let created = claim::creation_timestamp(cm)?;
    let expires = claim::expires_at(cm)?;
    let expected = (expires - created).num_milliseconds() as f64 / 1000.0;
    (expected > 0.0).then_some(expected)
}

/// Seconds the claim idled before hand-out.
fn idle_seconds(cm: &ConfigMap) -> Option<f64> {
    let created = claim::creation_timestamp(cm)?;
    Some(seconds_between(created, anchored_claimed_at(cm)?))
}

/// Seconds the claim spent in use, hand-out to now.
fn usage_actual_seconds(cm: &ConfigMap, now: DateTime<Utc>) -> Option<f64> {
    Some(seconds_between(anchored_claimed_at(cm)?, now))
}

/// Expected usage in seconds, hand-out to expiry; None when non-positive.
fn usage_expected_seconds(cm: &ConfigMap) -> Option<f64> {
    let claimed = anchored_claimed_at(cm)?;
    let expires = claim::expires_at(cm)?;
    let expected = (expires - claimed).num_milliseconds() as f64 / 1000.0;
    (expected > 0.0).then_some(expected)
}

/// Actual over expected lifetime.
fn lifetime_ratio(cm: &ConfigMap, now: DateTime<Utc>) -> Option<f64> {
    Some(total_actual_seconds(cm, now)? / expected_lifetime_seconds(cm)?)
}

/// Actual over expected usage.
fn usage_ratio(cm: &ConfigMap, now: DateTime<Utc>) -> Option<f64> {
    Some(usage_actual_seconds(cm, now)? / usage_expected_seconds(cm)?)
}
