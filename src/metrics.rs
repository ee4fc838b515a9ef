//! Prometheus metrics for the claim lifecycle.
//!
//! One [`Metrics`] struct owns the registry and every collector; the API and
//! reconciler share it through an `Arc`. Histogram buckets for lifetime and
//! total duration are derived from the configured TTLs, so the struct is
//! built after configuration resolution.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Fixed buckets for the actual/expected ratio histograms.
const RATIO_BUCKETS: [f64; 13] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0, 1.1, 2.0, 3.0];

/// All claim-controller collectors, registered into one registry.
pub struct Metrics {
    registry: Registry,

    /// Claims successfully created (on-demand or pool hand-out)
    pub claims_created_total: IntCounter,
    /// Claims created on demand, outside the warm pool
    pub claims_created_ondemand_total: IntCounter,
    /// Warm-pool claims created by the filler
    pub claims_preprovisioned_created_total: IntCounter,
    /// Warm-pool claims handed out to acquirers
    pub claims_reused_preprovisioned_total: IntCounter,
    /// Claims released through the API
    pub claims_released_total: IntCounter,
    /// Acquires that timed out waiting for readiness
    pub timedout_claims_total: IntCounter,

    /// Managed claims currently present
    pub active_claims: IntGauge,
    /// Managed resources currently present
    pub active_resources: IntGauge,

    /// Seconds from claim creation to ready
    pub claim_ready_duration_seconds: Histogram,
    /// Claim lifetime in seconds from creation to release
    pub claim_lifetime_duration_seconds: Histogram,
    /// Configured total duration in seconds from creation to expiry
    pub claim_total_duration_seconds: Histogram,
    /// Seconds a claim idled in the pool before hand-out
    pub claim_idle_duration_seconds: Histogram,
    /// Seconds from hand-out to release
    pub claim_usage_duration_seconds: Histogram,
    /// Actual lifetime over expected lifetime at release
    pub claim_lifetime_expected_ratio: Histogram,
    /// Actual usage over expected usage at release
    pub claim_usage_expected_ratio: Histogram,
}

impl Metrics {
    /// Build and register every collector.
    pub fn new(default_ttl: Duration, max_ttl: Duration) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let claims_created_total = counter(
            &registry,
            "claim_controller_claims_created_total",
            "Total number of claims successfully created.",
        )?;
        let claims_created_ondemand_total = counter(
            &registry,
            "claim_controller_claims_created_ondemand_total",
            "Total number of claims created on demand.",
        )?;
        let claims_preprovisioned_created_total = counter(
            &registry,
            "claim_controller_claims_preprovisioned_created_total",
            "Total number of pre-provisioned claims created by the pool filler.",
        )?;
        let claims_reused_preprovisioned_total = counter(
            &registry,
            "claim_controller_claims_reused_preprovisioned_total",
            "Total number of pre-provisioned claims handed out.",
        )?;
        let claims_released_total = counter(
            &registry,
            "claim_controller_claims_released_total",
            "Total number of claims successfully released.",
        )?;
        let timedout_claims_total = counter(
            &registry,
            "claim_controller_timedout_claims_total",
            "Total number of claims that timed out waiting for readiness.",
        )?;
        let active_claims = gauge(
            &registry,
            "claim_controller_active_claims",
            "Number of managed claims currently present.",
        )?;
        let active_resources = gauge(
            &registry,
            "claim_controller_active_resources",
            "Number of managed resources currently present.",
        )?;
        let claim_ready_duration_seconds = histogram(
            &registry,
            "claim_controller_claim_ready_duration_seconds",
            "Time in seconds from claim creation to healthy state.",
            exponential_buckets(1.0, 2.0, 8)?,
        )?;
        let claim_lifetime_duration_seconds = histogram(
            &registry,
            "claim_controller_claim_lifetime_duration_seconds",
            "Claim lifetime in seconds from creation to release.",
            equal_width_buckets(default_ttl),
        )?;
        let claim_total_duration_seconds = histogram(
            &registry,
            "claim_controller_claim_total_duration_seconds",
            "Configured total claim duration in seconds from creation to expiration.",
            minute_step_buckets(max_ttl),
        )?;
        let claim_idle_duration_seconds = histogram(
            &registry,
            "claim_controller_claim_idle_duration_seconds",
            "Seconds a claim spent pre-provisioned before hand-out.",
            equal_width_buckets(max_ttl),
        )?;
        let claim_usage_duration_seconds = histogram(
            &registry,
            "claim_controller_claim_usage_duration_seconds",
            "Seconds from claim hand-out to release.",
            equal_width_buckets(default_ttl),
        )?;
        let claim_lifetime_expected_ratio = histogram(
            &registry,
            "claim_controller_claim_lifetime_expected_ratio",
            "Ratio between actual claim lifetime and expected lifetime at deletion.",
            RATIO_BUCKETS.to_vec(),
        )?;
        let claim_usage_expected_ratio = histogram(
            &registry,
            "claim_controller_claim_usage_expected_ratio",
            "Ratio between actual claim usage and expected usage at deletion.",
            RATIO_BUCKETS.to_vec(),
        )?;

        Ok(Self {
            registry,
            claims_created_total,
            claims_created_ondemand_total,
            claims_preprovisioned_created_total,
            claims_reused_preprovisioned_total,
            claims_released_total,
            timedout_claims_total,
            active_claims,
            active_resources,
            claim_ready_duration_seconds,
            claim_lifetime_duration_seconds,
            claim_total_duration_seconds,
            claim_idle_duration_seconds,
            claim_usage_duration_seconds,
            claim_lifetime_expected_ratio,
            claim_usage_expected_ratio,
        })
    }

    /// Encode every collector in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not utf-8: {e}")))
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: Vec<f64>,
) -> Result<Histogram, prometheus::Error> {
    let h = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))?;
    registry.register(Box::new(h.clone()))?;
    Ok(h)
}

/// Ten equal-width buckets from `ttl/10` to `ttl` seconds.
///
/// A non-positive ttl falls back to 180 seconds so the histogram is still
/// usable when misconfigured.
fn equal_width_buckets(ttl: Duration) -> Vec<f64> {
    let mut ttl_seconds = ttl.as_secs_f64();
    if ttl_seconds <= 0.0 {
        ttl_seconds = 180.0;
    }

    const MAX_BUCKETS: usize = 10;
    let mut buckets: Vec<f64> = (1..=MAX_BUCKETS)
        .map(|i| ttl_seconds * i as f64 / MAX_BUCKETS as f64)
        .collect();
    buckets.dedup();
    buckets
}

/// One-minute steps up to `max_ttl` seconds, always ending at the cap.
fn minute_step_buckets(max_ttl: Duration) -> Vec<f64> {
    let max_seconds = if max_ttl.is_zero() {
        600.0
    } else {
        max_ttl.as_secs_f64()
    };

    let mut buckets = Vec::new();
    let mut bucket = 60.0;
    while bucket <= max_seconds {
        buckets.push(bucket);
        bucket += 60.0;
    }
    if buckets.last().copied().unwrap_or(0.0) < max_seconds {
        buckets.push(max_seconds);
    }
    buckets
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> axum::response::Response {
    match metrics.render() {
        Ok(body) => axum::response::Response::builder()
            .header("content-type", "text/plain; version=0.0.4")
            .body(body.into())
            .unwrap_or_default(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            axum::response::Response::builder()
                .status(500)
                .body("metrics encoding failed".into())
                .unwrap_or_default()
        }
    }
}

/// Router serving `GET /metrics` in the Prometheus text format.
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_width_buckets_cover_the_ttl() {
        let buckets = equal_width_buckets(Duration::from_secs(180));
        assert_eq!(buckets.len(), 10);
        assert_eq!(buckets[0], 18.0);
        assert_eq!(buckets[9], 180.0);
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn equal_width_buckets_fall_back_when_ttl_is_zero() {
        let buckets = equal_width_buckets(Duration::ZERO);
        assert_eq!(buckets.last().copied(), Some(180.0));
    }

    #[test]
    fn minute_steps_end_at_the_cap() {
        let buckets = minute_step_buckets(Duration::from_secs(600));
        assert_eq!(buckets.len(), 10);
        assert_eq!(buckets[0], 60.0);
        assert_eq!(buckets[9], 600.0);

        // a cap off the minute grid still appears as the final bucket
        let buckets = minute_step_buckets(Duration::from_secs(90));
        assert_eq!(buckets, vec![60.0, 90.0]);
    }

    #[test]
    fn all_collectors_register_and_render() {
        let metrics =
            Metrics::new(Duration::from_secs(180), Duration::from_secs(600)).unwrap();
        metrics.claims_created_total.inc();
        metrics.active_claims.set(3);
        metrics.claim_ready_duration_seconds.observe(2.5);

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("claim_controller_claims_created_total 1"));
        assert!(rendered.contains("claim_controller_active_claims 3"));
        assert!(rendered.contains("claim_controller_claim_ready_duration_seconds_bucket"));
        assert!(rendered.contains("claim_controller_claim_usage_expected_ratio_bucket"));
    }
}
