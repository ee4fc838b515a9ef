//! Configuration resolution for the claim controller.
//!
//! Options are resolved with the precedence CLI flag > environment variable >
//! config-file field > built-in default. The env fallbacks ride on clap's
//! `env` support; the config file supplies defaults for anything the command
//! line and environment leave unset.

use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::Error;

/// Built-in defaults, applied when neither CLI, env, nor config file set a value.
pub mod defaults {
    use std::time::Duration;

    /// Watched/managed namespace
    pub const NAMESPACE: &str = "default";
    /// Resource template file
    pub const TEMPLATE_PATH: &str = "config/template/resources.yaml";
    /// Values file for the file provider
    pub const VALUES_PATH: &str = "/values/values.yaml";
    /// Claim API listen address
    pub const API_ADDR: &str = "0.0.0.0:8080";
    /// Metrics listen address
    pub const METRICS_ADDR: &str = "0.0.0.0:8081";
    /// Health probe listen address
    pub const PROBE_ADDR: &str = "0.0.0.0:8082";
    /// TTL applied to acquires that do not request one
    pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
    /// Absolute cap on expires-at, anchored at claimed-at
    pub const MAX_TTL: Duration = Duration::from_secs(10 * 60);
    /// Periodic requeue bound for the reconciler
    pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
}

/// Claim controller - namespaced leasing of templated Kubernetes workloads
#[derive(Parser, Debug, Default)]
#[command(name = "claim-controller", version, about, long_about = None)]
pub struct Cli {
    /// Path to a YAML config file supplying defaults
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<String>,

    /// Namespace watched and managed by the controller
    #[arg(long, env = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Path to the resource template file
    #[arg(long, env = "TEMPLATE_PATH")]
    pub template_path: Option<String>,

    /// Path to the values file (file provider)
    #[arg(long, env = "VALUES_PATH")]
    pub values_path: Option<String>,

    /// ConfigMap name containing the values document
    #[arg(long, env = "VALUES_CONFIGMAP_NAME")]
    pub values_configmap_name: Option<String>,

    /// ConfigMap data key containing the values document
    #[arg(long, env = "VALUES_CONFIGMAP_KEY")]
    pub values_configmap_key: Option<String>,

    /// Claim API listen address
    #[arg(long, env = "API_ADDR")]
    pub api_addr: Option<String>,

    /// Metrics listen address
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// Health probe listen address
    #[arg(long = "health-probe-addr", env = "PROBE_ADDR")]
    pub probe_addr: Option<String>,

    /// Default claim lifetime (Go-style duration, e.g. "10m")
    #[arg(long, env = "DEFAULT_TTL", value_parser = parse_duration)]
    pub default_ttl: Option<Duration>,

    /// Maximum claim lifetime from claimed-at (never below default-ttl)
    #[arg(long, env = "MAX_TTL", value_parser = parse_duration)]
    pub max_ttl: Option<Duration>,

    /// Controller periodic reconcile interval
    #[arg(long, env = "RECONCILE_INTERVAL", value_parser = parse_duration)]
    pub reconcile_interval: Option<Duration>,

    /// Warm-pool target: number of claims kept pre-provisioned
    #[arg(long, env = "PRE_PROVISION_CLAIMS_COUNT")]
    pub pre_provision_claims_count: Option<usize>,
}

/// Config-file schema. Every field is optional; set fields act as defaults
/// below CLI flags and environment variables.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    /// Watched namespace
    pub namespace: Option<String>,
    /// Resource template path
    pub template_path: Option<String>,
    /// Values file path
    pub values_path: Option<String>,
    /// Values ConfigMap name
    pub values_configmap_name: Option<String>,
    /// Values ConfigMap key
    pub values_configmap_key: Option<String>,
    /// API listen address
    pub api_addr: Option<String>,
    /// Metrics listen address
    pub metrics_addr: Option<String>,
    /// Probe listen address
    pub probe_addr: Option<String>,
    /// Default TTL as a duration string
    pub default_ttl: Option<String>,
    /// Max TTL as a duration string
    pub max_ttl: Option<String>,
    /// Reconcile interval as a duration string
    pub reconcile_interval: Option<String>,
    /// Warm-pool target
    pub pre_provision_claims_count: Option<usize>,
}

impl FileConfig {
    /// Load the config file at `path`, or an empty config when `path` is None.
    pub fn load(path: Option<&str>) -> Result<Self, Error> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::validation(format!("read config file {path}: {e}")))?;
        serde_yaml::from_str(&data)
            .map_err(|e| Error::validation(format!("parse config file {path}: {e}")))
    }
}

/// Fully resolved runtime settings.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Watched/managed namespace
    pub namespace: String,
    /// Resource template path
    pub template_path: String,
    /// Values file path
    pub values_path: String,
    /// Values ConfigMap name (empty disables the configmap provider)
    pub values_configmap_name: String,
    /// Values ConfigMap key
    pub values_configmap_key: String,
    /// API listen address
    pub api_addr: String,
    /// Metrics listen address
    pub metrics_addr: String,
    /// Probe listen address
    pub probe_addr: String,
    /// TTL for acquires that do not request one
    pub default_ttl: Duration,
    /// Absolute expires-at cap from claimed-at
    pub max_ttl: Duration,
    /// Periodic requeue bound
    pub reconcile_interval: Duration,
    /// Warm-pool target
    pub pre_provision_claims_count: usize,
}

impl Settings {
    /// Resolve settings from parsed CLI args and the optional config file.
    ///
    /// max-ttl is floored at default-ttl so the cap can never reject a
    /// default-length acquire.
    pub fn resolve(cli: Cli, file: FileConfig) -> Result<Self, Error> {
        let default_ttl = match (cli.default_ttl, file.default_ttl.as_deref()) {
            (Some(d), _) => d,
            (None, Some(s)) => parse_duration(s)?,
            (None, None) => defaults::DEFAULT_TTL,
        };
        let mut max_ttl = match (cli.max_ttl, file.max_ttl.as_deref()) {
            (Some(d), _) => d,
            (None, Some(s)) => parse_duration(s)?,
            (None, None) => defaults::MAX_TTL,
        };
        if max_ttl < default_ttl {
            max_ttl = default_ttl;
        }
        let reconcile_interval = match (cli.reconcile_interval, file.reconcile_interval.as_deref())
        {
            (Some(d), _) => d,
            (None, Some(s)) => parse_duration(s)?,
            (None, None) => defaults::RECONCILE_INTERVAL,
        };

        Ok(Self {
            namespace: pick(cli.namespace, file.namespace, defaults::NAMESPACE),
            template_path: pick(cli.template_path, file.template_path, defaults::TEMPLATE_PATH),
            values_path: pick(cli.values_path, file.values_path, defaults::VALUES_PATH),
            values_configmap_name: pick(cli.values_configmap_name, file.values_configmap_name, ""),
            values_configmap_key: pick(cli.values_configmap_key, file.values_configmap_key, ""),
            api_addr: pick(cli.api_addr, file.api_addr, defaults::API_ADDR),
            metrics_addr: pick(cli.metrics_addr, file.metrics_addr, defaults::METRICS_ADDR),
            probe_addr: pick(cli.probe_addr, file.probe_addr, defaults::PROBE_ADDR),
            default_ttl,
            max_ttl,
            reconcile_interval,
            pre_provision_claims_count: cli
                .pre_provision_claims_count
                .or(file.pre_provision_claims_count)
                .unwrap_or(0),
        })
    }
}

fn pick(cli: Option<String>, file: Option<String>, fallback: &str) -> String {
    cli.or(file).unwrap_or_else(|| fallback.to_string())
}

/// Parse a Go-style duration string: one or more `<n><unit>` segments with
/// units `ns`, `us`, `ms`, `s`, `m`, `h` (e.g. "90s", "1h30m", "250ms").
pub fn parse_duration(s: &str) -> Result<Duration, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation("duration cannot be empty"));
    }

    let mut total = Duration::ZERO;
    let mut remaining = s;

    while !remaining.is_empty() {
        let num_end = remaining
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(remaining.len());
        if num_end == 0 {
            return Err(Error::validation(format!(
                "invalid duration '{s}': expected a number"
            )));
        }
        let value: u64 = remaining[..num_end]
            .parse()
            .map_err(|_| Error::validation(format!("invalid number in duration '{s}'")))?;
        remaining = &remaining[num_end..];

        let (unit, rest) = if let Some(rest) = remaining.strip_prefix("ns") {
            (Duration::from_nanos(1), rest)
        } else if let Some(rest) = remaining.strip_prefix("us") {
            (Duration::from_micros(1), rest)
        } else if let Some(rest) = remaining.strip_prefix("ms") {
            (Duration::from_millis(1), rest)
        } else if let Some(rest) = remaining.strip_prefix('s') {
            (Duration::from_secs(1), rest)
        } else if let Some(rest) = remaining.strip_prefix('m') {
            (Duration::from_secs(60), rest)
        } else if let Some(rest) = remaining.strip_prefix('h') {
            (Duration::from_secs(3600), rest)
        } else {
            return Err(Error::validation(format!(
                "invalid duration '{s}': missing unit suffix (ns/us/ms/s/m/h)"
            )));
        };

        let value = u32::try_from(value)
            .map_err(|_| Error::validation(format!("duration value too large in '{s}'")))?;
        total += unit * value;
        remaining = rest;
    }

    Ok(total)
}
