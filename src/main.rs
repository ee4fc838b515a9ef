//! Claim controller binary: HTTP API, reconciler, and warm-pool filler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use claim_controller::api::{api_router, probe_router, ClaimService};
use claim_controller::claim::{MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE};
use claim_controller::config::{Cli, FileConfig, Settings};
use claim_controller::controller::{error_policy, reconcile, Context};
use claim_controller::metrics::{metrics_router, Metrics};
use claim_controller::platform::{ClaimStore, KubeClaimStore, KubeResourceClient, ResourceClient};
use claim_controller::values::{ConfigMapValues, FileValues, ValuesProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let file = FileConfig::load(cli.config.as_deref()).context("load config file")?;
    let settings = Settings::resolve(cli, file).context("resolve configuration")?;

    tracing::info!(
        namespace = %settings.namespace,
        api_addr = %settings.api_addr,
        metrics_addr = %settings.metrics_addr,
        template_path = %settings.template_path,
        default_ttl = ?settings.default_ttl,
        max_ttl = ?settings.max_ttl,
        pool_target = settings.pre_provision_claims_count,
        "claim controller starting"
    );

    let client = Client::try_default()
        .await
        .context("create Kubernetes client")?;

    let metrics = Arc::new(
        Metrics::new(settings.default_ttl, settings.max_ttl).context("register metrics")?,
    );

    // A usable values source is a hard startup requirement.
    let values = resolve_values_provider(client.clone(), &settings).await?;
    values.start().await.context("start values provider")?;

    let claim_store: Arc<dyn ClaimStore> =
        Arc::new(KubeClaimStore::new(client.clone(), &settings.namespace));
    let resource_client: Arc<dyn ResourceClient> = Arc::new(KubeResourceClient::new(client.clone()));

    let service = Arc::new(ClaimService::new(
        claim_store.clone(),
        values,
        metrics.clone(),
        settings.namespace.clone(),
        settings.template_path.clone(),
        settings.default_ttl,
        settings.max_ttl,
        settings.pre_provision_claims_count,
    ));

    // Shutdown fan-out: one signal watcher, every server drains on it.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let api_server = spawn_server(
        &settings.api_addr,
        api_router(service.clone()),
        shutdown_rx.clone(),
    )
    .await
    .context("bind claim API listener")?;
    let metrics_server = spawn_server(
        &settings.metrics_addr,
        metrics_router(metrics.clone()),
        shutdown_rx.clone(),
    )
    .await
    .context("bind metrics listener")?;
    let probe_server = spawn_server(&settings.probe_addr, probe_router(), shutdown_rx.clone())
        .await
        .context("bind probe listener")?;

    tokio::spawn(service.clone().run_pool_filler());

    let ctx = Arc::new(Context {
        claims: claim_store,
        resources: resource_client,
        namespace: settings.namespace.clone(),
        default_ttl: settings.default_ttl,
        reconcile_interval: settings.reconcile_interval,
        metrics,
    });

    let claims: Api<ConfigMap> = Api::namespaced(client, &settings.namespace);
    let selector = format!("{MANAGED_BY_LABEL_KEY}={MANAGED_BY_LABEL_VALUE}");

    tracing::info!("starting claim controller manager");
    Controller::new(claims, WatcherConfig::default().labels(&selector))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "reconciliation error"),
            }
        })
        .await;

    // The controller stops on the same signal the servers drain on; give the
    // HTTP side up to ten seconds to finish in-flight requests.
    let drain = async {
        let _ = api_server.await;
        let _ = metrics_server.await;
        let _ = probe_server.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("server drain exceeded 10s, exiting anyway");
    }

    tracing::info!("claim controller shut down");
    Ok(())
}

/// Pick the values provider: a reachable ConfigMap source wins, the values
/// file is the fallback, and having neither is fatal.
async fn resolve_values_provider(
    client: Client,
    settings: &Settings,
) -> anyhow::Result<Arc<dyn ValuesProvider>> {
    if !settings.values_configmap_name.is_empty() && !settings.values_configmap_key.is_empty() {
        match ConfigMapValues::new(
            client,
            &settings.namespace,
            &settings.values_configmap_name,
            &settings.values_configmap_key,
        )
        .await
        {
            Ok(provider) => {
                tracing::info!(source = %provider.description(), "using configmap values provider");
                return Ok(Arc::new(provider));
            }
            Err(e) => {
                tracing::warn!(error = %e, "configmap values provider unavailable, falling back");
            }
        }
    }

    if !settings.values_path.is_empty() {
        let provider = FileValues::new(&settings.values_path).context("read values file")?;
        tracing::info!(source = %provider.description(), "using file values provider");
        return Ok(Arc::new(provider));
    }

    anyhow::bail!("no valid values provider found, please provide either configmap or file values")
}

async fn spawn_server(
    addr: &str,
    router: axum::Router,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "listening");
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped");
        }
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
