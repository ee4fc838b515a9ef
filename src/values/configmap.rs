//! ConfigMap-backed values provider with a live watch.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::Api;
use kube::runtime::watcher;
use kube::Client;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::ValuesProvider;
use crate::Error;

#[derive(Default)]
struct Cached {
    data: Option<Vec<u8>>,
    owner: Option<OwnerReference>,
}

/// Values sourced from one key of a ConfigMap, refreshed on change.
///
/// The cache has a single writer (the watcher task); readers get deep copies.
pub struct ConfigMapValues {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
    key: String,
    cache: Arc<RwLock<Cached>>,
}

impl ConfigMapValues {
    /// Fetch the initial document; construction fails when the ConfigMap or
    /// key is missing or empty, so a misconfigured source is caught at boot.
    pub async fn new(
        client: Client,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Self, Error> {
        if namespace.is_empty() || name.is_empty() || key.is_empty() {
            return Err(Error::validation("namespace, name and key are required"));
        }

        let api: Api<ConfigMap> = Api::namespaced(client, namespace);
        let cm = api.get(name).await?;
        let cached = cached_from(&cm, key).ok_or_else(|| {
            Error::validation(format!(
                "configmap {namespace}/{name} key {key:?} not found or empty"
            ))
        })?;

        Ok(Self {
            api,
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
            cache: Arc::new(RwLock::new(cached)),
        })
    }
}

fn cached_from(cm: &ConfigMap, key: &str) -> Option<Cached> {
    let value = cm.data.as_ref()?.get(key)?;
    if value.trim().is_empty() {
        return None;
    }
    Some(Cached {
        data: Some(value.clone().into_bytes()),
        owner: owner_reference_from(cm),
    })
}

fn owner_reference_from(cm: &ConfigMap) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: "v1".to_string(),
        kind: "ConfigMap".to_string(),
        name: cm.metadata.name.clone()?,
        uid: cm.metadata.uid.clone()?,
        block_owner_deletion: Some(true),
        ..OwnerReference::default()
    })
}

#[async_trait]
impl ValuesProvider for ConfigMapValues {
    async fn start(&self) -> Result<(), Error> {
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let stream = watcher(self.api.clone(), config);
        let cache = self.cache.clone();
        let key = self.key.clone();
        let source = self.description();

        tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Apply(cm)) | Ok(watcher::Event::InitApply(cm)) => {
                        match cached_from(&cm, &key) {
                            Some(fresh) => {
                                *cache.write().await = fresh;
                                info!(source = %source, "values refreshed");
                            }
                            None => {
                                *cache.write().await = Cached::default();
                                warn!(source = %source, "values key missing or empty, cache cleared");
                            }
                        }
                    }
                    Ok(watcher::Event::Delete(_)) => {
                        *cache.write().await = Cached::default();
                        warn!(source = %source, "values source deleted, cache cleared");
                    }
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
                    Err(e) => {
                        warn!(source = %source, error = %e, "values watch error");
                    }
                }
            }
        });

        Ok(())
    }

    async fn values(&self) -> Result<Vec<u8>, Error> {
        let cache = self.cache.read().await;
        cache.data.clone().ok_or_else(|| {
            Error::validation(format!(
                "no values available in configmap {}/{} key {}",
                self.namespace, self.name, self.key
            ))
        })
    }

    async fn owner_reference(&self) -> Option<OwnerReference> {
        self.cache.read().await.owner.clone()
    }

    fn description(&self) -> String {
        format!("configmap:{}/{}#{}", self.namespace, self.name, self.key)
    }
}
