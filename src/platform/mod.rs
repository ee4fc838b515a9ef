//! Platform adapter (C1): typed access to the orchestrator.
//!
//! Two narrow traits cover everything the core needs: [`ClaimStore`] for the
//! claim ConfigMaps and [`ResourceClient`] for the materialized resources
//! (dynamic objects resolved through API discovery). Both are trait objects
//! so the reconciler and HTTP service can run against mocks in tests.
//!
//! Watching is not part of the adapter: the controller runtime drives a
//! label-filtered watcher itself, so only managed objects ever surface.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::{pinned_kind, Scope};
use kube::{Client, ResourceExt};
use tokio::sync::RwLock;

#[cfg(test)]
use mockall::automock;

use crate::claim::{CLAIM_ID_LABEL_KEY, MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE};
use crate::Error;

/// Swallow not-found errors, the cascade-delete convention.
pub fn ignore_not_found<T>(result: Result<T, Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// CRUD over the claim ConfigMaps in the managed namespace.
///
/// `update` carries optimistic concurrency: the object's resourceVersion is
/// sent as-is and a lost race surfaces as [`Error::Conflict`] so callers can
/// re-read and retry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Fetch one claim by name; `None` when absent.
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, Error>;
    /// List every claim carrying the managed-by marker.
    async fn list_managed(&self) -> Result<Vec<ConfigMap>, Error>;
    /// List claims carrying the given claim-id label.
    async fn list_by_id(&self, id: &str) -> Result<Vec<ConfigMap>, Error>;
    /// Create a claim.
    async fn create(&self, claim: &ConfigMap) -> Result<ConfigMap, Error>;
    /// Replace a claim, losing to concurrent writers with a conflict.
    async fn update(&self, claim: &ConfigMap) -> Result<ConfigMap, Error>;
    /// Delete a claim by name.
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

/// Dynamic access to materialized resources of any group/version/kind.
///
/// An empty `namespace` means cluster-scoped, the ObjectKey convention.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Resolve whether a kind is namespaced or cluster-scoped.
    async fn resolve_scope(&self, api_version: &str, kind: &str) -> Result<Scope, Error>;
    /// Fetch a live object; `None` when absent.
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;
    /// Create a resource from its rendered document.
    async fn create(&self, namespace: &str, resource: &serde_json::Value) -> Result<(), Error>;
    /// Delete a resource by coordinates.
    async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error>;
}

/// Split an apiVersion into (group, version); core resources have no group.
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn classify(err: kube::Error) -> Error {
    if let kube::Error::Api(ae) = &err {
        if ae.code == 409 {
            return Error::conflict(ae.message.clone());
        }
    }
    Error::Kube(err)
}

/// Claim store backed by a namespaced `Api<ConfigMap>`.
pub struct KubeClaimStore {
    api: Api<ConfigMap>,
}

impl KubeClaimStore {
    /// Create a store over the given namespace.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    async fn list_labeled(&self, selector: &str) -> Result<Vec<ConfigMap>, Error> {
        let params = ListParams::default().labels(selector);
        let list = self.api.list(&params).await.map_err(classify)?;
        Ok(list.items)
    }
}

#[async_trait]
impl ClaimStore for KubeClaimStore {
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, Error> {
        self.api.get_opt(name).await.map_err(classify)
    }

    async fn list_managed(&self) -> Result<Vec<ConfigMap>, Error> {
        self.list_labeled(&format!("{MANAGED_BY_LABEL_KEY}={MANAGED_BY_LABEL_VALUE}"))
            .await
    }

    async fn list_by_id(&self, id: &str) -> Result<Vec<ConfigMap>, Error> {
        self.list_labeled(&format!("{CLAIM_ID_LABEL_KEY}={id}")).await
    }

    async fn create(&self, claim: &ConfigMap) -> Result<ConfigMap, Error> {
        self.api
            .create(&PostParams::default(), claim)
            .await
            .map_err(classify)
    }

    async fn update(&self, claim: &ConfigMap) -> Result<ConfigMap, Error> {
        let name = claim
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("claim update requires a name"))?;
        self.api
            .replace(name, &PostParams::default(), claim)
            .await
            .map_err(classify)
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

/// Resource client backed by API discovery and dynamic object APIs.
///
/// Discovery results are cached per (apiVersion, kind); the set of kinds a
/// template renders is small and stable.
pub struct KubeResourceClient {
    client: Client,
    cache: RwLock<HashMap<(String, String), (ApiResource, Scope)>>,
}

impl KubeResourceClient {
    /// Create a resource client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, Scope), Error> {
        let key = (api_version.to_string(), kind.to_string());
        if let Some(found) = self.cache.read().await.get(&key) {
            return Ok(found.clone());
        }

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, capabilities) = pinned_kind(&self.client, &gvk).await.map_err(Error::Kube)?;
        let entry = (resource, capabilities.scope);
        self.cache.write().await.insert(key, entry.clone());
        Ok(entry)
    }

    fn dynamic_api(&self, resource: &ApiResource, scope: &Scope, namespace: &str) -> Api<DynamicObject> {
        match scope {
            Scope::Namespaced if !namespace.is_empty() => {
                Api::namespaced_with(self.client.clone(), namespace, resource)
            }
            _ => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn resolve_scope(&self, api_version: &str, kind: &str) -> Result<Scope, Error> {
        let (_, scope) = self.resolve(api_version, kind).await?;
        Ok(scope)
    }

    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let (resource, scope) = self.resolve(api_version, kind).await?;
        self.dynamic_api(&resource, &scope, namespace)
            .get_opt(name)
            .await
            .map_err(classify)
    }

    async fn create(&self, namespace: &str, resource: &serde_json::Value) -> Result<(), Error> {
        let api_version = resource["apiVersion"].as_str().unwrap_or_default();
        let kind = resource["kind"].as_str().unwrap_or_default();
        let (api_resource, scope) = self.resolve(api_version, kind).await?;

        let obj: DynamicObject = serde_json::from_value(resource.clone())
            .map_err(|e| Error::serialization(format!("decode rendered resource: {e}")))?;
        let api = self.dynamic_api(&api_resource, &scope, namespace);
        api.create(&PostParams::default(), &obj)
            .await
            .map_err(classify)?;

        tracing::info!(kind = %kind, name = %obj.name_any(), "created resource");
        Ok(())
    }

    async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let (resource, scope) = self.resolve(api_version, kind).await?;
        self.dynamic_api(&resource, &scope, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(classify)
    }
}
