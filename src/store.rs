//! Declarative object store
//!
//! The harness talks to the Kubernetes API only through [`ObjectStore`]: the
//! driver and the poller never see a `kube::Api`, so tests can substitute an
//! in-memory store that plays the reconciler.

use std::fmt::Debug;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{Error, Result};

/// CRUD over one kind of object in one scope (a namespace, or the cluster)
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Create the object; fails if it already exists
    async fn create(&self, obj: &K) -> Result<K>;

    /// Fetch by name; `Ok(None)` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<K>>;

    /// Apply a JSON merge patch to the object
    async fn patch(&self, name: &str, patch: &serde_json::Value) -> Result<K>;

    /// Apply a JSON merge patch to the status subresource
    async fn patch_status(&self, name: &str, patch: &serde_json::Value) -> Result<K>;

    /// Request deletion
    async fn delete(&self, name: &str) -> Result<()>;

    /// Request deletion, treating an absent object as already deleted
    async fn delete_ignoring_not_found(&self, name: &str) -> Result<()> {
        match self.delete(name).await {
            Err(e) if e.is_not_found() => {
                debug!(name = %name, "Object already gone");
                Ok(())
            }
            other => other,
        }
    }

    /// Create the object unless one with the same name exists
    async fn create_if_absent(&self, obj: &K) -> Result<()> {
        match self.create(obj).await {
            Ok(_) => Ok(()),
            Err(Error::Kube(kube::Error::Api(resp))) if resp.code == 409 => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// JSON merge patch that turns `old` into `new`
///
/// Keys present in `old` but missing from `new` become `null`, so applying the
/// patch removes them instead of merging around them.
pub fn merge_patch_between(old: &serde_json::Value, new: &serde_json::Value) -> serde_json::Value {
    match (old, new) {
        (serde_json::Value::Object(o), serde_json::Value::Object(n)) => {
            let mut patch = serde_json::Map::new();
            for key in o.keys().filter(|k| !n.contains_key(*k)) {
                patch.insert(key.clone(), serde_json::Value::Null);
            }
            for (key, value) in n {
                match o.get(key) {
                    Some(previous) if previous == value => {}
                    Some(previous) => {
                        patch.insert(key.clone(), merge_patch_between(previous, value));
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            serde_json::Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// [`ObjectStore`] backed by a `kube::Api`
pub struct KubeObjectStore<K> {
    api: Api<K>,
}

impl<K> KubeObjectStore<K> {
    /// Wrap an API handle; its scope decides which objects the store sees
    pub fn new(api: Api<K>) -> Self {
        Self { api }
    }
}

const FIELD_MANAGER: &str = "infra-harness";

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeObjectStore<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn create(&self, obj: &K) -> Result<K> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn patch(&self, name: &str, patch: &serde_json::Value) -> Result<K> {
        Ok(self
            .api
            .patch(name, &patch_params(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status(&self, name: &str, patch: &serde_json::Value) -> Result<K> {
        Ok(self
            .api
            .patch_status(name, &patch_params(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }
}
