//! Scenario bodies
//!
//! Each scenario provisions its prerequisites, drives one extension object
//! through its lifecycle and verifies the outcome against the provider. The
//! bodies only see an [`Environment`]: the provider, a factory for
//! namespace-scoped object stores, and the harness configuration.

pub mod bastion;
pub mod infrastructure;

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::api::Api;
use kube::Client;

pub use bastion::run_bastion;
pub use infrastructure::{run_infrastructure, InfrastructureCase, NetworkSource};

use crate::config::HarnessConfig;
use crate::crd::{Bastion, Cluster, Infrastructure};
use crate::driver::Prerequisites;
use crate::provider::NetworkProvider;
use crate::store::{KubeObjectStore, ObjectStore};

/// Hands out object stores scoped to a scenario's namespace
pub trait StoreFactory: Send + Sync {
    /// Stores for the objects created before the extension object
    fn prerequisites(&self, namespace: &str) -> Prerequisites;

    /// `Infrastructure` objects in `namespace`
    fn infrastructures(&self, namespace: &str) -> Arc<dyn ObjectStore<Infrastructure>>;

    /// `Bastion` objects in `namespace`
    fn bastions(&self, namespace: &str) -> Arc<dyn ObjectStore<Bastion>>;
}

/// [`StoreFactory`] over a live Kubernetes API
pub struct KubeStores {
    client: Client,
}

impl KubeStores {
    /// Use `client` for every store
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl StoreFactory for KubeStores {
    fn prerequisites(&self, namespace: &str) -> Prerequisites {
        Prerequisites {
            namespaces: Arc::new(KubeObjectStore::new(Api::<Namespace>::all(self.client.clone()))),
            clusters: Arc::new(KubeObjectStore::new(Api::<Cluster>::all(self.client.clone()))),
            secrets: Arc::new(KubeObjectStore::new(Api::<Secret>::namespaced(
                self.client.clone(),
                namespace,
            ))),
            priority_classes: Arc::new(KubeObjectStore::new(Api::<PriorityClass>::all(
                self.client.clone(),
            ))),
        }
    }

    fn infrastructures(&self, namespace: &str) -> Arc<dyn ObjectStore<Infrastructure>> {
        Arc::new(KubeObjectStore::new(Api::namespaced(
            self.client.clone(),
            namespace,
        )))
    }

    fn bastions(&self, namespace: &str) -> Arc<dyn ObjectStore<Bastion>> {
        Arc::new(KubeObjectStore::new(Api::namespaced(
            self.client.clone(),
            namespace,
        )))
    }
}

/// What every scenario body runs against
#[derive(Clone)]
pub struct Environment {
    /// Harness configuration
    pub config: HarnessConfig,
    /// Provider API
    pub provider: Arc<dyn NetworkProvider>,
    /// Kubernetes object stores
    pub stores: Arc<dyn StoreFactory>,
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`StoreFactory`] shared by the scenario tests

    use super::*;
    use crate::store::memory::MemoryStore;

    /// One shared in-memory store per kind, whatever the namespace
    #[derive(Clone, Default)]
    pub(crate) struct MemoryStores {
        pub(crate) namespaces: Arc<MemoryStore<Namespace>>,
        pub(crate) clusters: Arc<MemoryStore<Cluster>>,
        pub(crate) secrets: Arc<MemoryStore<Secret>>,
        pub(crate) priority_classes: Arc<MemoryStore<PriorityClass>>,
        pub(crate) infrastructures: Arc<MemoryStore<Infrastructure>>,
        pub(crate) bastions: Arc<MemoryStore<Bastion>>,
    }

    impl StoreFactory for MemoryStores {
        fn prerequisites(&self, _namespace: &str) -> Prerequisites {
            Prerequisites {
                namespaces: self.namespaces.clone(),
                clusters: self.clusters.clone(),
                secrets: self.secrets.clone(),
                priority_classes: self.priority_classes.clone(),
            }
        }

        fn infrastructures(&self, _namespace: &str) -> Arc<dyn ObjectStore<Infrastructure>> {
            self.infrastructures.clone()
        }

        fn bastions(&self, _namespace: &str) -> Arc<dyn ObjectStore<Bastion>> {
            self.bastions.clone()
        }
    }
}
