//! Extension object definitions
//!
//! The objects the harness submits to the reconciler (`Infrastructure`,
//! `Bastion`), the cluster-scoped context they depend on (`Cluster`), and the
//! OpenStack payloads that travel inside their opaque fields.

mod bastion;
mod cluster;
mod infrastructure;
pub mod openstack;
mod types;

use kube::core::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use bastion::{Bastion, BastionIngressPolicy, BastionSpec, BastionStatus};
pub use cluster::{Cluster, ClusterSpec};
pub use infrastructure::{Infrastructure, InfrastructureSpec};
pub use types::{ExtensionStatus, LastError, LastOperation, LastOperationState, LastOperationType};

/// A namespaced object reconciled by a Gardener extension
///
/// The driver and the readiness predicates work on any implementor.
pub trait ExtensionObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + std::fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// The common status block, once the reconciler has written one
    fn extension_status(&self) -> Option<&ExtensionStatus>;

    /// `Kind namespace/name` for logs and error messages
    fn describe(&self) -> String {
        format!(
            "{} {}/{}",
            Self::kind(&()),
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}

impl ExtensionObject for Infrastructure {
    fn extension_status(&self) -> Option<&ExtensionStatus> {
        self.status.as_ref()
    }
}

impl ExtensionObject for Bastion {
    fn extension_status(&self) -> Option<&ExtensionStatus> {
        self.status.as_ref().map(|s| &s.common)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn describe_names_kind_and_key() {
        let bastion = Bastion {
            metadata: ObjectMeta {
                name: Some("it-bastion".to_string()),
                namespace: Some("it".to_string()),
                ..Default::default()
            },
            spec: BastionSpec::new(Vec::new()),
            status: None,
        };
        assert_eq!(bastion.describe(), "Bastion it/it-bastion");
        assert!(bastion.extension_status().is_none());
    }

    #[test]
    fn bastion_exposes_common_status() {
        let mut bastion = Bastion::new("b", BastionSpec::new(Vec::new()));
        bastion.status = Some(BastionStatus {
            common: ExtensionStatus::default().observed_generation(3),
            ingress: None,
        });
        assert_eq!(
            bastion.extension_status().and_then(|s| s.observed_generation),
            Some(3)
        );
    }
}
