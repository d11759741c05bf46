//! Bastion extension object
//!
//! Asks the reconciler for a jump host reachable over SSH from the allowed
//! ingress ranges. The reconciler reports the public address in
//! `status.ingress`.

use k8s_openapi::api::core::v1::LoadBalancerIngress;
use k8s_openapi::api::networking::v1::IPBlock;
use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, ExtensionStatus};
use crate::PROVIDER_TYPE;

/// Specification for a Bastion
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Bastion",
    plural = "bastions",
    status = "BastionStatus",
    namespaced,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".status.ingress.ip"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BastionSpec {
    /// Provider type, always `openstack` here
    #[serde(rename = "type")]
    pub type_: String,

    /// Provider-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_config: Option<serde_json::Value>,

    /// Cloud-init user data for the bastion instance
    #[schemars(with = "String")]
    pub user_data: ByteString,

    /// Source ranges allowed to reach the bastion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<BastionIngressPolicy>,
}

impl BastionSpec {
    /// Spec for an OpenStack bastion booting with the given user data
    pub fn new(user_data: impl Into<Vec<u8>>) -> Self {
        Self {
            type_: PROVIDER_TYPE.to_string(),
            provider_config: None,
            user_data: ByteString(user_data.into()),
            ingress: Vec::new(),
        }
    }

    /// Allow SSH from the given CIDR and return self for chaining
    pub fn allow_ingress(mut self, cidr: impl Into<String>) -> Self {
        self.ingress.push(BastionIngressPolicy {
            ip_block: IPBlock {
                cidr: cidr.into(),
                except: None,
            },
        });
        self
    }
}

/// One allowed ingress range
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BastionIngressPolicy {
    /// Source range
    pub ip_block: IPBlock,
}

/// Status for a Bastion
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BastionStatus {
    /// Common extension status
    #[serde(flatten)]
    pub common: ExtensionStatus,

    /// Public endpoint of the bastion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<LoadBalancerIngress>,
}

impl BastionStatus {
    /// Public IP, if the reconciler reported one
    pub fn ingress_ip(&self) -> Option<&str> {
        self.ingress.as_ref().and_then(|i| i.ip.as_deref())
    }
}
