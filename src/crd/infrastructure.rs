//! Infrastructure extension object
//!
//! Asks the reconciler for the network layout a shoot's workers run in:
//! network, worker subnet, router, security group and SSH keypair.

use k8s_openapi::api::core::v1::SecretReference;
use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::openstack::InfrastructureConfig;
use super::types::{preserve_unknown_fields, ExtensionStatus};
use crate::{Result, CLOUDPROVIDER_SECRET_NAME, PROVIDER_TYPE};

/// Specification for an Infrastructure
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Infrastructure",
    plural = "infrastructures",
    shortname = "infra",
    status = "ExtensionStatus",
    namespaced,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    /// Provider type, always `openstack` here
    #[serde(rename = "type")]
    pub type_: String,

    /// Provider-specific configuration (an [`InfrastructureConfig`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_config: Option<serde_json::Value>,

    /// Region to create the infrastructure in
    pub region: String,

    /// Secret holding the provider credentials
    pub secret_ref: SecretReference,

    /// Public key installed on worker nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ssh_public_key: Option<ByteString>,
}

impl InfrastructureSpec {
    /// Spec for an OpenStack infrastructure reading credentials from the namespace's `cloudprovider` secret
    pub fn new(
        namespace: &str,
        region: impl Into<String>,
        config: &InfrastructureConfig,
        ssh_public_key: &str,
    ) -> Result<Self> {
        Ok(Self {
            type_: PROVIDER_TYPE.to_string(),
            provider_config: Some(serde_json::to_value(config)?),
            region: region.into(),
            secret_ref: SecretReference {
                name: Some(CLOUDPROVIDER_SECRET_NAME.to_string()),
                namespace: Some(namespace.to_string()),
            },
            ssh_public_key: Some(ByteString(ssh_public_key.as_bytes().to_vec())),
        })
    }

    /// Decode the provider config back into its typed form
    pub fn infrastructure_config(&self) -> Result<Option<InfrastructureConfig>> {
        self.provider_config
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn spec_serializes_in_reconciler_shape() {
        let config = InfrastructureConfig::new("FloatingIP-external", "10.250.0.0/16", None, None);
        let spec = InfrastructureSpec::new("openstack--infra-it--abcde", "eu-de-1", &config, "ssh-rsa AAAA")
            .unwrap();
        let json = serde_json::to_value(&spec).unwrap();

        assert_eq!(json["type"], "openstack");
        assert_eq!(json["region"], "eu-de-1");
        assert_eq!(json["secretRef"]["name"], "cloudprovider");
        assert_eq!(json["secretRef"]["namespace"], "openstack--infra-it--abcde");
        assert_eq!(json["providerConfig"]["networks"]["workers"], "10.250.0.0/16");
        // ByteString travels base64-encoded
        assert_eq!(json["sshPublicKey"], "c3NoLXJzYSBBQUFB");
    }

    #[test]
    fn provider_config_round_trips_through_the_spec() {
        let config = InfrastructureConfig::new(
            "FloatingIP-external",
            "10.250.0.0/16",
            Some("net-1".to_string()),
            None,
        );
        let spec = InfrastructureSpec::new("ns", "eu-de-1", &config, "key").unwrap();
        assert_eq!(spec.infrastructure_config().unwrap(), Some(config));
    }

    #[test]
    fn crd_is_namespaced_extension_kind() {
        let crd = Infrastructure::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("infrastructures.extensions.gardener.cloud")
        );
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
