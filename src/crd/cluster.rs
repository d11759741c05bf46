//! Cluster extension object
//!
//! Cluster-scoped context the reconciler looks up by the namespace name of the
//! object it reconciles. It carries the cloud profile, seed and shoot as opaque
//! documents.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::openstack::{CloudProfileConfig, InfrastructureConfig};
use super::types::preserve_unknown_fields;
use crate::{Result, CLOUDPROVIDER_SECRET_NAME};

const GARDENER_CORE_API_VERSION: &str = "core.gardener.cloud/v1beta1";

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cloud profile document
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub cloud_profile: serde_json::Value,

    /// Seed document
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub seed: serde_json::Value,

    /// Shoot document
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub shoot: serde_json::Value,
}

impl ClusterSpec {
    /// Context for infrastructure scenarios: a cloud profile pointing at Keystone, empty seed and shoot
    pub fn for_infrastructure(profile_name: &str, profile: &CloudProfileConfig) -> Result<Self> {
        Ok(Self {
            cloud_profile: cloud_profile(profile_name, Some(profile))?,
            seed: json!({}),
            shoot: json!({}),
        })
    }

    /// Context for bastion scenarios: a shoot embedding the infrastructure config
    pub fn for_bastion(region: &str, infrastructure: &InfrastructureConfig) -> Result<Self> {
        Ok(Self {
            cloud_profile: cloud_profile("", None)?,
            seed: json!({}),
            shoot: json!({
                "apiVersion": GARDENER_CORE_API_VERSION,
                "kind": "Shoot",
                "spec": {
                    "region": region,
                    "secretBindingName": CLOUDPROVIDER_SECRET_NAME,
                    "provider": {
                        "infrastructureConfig": serde_json::to_value(infrastructure)?,
                    },
                },
            }),
        })
    }
}

fn cloud_profile(name: &str, config: Option<&CloudProfileConfig>) -> Result<serde_json::Value> {
    let mut spec = json!({});
    if let Some(config) = config {
        spec["providerConfig"] = serde_json::to_value(config)?;
    }
    Ok(json!({
        "apiVersion": GARDENER_CORE_API_VERSION,
        "kind": "CloudProfile",
        "metadata": {"name": name},
        "spec": spec,
    }))
}
