//! OpenStack provider payloads
//!
//! These travel inside the opaque `providerConfig`, `providerStatus` and
//! `state` fields of extension objects and inside the `Cluster` cloud profile.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// API version of every OpenStack provider payload
pub const OPENSTACK_API_VERSION: &str = "openstack.provider.extensions.gardener.cloud/v1alpha1";

/// Purpose tag of the worker subnet and security group
pub const PURPOSE_NODES: &str = "nodes";

fn default_api_version() -> String {
    OPENSTACK_API_VERSION.to_string()
}

// =============================================================================
// Infrastructure Config (desired)
// =============================================================================

/// Provider config embedded in an `Infrastructure` spec
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureConfig {
    /// API version
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Always `InfrastructureConfig`
    pub kind: String,

    /// External network floating IPs and the router gateway come from
    #[serde(default)]
    pub floating_pool_name: String,

    /// Subnet of the floating pool to allocate from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating_pool_subnet_name: Option<String>,

    /// Network layout
    #[serde(default)]
    pub networks: Networks,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: "InfrastructureConfig".to_string(),
            floating_pool_name: String::new(),
            floating_pool_subnet_name: None,
            networks: Networks::default(),
        }
    }
}

impl InfrastructureConfig {
    /// Config requesting the given layout; `None` ids ask the reconciler to create the resource
    pub fn new(
        floating_pool_name: impl Into<String>,
        workers_cidr: impl Into<String>,
        existing_network: Option<String>,
        existing_router: Option<String>,
    ) -> Self {
        Self {
            floating_pool_name: floating_pool_name.into(),
            networks: Networks {
                id: existing_network,
                router: existing_router.map(|id| RouterRef { id }),
                workers: workers_cidr.into(),
            },
            ..Default::default()
        }
    }

    /// Pre-existing network the reconciler must reuse, if any
    pub fn existing_network_id(&self) -> Option<&str> {
        self.networks.id.as_deref()
    }

    /// Pre-existing router the reconciler must reuse, if any
    pub fn existing_router_id(&self) -> Option<&str> {
        self.networks.router.as_ref().map(|r| r.id.as_str())
    }
}

/// Network section of [`InfrastructureConfig`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Networks {
    /// Existing network to reuse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Existing router to reuse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<RouterRef>,

    /// CIDR of the worker subnet
    #[serde(default)]
    pub workers: String,
}

/// Reference to an existing router
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RouterRef {
    /// Router ID
    pub id: String,
}

// =============================================================================
// Infrastructure Status (converged)
// =============================================================================

/// Provider status the reconciler writes to an `Infrastructure`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    /// API version
    #[serde(default)]
    pub api_version: String,

    /// Kind
    #[serde(default)]
    pub kind: String,

    /// Network resources
    #[serde(default)]
    pub networks: NetworkStatus,

    /// Node-level resources
    #[serde(default)]
    pub node: NodeStatus,

    /// Security groups
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupStatus>,
}

impl InfrastructureStatus {
    /// Decode from the opaque `status.providerStatus` field
    pub fn from_provider_status(value: Option<&serde_json::Value>) -> Result<Self> {
        let value = value.ok_or_else(|| {
            Error::mismatch("provider-status", "status.providerStatus is not set")
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            Error::mismatch(
                "provider-status",
                format!("status.providerStatus does not decode: {e}"),
            )
        })
    }

    /// Subnet tagged with the given purpose
    pub fn subnet(&self, purpose: &str) -> Option<&SubnetStatus> {
        self.networks.subnets.iter().find(|s| s.purpose == purpose)
    }

    /// Security group tagged with the given purpose
    pub fn security_group(&self, purpose: &str) -> Option<&SecurityGroupStatus> {
        self.security_groups.iter().find(|s| s.purpose == purpose)
    }
}

/// Network section of [`InfrastructureStatus`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Network ID
    #[serde(default)]
    pub id: String,

    /// Network name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Router
    #[serde(default)]
    pub router: RouterStatus,

    /// Floating pool
    #[serde(default)]
    pub floating_pool: FloatingPoolStatus,

    /// Subnets
    #[serde(default)]
    pub subnets: Vec<SubnetStatus>,
}

/// Router section of [`NetworkStatus`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterStatus {
    /// Router ID
    #[serde(default)]
    pub id: String,

    /// First external IP of the router gateway
    #[serde(default)]
    pub ip: String,

    /// All external IPs of the router gateway
    #[serde(default, rename = "externalFixedIPs", skip_serializing_if = "Vec::is_empty")]
    pub external_fixed_ips: Vec<String>,
}

/// Floating pool section of [`NetworkStatus`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct FloatingPoolStatus {
    /// External network ID
    #[serde(default)]
    pub id: String,

    /// External network name
    #[serde(default)]
    pub name: String,
}

/// Subnet entry of [`NetworkStatus`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SubnetStatus {
    /// Subnet ID
    pub id: String,

    /// What the subnet is used for
    pub purpose: String,
}

/// Security group entry of [`InfrastructureStatus`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SecurityGroupStatus {
    /// Security group ID
    pub id: String,

    /// Security group name
    #[serde(default)]
    pub name: String,

    /// What the group is used for
    pub purpose: String,
}

/// Node section of [`InfrastructureStatus`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Name of the keypair created for worker nodes
    #[serde(default)]
    pub key_name: String,
}

// =============================================================================
// Persisted State
// =============================================================================

/// Persisted state blob of the flow-based reconciler
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    /// API version
    pub api_version: String,

    /// Always `FlowState`
    pub kind: String,

    /// Resource identifiers keyed by role
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl FlowState {
    /// The baseline state a fresh reconciler starts from
    pub fn empty() -> Self {
        Self {
            api_version: OPENSTACK_API_VERSION.to_string(),
            kind: "FlowState".to_string(),
            data: BTreeMap::new(),
        }
    }

    /// Serialize for a status patch
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

// =============================================================================
// Cloud Profile Config
// =============================================================================

/// Provider config embedded in the cloud profile of a `Cluster`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudProfileConfig {
    /// API version
    pub api_version: String,

    /// Always `CloudProfileConfig`
    pub kind: String,

    /// Keystone endpoints per region
    #[serde(rename = "keystoneURLs", default)]
    pub keystone_urls: Vec<KeystoneUrl>,
}

impl CloudProfileConfig {
    /// Profile pointing the given region at the given Keystone endpoint
    pub fn for_region(region: impl Into<String>, auth_url: impl Into<String>) -> Self {
        Self {
            api_version: OPENSTACK_API_VERSION.to_string(),
            kind: "CloudProfileConfig".to_string(),
            keystone_urls: vec![KeystoneUrl {
                region: region.into(),
                url: auth_url.into(),
            }],
        }
    }
}

/// Keystone endpoint for one region
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct KeystoneUrl {
    /// Region name
    pub region: String,
    /// Keystone URL
    pub url: String,
}
