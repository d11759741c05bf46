//! Provider API abstraction
//!
//! The harness needs a small slice of the OpenStack API: create, get, list and
//! delete of networking resources, plus read-only lookups of keypairs, servers
//! and floating IPs to verify what the reconciler did. [`NetworkProvider`] is
//! that slice; [`OpenStackClient`] implements it over the public REST API.
//!
//! Getters return [`Error::NotFound`](crate::Error::NotFound) for absent
//! resources so existence checks can tell "gone" apart from "request failed".

mod openstack;

pub use openstack::OpenStackClient;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::Result;

// =============================================================================
// Resources
// =============================================================================

/// Neutron network
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Network {
    /// Network ID
    pub id: String,
    /// Network name
    #[serde(default)]
    pub name: String,
    /// Whether this is an external (floating pool) network
    #[serde(default, rename = "router:external")]
    pub external: bool,
    /// `ACTIVE`, `BUILD`, `DOWN` or `ERROR`
    #[serde(default)]
    pub status: String,
}

/// Address range handed out by DHCP
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AllocationPool {
    /// First address
    pub start: String,
    /// Last address
    pub end: String,
}

/// Neutron subnet
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Subnet {
    /// Subnet ID
    pub id: String,
    /// Subnet name
    #[serde(default)]
    pub name: String,
    /// Owning network
    #[serde(default)]
    pub network_id: String,
    /// Address range
    #[serde(default)]
    pub cidr: String,
    /// Gateway address
    #[serde(default)]
    pub gateway_ip: Option<String>,
    /// DHCP ranges
    #[serde(default)]
    pub allocation_pools: Vec<AllocationPool>,
}

/// One address a router holds on its gateway network
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FixedIp {
    /// Subnet the address belongs to
    #[serde(default)]
    pub subnet_id: String,
    /// The address
    pub ip_address: String,
}

/// External gateway of a router
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct GatewayInfo {
    /// External network
    pub network_id: String,
    /// Addresses on the external network
    #[serde(default)]
    pub external_fixed_ips: Vec<FixedIp>,
}

/// Neutron router
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Router {
    /// Router ID
    pub id: String,
    /// Router name
    #[serde(default)]
    pub name: String,
    /// `ACTIVE`, `BUILD`, `DOWN` or `ERROR`
    #[serde(default)]
    pub status: String,
    /// Gateway to the external network, if set
    #[serde(default)]
    pub external_gateway_info: Option<GatewayInfo>,
}

impl Router {
    /// First address the router holds on its external network
    pub fn first_external_ip(&self) -> Option<&str> {
        self.external_gateway_info
            .as_ref()
            .and_then(|g| g.external_fixed_ips.first())
            .map(|ip| ip.ip_address.as_str())
    }
}

/// Neutron security group
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SecurityGroup {
    /// Group ID
    pub id: String,
    /// Group name
    #[serde(default)]
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

/// Neutron security group rule
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SecurityGroupRule {
    /// Rule ID
    pub id: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// `ingress` or `egress`
    #[serde(default)]
    pub direction: String,
    /// IP protocol, `None` for any
    #[serde(default)]
    pub protocol: Option<String>,
    /// Lower port bound
    #[serde(default)]
    pub port_range_min: Option<u16>,
    /// Upper port bound
    #[serde(default)]
    pub port_range_max: Option<u16>,
    /// Allowed source range
    #[serde(default)]
    pub remote_ip_prefix: Option<String>,
    /// Owning group
    #[serde(default)]
    pub security_group_id: String,
}

/// Nova keypair
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct KeyPair {
    /// Keypair name, which is also its identifier
    pub name: String,
    /// Public key fingerprint
    #[serde(default)]
    pub fingerprint: String,
}

/// One address of a server
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ServerAddress {
    /// The address
    pub addr: String,
    /// `fixed` or `floating`
    #[serde(default, rename = "OS-EXT-IPS:type")]
    pub ip_type: String,
}

/// Nova server
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Server {
    /// Server ID
    pub id: String,
    /// Server name
    #[serde(default)]
    pub name: String,
    /// `ACTIVE`, `BUILD`, `ERROR`, ...
    #[serde(default)]
    pub status: String,
    /// Addresses keyed by network name
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<ServerAddress>>,
}

impl Server {
    fn address_of_type(&self, ip_type: &str) -> Option<&str> {
        self.addresses
            .values()
            .flatten()
            .find(|a| a.ip_type == ip_type)
            .map(|a| a.addr.as_str())
    }

    /// First fixed (private) address
    pub fn private_ip(&self) -> Option<&str> {
        self.address_of_type("fixed")
    }

    /// First floating (external) address
    pub fn external_ip(&self) -> Option<&str> {
        self.address_of_type("floating")
    }
}

/// Neutron floating IP
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FloatingIp {
    /// Floating IP ID
    pub id: String,
    /// The public address
    #[serde(default)]
    pub floating_ip_address: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Port the address is associated with
    #[serde(default)]
    pub port_id: Option<String>,
}

// =============================================================================
// Requests
// =============================================================================

/// Parameters of a subnet to create
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubnetSpec {
    /// Address range
    pub cidr: String,
    /// Gateway address; provider default when `None`
    pub gateway_ip: Option<String>,
    /// DHCP range; provider default when `None`
    pub allocation_pool: Option<AllocationPool>,
}

impl SubnetSpec {
    /// Subnet over `cidr` with provider defaults for everything else
    pub fn new(cidr: impl Into<String>) -> Self {
        Self {
            cidr: cidr.into(),
            ..Default::default()
        }
    }

    /// Set the gateway address and return self for chaining
    pub fn with_gateway(mut self, gateway_ip: impl Into<String>) -> Self {
        self.gateway_ip = Some(gateway_ip.into());
        self
    }

    /// Set the DHCP range and return self for chaining
    pub fn with_allocation_pool(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.allocation_pool = Some(AllocationPool {
            start: start.into(),
            end: end.into(),
        });
        self
    }
}

/// Server-side filter for list calls; unset fields do not filter
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListFilter {
    /// Exact name
    pub name: Option<String>,
    /// Exact description
    pub description: Option<String>,
    /// Only external (or only internal) networks
    pub external: Option<bool>,
}

impl ListFilter {
    /// Filter by exact name
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Filter by exact description
    pub fn by_description(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    /// Also filter on `router:external` and return self for chaining
    pub fn external(mut self, external: bool) -> Self {
        self.external = Some(external);
        self
    }

    /// Query string pairs in Neutron's filter syntax
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(name) = &self.name {
            query.push(("name", name.clone()));
        }
        if let Some(description) = &self.description {
            query.push(("description", description.clone()));
        }
        if let Some(external) = self.external {
            query.push(("router:external", external.to_string()));
        }
        query
    }
}

// =============================================================================
// Provider Trait
// =============================================================================

/// The OpenStack operations the harness performs
///
/// Implemented by [`OpenStackClient`]; mocked in unit tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Create a network
    async fn create_network(&self, name: &str) -> Result<Network>;

    /// Create a subnet inside `network_id`
    async fn create_subnet(&self, name: &str, network_id: &str, spec: &SubnetSpec)
        -> Result<Subnet>;

    /// Create a router, with an external gateway when `gateway_network_id` is set
    async fn create_router(&self, name: &str, gateway_network_id: Option<String>)
        -> Result<Router>;

    /// Attach a subnet to a router
    async fn add_router_interface(&self, router_id: &str, subnet_id: &str) -> Result<()>;

    /// Detach a subnet from a router
    async fn remove_router_interface(&self, router_id: &str, subnet_id: &str) -> Result<()>;

    /// Create a security group
    async fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup>;

    /// Fetch a network by ID
    async fn get_network(&self, id: &str) -> Result<Network>;

    /// Fetch a subnet by ID
    async fn get_subnet(&self, id: &str) -> Result<Subnet>;

    /// Fetch a router by ID
    async fn get_router(&self, id: &str) -> Result<Router>;

    /// Fetch a security group by ID
    async fn get_security_group(&self, id: &str) -> Result<SecurityGroup>;

    /// Fetch a keypair by name
    async fn get_keypair(&self, name: &str) -> Result<KeyPair>;

    /// List networks matching the filter
    async fn list_networks(&self, filter: &ListFilter) -> Result<Vec<Network>>;

    /// List security groups matching the filter
    async fn list_security_groups(&self, filter: &ListFilter) -> Result<Vec<SecurityGroup>>;

    /// List security group rules matching the filter
    async fn list_security_group_rules(&self, filter: &ListFilter)
        -> Result<Vec<SecurityGroupRule>>;

    /// List servers matching the filter (name only)
    async fn list_servers(&self, filter: &ListFilter) -> Result<Vec<Server>>;

    /// List floating IPs matching the filter
    async fn list_floating_ips(&self, filter: &ListFilter) -> Result<Vec<FloatingIp>>;

    /// Delete a network
    async fn delete_network(&self, id: &str) -> Result<()>;

    /// Delete a subnet
    async fn delete_subnet(&self, id: &str) -> Result<()>;

    /// Delete a router
    async fn delete_router(&self, id: &str) -> Result<()>;

    /// Delete a security group
    async fn delete_security_group(&self, id: &str) -> Result<()>;
}
