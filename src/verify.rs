//! Outcome verifier
//!
//! Cross-checks what the reconciler reported in an object's status against
//! what the provider actually holds. Every failed check is an
//! [`Error::VerificationMismatch`] naming the check, so a red run says which
//! post-condition broke rather than just "assertion failed".
//!
//! Checks come in three flavours:
//! - structural: the decoded provider status alone, no API calls
//! - existential: each referenced resource exists (after create) or is gone
//!   (after delete), the latter polled within a grace window
//! - reachability: TCP connects against a bastion's public address

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::crd::openstack::{InfrastructureConfig, InfrastructureStatus, PURPOSE_NODES};
use crate::provider::{ListFilter, NetworkProvider};
use crate::wait::{wait_until, Readiness, WaitConfig};
use crate::{Error, Result};

/// Router status Neutron reports once the gateway is wired up
const ROUTER_ACTIVE: &str = "ACTIVE";

/// Port the bastion must expose
pub const SSH_PORT: u16 = 22;

/// Port the bastion must not expose
pub const CLOSED_PORT: u16 = 42;

/// How long the SSH port may take to accept a connection
pub const SSH_REACHABLE_WITHIN: Duration = Duration::from_secs(60);

/// How long a connect to [`CLOSED_PORT`] is given before it counts as refused
pub const CLOSED_PORT_PROBE: Duration = Duration::from_secs(3);

const PORT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Provider identifiers a converged `Infrastructure` refers to
///
/// Captured after the first convergence and compared after every later one:
/// an idempotent reconcile must not replace any of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfrastructureIdentifiers {
    /// Worker network
    pub network_id: String,
    /// Router connecting the workers subnet to the floating pool
    pub router_id: String,
    /// Workers subnet
    pub subnet_id: String,
    /// Nodes security group
    pub security_group_id: String,
    /// Nodes keypair
    pub keypair_name: String,
}

impl InfrastructureIdentifiers {
    /// Fail unless `other` names exactly the same resources
    pub fn assert_unchanged(&self, other: &Self) -> Result<()> {
        if self == other {
            Ok(())
        } else {
            Err(Error::mismatch(
                "identifiers-stable",
                format!("reconcile replaced resources: before {self:?}, after {other:?}"),
            ))
        }
    }
}

fn well_formed_id(field: &str, value: &str) -> Result<()> {
    uuid::Uuid::parse_str(value).map(|_| ()).map_err(|_| {
        Error::mismatch(
            "well-formed-id",
            format!("{field} '{value}' is not a UUID"),
        )
    })
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::mismatch("status-complete", format!("{field} is empty")))
    } else {
        Ok(())
    }
}

/// Structural check of a converged provider status
///
/// Needs no API access. Returns the identifiers the existential checks look up.
pub fn check_structure(
    status: &InfrastructureStatus,
    config: &InfrastructureConfig,
) -> Result<InfrastructureIdentifiers> {
    let subnet = status.subnet(PURPOSE_NODES).ok_or_else(|| {
        Error::mismatch("status-complete", "no subnet with purpose 'nodes'")
    })?;
    let security_group = status.security_group(PURPOSE_NODES).ok_or_else(|| {
        Error::mismatch("status-complete", "no security group with purpose 'nodes'")
    })?;

    well_formed_id("networks.id", &status.networks.id)?;
    well_formed_id("networks.router.id", &status.networks.router.id)?;
    well_formed_id("nodes subnet id", &subnet.id)?;
    well_formed_id("nodes security group id", &security_group.id)?;
    non_empty("networks.router.ip", &status.networks.router.ip)?;
    non_empty("networks.floatingPool.id", &status.networks.floating_pool.id)?;
    non_empty("node.keyName", &status.node.key_name)?;

    if let Some(existing) = config.existing_network_id() {
        if status.networks.id != existing {
            return Err(Error::mismatch(
                "existing-network-reused",
                format!(
                    "expected network {existing}, status reports {}",
                    status.networks.id
                ),
            ));
        }
    }
    if let Some(existing) = config.existing_router_id() {
        if status.networks.router.id != existing {
            return Err(Error::mismatch(
                "existing-router-reused",
                format!(
                    "expected router {existing}, status reports {}",
                    status.networks.router.id
                ),
            ));
        }
    }

    Ok(InfrastructureIdentifiers {
        network_id: status.networks.id.clone(),
        router_id: status.networks.router.id.clone(),
        subnet_id: subnet.id.clone(),
        security_group_id: security_group.id.clone(),
        keypair_name: status.node.key_name.clone(),
    })
}

/// Map a lookup result to "exists", turning absence into a mismatch
fn must_exist<T>(check: &str, lookup: Result<T>) -> Result<T> {
    match lookup {
        Err(e) if e.is_not_found() => Err(Error::mismatch(check, e.to_string())),
        other => other,
    }
}

/// Map a lookup result to "gone?", keeping real failures as errors
fn is_gone<T>(lookup: Result<T>) -> Result<bool> {
    match lookup {
        Ok(_) => Ok(false),
        Err(e) if e.is_not_found() => Ok(true),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Bastion naming
// =============================================================================

const MAX_BASE_NAME_PREFIX: usize = 33;
const BASE_NAME_HASH_LEN: usize = 5;

/// Provider-side names the reconciler derives for a bastion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BastionOptions {
    /// Shared prefix of every bastion resource
    pub base_name: String,
    /// Server name
    pub instance_name: String,
    /// Security group name; its description carries the same value
    pub security_group: String,
    /// Description of the SSH ingress rule
    pub ssh_rule_description: String,
    /// Description of the floating IP
    pub floating_ip_description: String,
}

impl BastionOptions {
    /// Derive the names for bastion `bastion_name` of cluster `cluster_name`
    ///
    /// The base name is `{cluster}-{bastion}` cut to 33 characters, followed by
    /// `-bastion-` and the first five hex digits of the SHA-256 of the uncut name.
    pub fn determine(cluster_name: &str, bastion_name: &str) -> Result<Self> {
        if cluster_name.is_empty() {
            return Err(Error::validation("cluster name must not be empty"));
        }
        let static_name = format!("{cluster_name}-{bastion_name}");
        let digest = hex::encode(Sha256::digest(static_name.as_bytes()));
        let prefix: String = static_name.chars().take(MAX_BASE_NAME_PREFIX).collect();
        let base_name = format!("{prefix}-bastion-{}", &digest[..BASE_NAME_HASH_LEN]);

        Ok(Self {
            instance_name: base_name.clone(),
            security_group: format!("{base_name}-sg"),
            ssh_rule_description: format!("{base_name}-allow-ssh"),
            floating_ip_description: base_name.clone(),
            base_name,
        })
    }
}

/// Addresses of a running bastion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BastionAddresses {
    /// Address inside the shoot network
    pub private_ip: String,
    /// Public floating address
    pub external_ip: String,
}

// =============================================================================
// Verifier
// =============================================================================

/// Existential checks against the provider
pub struct Verifier {
    provider: Arc<dyn NetworkProvider>,
    grace: WaitConfig,
}

impl Verifier {
    /// `grace` bounds how long post-deletion absence may take to show up
    pub fn new(provider: Arc<dyn NetworkProvider>, grace: WaitConfig) -> Self {
        Self { provider, grace }
    }

    /// Structural plus existential checks after the infrastructure converged
    #[instrument(skip_all, fields(network = %status.networks.id))]
    pub async fn verify_infrastructure_created(
        &self,
        status: &InfrastructureStatus,
        config: &InfrastructureConfig,
    ) -> Result<InfrastructureIdentifiers> {
        let ids = check_structure(status, config)?;

        let router = must_exist("router-exists", self.provider.get_router(&ids.router_id).await)?;
        if router.status != ROUTER_ACTIVE {
            return Err(Error::mismatch(
                "router-active",
                format!("router {} is {}", router.id, router.status),
            ));
        }
        let gateway_ip = router.first_external_ip().unwrap_or_default();
        if gateway_ip != status.networks.router.ip {
            return Err(Error::mismatch(
                "router-ip",
                format!(
                    "status reports {}, router gateway has '{gateway_ip}'",
                    status.networks.router.ip
                ),
            ));
        }

        must_exist("network-exists", self.provider.get_network(&ids.network_id).await)?;

        let subnet = must_exist("subnet-exists", self.provider.get_subnet(&ids.subnet_id).await)?;
        if subnet.cidr != config.networks.workers {
            return Err(Error::mismatch(
                "subnet-cidr",
                format!(
                    "expected {}, subnet {} has {}",
                    config.networks.workers, subnet.id, subnet.cidr
                ),
            ));
        }
        if subnet.network_id != ids.network_id {
            return Err(Error::mismatch(
                "subnet-network",
                format!(
                    "subnet {} belongs to {}, not {}",
                    subnet.id, subnet.network_id, ids.network_id
                ),
            ));
        }

        let group = must_exist(
            "security-group-exists",
            self.provider.get_security_group(&ids.security_group_id).await,
        )?;
        let expected_name = status
            .security_group(PURPOSE_NODES)
            .map(|sg| sg.name.as_str())
            .unwrap_or_default();
        if group.name != expected_name {
            return Err(Error::mismatch(
                "security-group-name",
                format!("expected '{expected_name}', found '{}'", group.name),
            ));
        }

        must_exist("keypair-exists", self.provider.get_keypair(&ids.keypair_name).await)?;

        info!(
            router_id = %ids.router_id,
            subnet_id = %ids.subnet_id,
            security_group_id = %ids.security_group_id,
            "Infrastructure matches provider"
        );
        Ok(ids)
    }

    /// Resources that should be gone after deletion but are still reported
    async fn lingering_infrastructure(
        &self,
        ids: &InfrastructureIdentifiers,
        config: &InfrastructureConfig,
    ) -> Result<Vec<String>> {
        let mut lingering = Vec::new();
        if !is_gone(self.provider.get_keypair(&ids.keypair_name).await)? {
            lingering.push(format!("keypair {}", ids.keypair_name));
        }
        if !is_gone(self.provider.get_subnet(&ids.subnet_id).await)? {
            lingering.push(format!("subnet {}", ids.subnet_id));
        }
        if !is_gone(self.provider.get_security_group(&ids.security_group_id).await)? {
            lingering.push(format!("security group {}", ids.security_group_id));
        }
        if config.existing_network_id().is_none()
            && !is_gone(self.provider.get_network(&ids.network_id).await)?
        {
            lingering.push(format!("network {}", ids.network_id));
        }
        if config.existing_router_id().is_none()
            && !is_gone(self.provider.get_router(&ids.router_id).await)?
        {
            lingering.push(format!("router {}", ids.router_id));
        }
        Ok(lingering)
    }

    /// Everything the reconciler created is gone; pre-existing resources survive
    #[instrument(skip_all, fields(network = %ids.network_id))]
    pub async fn verify_infrastructure_deleted(
        &self,
        ids: &InfrastructureIdentifiers,
        config: &InfrastructureConfig,
    ) -> Result<()> {
        self.await_absence("infrastructure-deleted", || {
            self.lingering_infrastructure(ids, config)
        })
        .await?;

        if let Some(network_id) = config.existing_network_id() {
            must_exist(
                "existing-network-survives",
                self.provider.get_network(network_id).await,
            )?;
        }
        if let Some(router_id) = config.existing_router_id() {
            must_exist(
                "existing-router-survives",
                self.provider.get_router(router_id).await,
            )?;
        }
        info!("Infrastructure resources released");
        Ok(())
    }

    /// Security group, SSH rule and server of a ready bastion
    #[instrument(skip_all, fields(bastion = %options.base_name))]
    pub async fn verify_bastion_created(&self, options: &BastionOptions) -> Result<BastionAddresses> {
        let groups = self
            .provider
            .list_security_groups(&ListFilter::by_name(&options.security_group))
            .await?;
        let group = groups.first().ok_or_else(|| {
            Error::mismatch(
                "bastion-security-group",
                format!("no security group named {}", options.security_group),
            )
        })?;
        if group.description != options.security_group {
            return Err(Error::mismatch(
                "bastion-security-group",
                format!(
                    "description is '{}', expected '{}'",
                    group.description, options.security_group
                ),
            ));
        }

        let rules = self
            .provider
            .list_security_group_rules(&ListFilter::by_description(&options.ssh_rule_description))
            .await?;
        if !rules
            .iter()
            .any(|r| r.description == options.ssh_rule_description)
        {
            return Err(Error::mismatch(
                "bastion-ssh-rule",
                format!("no rule described as {}", options.ssh_rule_description),
            ));
        }

        let servers = self
            .provider
            .list_servers(&ListFilter::by_name(&options.instance_name))
            .await?;
        let server = servers
            .iter()
            .find(|s| s.name == options.instance_name)
            .ok_or_else(|| {
                Error::mismatch(
                    "bastion-instance",
                    format!("no server named {}", options.instance_name),
                )
            })?;

        let (Some(private_ip), Some(external_ip)) = (server.private_ip(), server.external_ip())
        else {
            return Err(Error::mismatch(
                "bastion-addresses",
                format!(
                    "server {} lacks a private or external address: {:?}",
                    server.id, server.addresses
                ),
            ));
        };

        info!(private_ip = %private_ip, external_ip = %external_ip, "Bastion matches provider");
        Ok(BastionAddresses {
            private_ip: private_ip.to_string(),
            external_ip: external_ip.to_string(),
        })
    }

    async fn lingering_bastion(&self, options: &BastionOptions) -> Result<Vec<String>> {
        let mut lingering = Vec::new();
        let floating_ips = self
            .provider
            .list_floating_ips(&ListFilter::by_description(&options.floating_ip_description))
            .await?;
        lingering.extend(
            floating_ips
                .iter()
                .map(|ip| format!("floating ip {}", ip.floating_ip_address)),
        );
        let groups = self
            .provider
            .list_security_groups(&ListFilter::by_name(&options.security_group))
            .await?;
        lingering.extend(groups.iter().map(|g| format!("security group {}", g.id)));
        let servers = self
            .provider
            .list_servers(&ListFilter::by_name(&options.instance_name))
            .await?;
        lingering.extend(servers.iter().map(|s| format!("server {}", s.id)));
        Ok(lingering)
    }

    /// Floating IP, security group and server of a deleted bastion are gone
    #[instrument(skip_all, fields(bastion = %options.base_name))]
    pub async fn verify_bastion_deleted(&self, options: &BastionOptions) -> Result<()> {
        self.await_absence("bastion-deleted", || self.lingering_bastion(options))
            .await?;
        info!("Bastion resources released");
        Ok(())
    }

    /// Poll `lingering` within the grace window until it reports nothing
    async fn await_absence<F, Fut>(&self, check: &str, mut lingering: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<String>>>,
    {
        let result = wait_until(
            check,
            &self.grace,
            || {
                let fut = lingering();
                async move { fut.await.map(Some) }
            },
            |remaining: Option<&Vec<String>>| match remaining {
                Some(r) if !r.is_empty() => Readiness::Pending(format!("still present: {}", r.join(", "))),
                _ => Readiness::Ready,
            },
        )
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(Error::ConvergenceTimeout { last_observed, .. }) => {
                Err(Error::mismatch(check, last_observed))
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Reachability
// =============================================================================

/// A TCP connection to `host:port` succeeds within `within`
///
/// Refused connections are retried until the deadline: the instance may still
/// be booting sshd when the bastion reports ready.
pub async fn expect_port_open(host: &str, port: u16, within: Duration) -> Result<()> {
    let deadline = Instant::now() + within;
    let mut last_error = String::from("no attempt made");

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::mismatch(
                "port-open",
                format!("{host}:{port} not reachable within {within:?}: {last_error}"),
            ));
        }
        match tokio::time::timeout(remaining, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => {
                info!(host = %host, port, "Port reachable");
                return Ok(());
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = "connect timed out".to_string(),
        }
        debug!(host = %host, port, error = %last_error, "Port not reachable yet");
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(PORT_RETRY_INTERVAL.min(remaining)).await;
    }
}

/// A TCP connection to `host:port` does not succeed within `probe`
pub async fn expect_port_closed(host: &str, port: u16, probe: Duration) -> Result<()> {
    match tokio::time::timeout(probe, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Err(Error::mismatch(
            "port-closed",
            format!("{host}:{port} accepted a connection"),
        )),
        Ok(Err(e)) => {
            debug!(host = %host, port, error = %e, "Connection refused as expected");
            Ok(())
        }
        Err(_) => {
            debug!(host = %host, port, "Connection timed out as expected");
            Ok(())
        }
    }
}
