//! Bastion scenario
//!
//! Provisions the network a shoot would already have (security group,
//! network, subnet and a router to the external network), asks the
//! reconciler for a bastion, then checks that SSH is reachable on the
//! reported address while other ports stay closed. The provider resources
//! behind the bastion are verified on creation and after deletion.

use std::time::Duration;

use tracing::{info, instrument};

use super::Environment;
use crate::cleanup::CleanupStack;
use crate::crd::openstack::InfrastructureConfig;
use crate::crd::{Bastion, BastionSpec, ClusterSpec};
use crate::driver::Driver;
use crate::provider::SubnetSpec;
use crate::provisioner::Provisioner;
use crate::verify::{
    expect_port_closed, expect_port_open, BastionOptions, Verifier, CLOSED_PORT,
    CLOSED_PORT_PROBE, SSH_PORT, SSH_REACHABLE_WITHIN,
};
use crate::{random_suffix, Error, Result};

/// Prefix of every bastion scenario name; the name doubles as namespace and cluster name
pub const BASTION_NAME_PREFIX: &str = "openstack-it-bastion-";

/// Source range allowed to reach the bastion
pub const BASTION_INGRESS_CIDR: &str = "0.0.0.0/0";

/// Pause between readiness and the first connection attempt
const SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Subnet of the pre-provisioned shoot network
pub fn bastion_subnet() -> SubnetSpec {
    SubnetSpec::new("10.180.0.0/16")
        .with_gateway("10.180.0.1")
        .with_allocation_pool("10.180.0.2", "10.180.255.254")
}

/// Cloud-init script creating a `gardener` user that accepts `ssh_public_key`
pub fn user_data(ssh_public_key: &str) -> Vec<u8> {
    format!(
        "#!/bin/bash -eu\n\
         id gardener || useradd gardener -mU\n\
         mkdir -p /home/gardener/.ssh\n\
         echo \"{ssh_public_key}\" > /home/gardener/.ssh/authorized_keys\n\
         chown gardener:gardener /home/gardener/.ssh/authorized_keys\n\
         echo \"gardener ALL=(ALL) NOPASSWD:ALL\" >/etc/sudoers.d/99-gardener-user\n"
    )
    .into_bytes()
}

/// Shoot security group, network, subnet and router the bastion attaches to
async fn provision_shoot_network(
    provisioner: &Provisioner,
    name: &str,
    external_network: &str,
) -> Result<()> {
    provisioner.create_security_group(name, name).await?;
    let network = provisioner.create_network(name).await?;
    let mut subnet = provisioner
        .create_subnet(&format!("{name}-subnet"), &network.id, &bastion_subnet())
        .await?;
    let external = provisioner.find_external_network(external_network).await?;
    provisioner
        .create_router(
            &format!("{name}-cloud-router"),
            Some(&external.id),
            Some(&mut subnet),
        )
        .await?;
    Ok(())
}

/// Run the bastion scenario; everything created is registered on `cleanup`
#[instrument(skip_all)]
pub async fn run_bastion(env: &Environment, cleanup: CleanupStack) -> Result<()> {
    let config = &env.config;
    let name = format!("{BASTION_NAME_PREFIX}{}", random_suffix(5));
    let bastion_name = format!("{name}-bastion");
    info!(name = %name, "Running bastion scenario");

    let options = BastionOptions::determine(&name, &bastion_name)?;
    let provisioner = Provisioner::new(env.provider.clone(), cleanup.clone());
    provision_shoot_network(&provisioner, &name, &config.bastion_external_network).await?;

    let mut driver = Driver::<Bastion>::new(
        env.stores.bastions(&name),
        cleanup.clone(),
        config.waits.clone(),
        &name,
        &bastion_name,
    )
    .with_readiness(config.waits.bastion_creation.clone());
    let infra_config = InfrastructureConfig {
        floating_pool_subnet_name: Some(config.bastion_external_network.clone()),
        ..Default::default()
    };
    driver
        .create_prerequisites(
            &env.stores.prerequisites(&name),
            ClusterSpec::for_bastion(&config.credentials.region, &infra_config)?,
            &config.credentials,
        )
        .await?;

    let spec =
        BastionSpec::new(user_data(&config.ssh_public_key)).allow_ingress(BASTION_INGRESS_CIDR);
    driver.create(Bastion::new(&bastion_name, spec)).await?;
    driver.await_convergence().await?;

    tokio::time::sleep(SETTLE_DELAY).await;
    let bastion = driver.current().await?;
    let ingress_ip = bastion
        .status
        .as_ref()
        .and_then(|s| s.ingress_ip())
        .map(str::to_string)
        .ok_or_else(|| Error::mismatch("bastion-ingress", "ready bastion reports no ingress IP"))?;
    expect_port_open(&ingress_ip, SSH_PORT, SSH_REACHABLE_WITHIN).await?;
    expect_port_closed(&ingress_ip, CLOSED_PORT, CLOSED_PORT_PROBE).await?;

    let verifier = Verifier::new(env.provider.clone(), config.waits.existence_grace.clone());
    let addresses = verifier.verify_bastion_created(&options).await?;
    if addresses.external_ip != ingress_ip {
        return Err(Error::mismatch(
            "bastion-ingress",
            format!(
                "status reports {ingress_ip}, instance has floating IP {}",
                addresses.external_ip
            ),
        ));
    }

    driver.delete().await?;
    verifier.verify_bastion_deleted(&options).await?;

    info!(name = %name, "Bastion scenario passed");
    Ok(())
}
