//! Infrastructure scenarios
//!
//! One scenario per combination of network layout and reconciler strategy.
//! Each creates an `Infrastructure`, verifies the converged status against
//! Neutron and Nova, reconciles again, checks that nothing was replaced (and,
//! after injected state loss, that the state was rebuilt identically), deletes
//! it and checks that exactly the reconciler-created resources are gone.

use std::fmt;

use tracing::{info, instrument};

use super::Environment;
use crate::cleanup::CleanupStack;
use crate::crd::openstack::{CloudProfileConfig, InfrastructureConfig, InfrastructureStatus};
use crate::crd::{ClusterSpec, Infrastructure, InfrastructureSpec};
use crate::driver::{ConvergenceRecord, Driver, ReconcileStrategy};
use crate::provisioner::Provisioner;
use crate::verify::Verifier;
use crate::{random_suffix, Result};

/// Prefix of every infrastructure scenario namespace
pub const NAMESPACE_PREFIX: &str = "openstack--infra-it--";

/// Name of the `Infrastructure` object inside the scenario namespace
pub const INFRASTRUCTURE_NAME: &str = "infrastructure";

/// Where the worker network and router come from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum NetworkSource {
    /// The reconciler creates both
    New,
    /// The harness pre-creates the router
    ExistingRouter,
    /// The harness pre-creates the network
    ExistingNetwork,
    /// The harness pre-creates both
    ExistingNetworkAndRouter,
}

impl NetworkSource {
    /// Every layout
    pub const ALL: [NetworkSource; 4] = [
        Self::New,
        Self::ExistingRouter,
        Self::ExistingNetwork,
        Self::ExistingNetworkAndRouter,
    ];

    /// Whether the harness supplies the network
    pub fn reuses_network(self) -> bool {
        matches!(self, Self::ExistingNetwork | Self::ExistingNetworkAndRouter)
    }

    /// Whether the harness supplies the router
    pub fn reuses_router(self) -> bool {
        matches!(self, Self::ExistingRouter | Self::ExistingNetworkAndRouter)
    }
}

impl fmt::Display for NetworkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new-network"),
            Self::ExistingRouter => write!(f, "existing-router"),
            Self::ExistingNetwork => write!(f, "existing-network"),
            Self::ExistingNetworkAndRouter => write!(f, "existing-network-and-router"),
        }
    }
}

/// One cell of the infrastructure matrix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InfrastructureCase {
    /// Network layout
    pub source: NetworkSource,
    /// Reconciler strategy
    pub strategy: ReconcileStrategy,
}

impl InfrastructureCase {
    /// Case for the given layout and strategy
    pub fn new(source: NetworkSource, strategy: ReconcileStrategy) -> Self {
        Self { source, strategy }
    }

    /// The default suite: every layout under the flow and legacy backends, the
    /// migration from legacy to flow on a new network, and state recovery with
    /// pre-existing network and router
    pub fn suite() -> Vec<Self> {
        use NetworkSource::*;
        use ReconcileStrategy::*;
        vec![
            Self::new(New, Flow),
            Self::new(New, MigrateToFlow),
            Self::new(New, Terraformer),
            Self::new(ExistingRouter, Flow),
            Self::new(ExistingRouter, Terraformer),
            Self::new(ExistingNetwork, Flow),
            Self::new(ExistingNetwork, Terraformer),
            Self::new(ExistingNetworkAndRouter, FlowRecoverState),
            Self::new(ExistingNetworkAndRouter, Terraformer),
        ]
    }

    /// Every layout crossed with every strategy
    pub fn matrix() -> Vec<Self> {
        NetworkSource::ALL
            .iter()
            .flat_map(|&source| {
                ReconcileStrategy::ALL
                    .iter()
                    .map(move |&strategy| Self::new(source, strategy))
            })
            .collect()
    }

    /// Cases from the default suite, or the full matrix, narrowed by layout and strategy
    ///
    /// Empty filters keep everything.
    pub fn select(
        all_combinations: bool,
        sources: &[NetworkSource],
        strategies: &[ReconcileStrategy],
    ) -> Vec<Self> {
        let base = if all_combinations {
            Self::matrix()
        } else {
            Self::suite()
        };
        base.into_iter()
            .filter(|c| sources.is_empty() || sources.contains(&c.source))
            .filter(|c| strategies.is_empty() || strategies.contains(&c.strategy))
            .collect()
    }
}

impl fmt::Display for InfrastructureCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "infrastructure {} ({})", self.source, self.strategy)
    }
}

fn provider_status(obj: &Infrastructure) -> Result<InfrastructureStatus> {
    InfrastructureStatus::from_provider_status(
        obj.status.as_ref().and_then(|s| s.provider_status.as_ref()),
    )
}

/// Run one infrastructure scenario; everything created is registered on `cleanup`
#[instrument(skip_all, fields(case = %case))]
pub async fn run_infrastructure(
    env: &Environment,
    case: InfrastructureCase,
    cleanup: CleanupStack,
) -> Result<()> {
    let config = &env.config;
    let namespace = format!("{NAMESPACE_PREFIX}{}", random_suffix(5));
    info!(namespace = %namespace, "Running infrastructure scenario");

    let provisioner = Provisioner::new(env.provider.clone(), cleanup.clone());
    let floating_pool = provisioner
        .find_external_network(&config.floating_pool_name)
        .await?;

    let existing_network = if case.source.reuses_network() {
        Some(
            provisioner
                .create_network(&format!("{namespace}-network"))
                .await?
                .id,
        )
    } else {
        None
    };
    let existing_router = if case.source.reuses_router() {
        Some(
            provisioner
                .create_router(
                    &format!("{namespace}-cloud-router"),
                    Some(&floating_pool.id),
                    None,
                )
                .await?
                .id,
        )
    } else {
        None
    };
    let infra_config = InfrastructureConfig::new(
        &config.floating_pool_name,
        &config.workers_cidr,
        existing_network,
        existing_router,
    );

    let mut driver = Driver::<Infrastructure>::new(
        env.stores.infrastructures(&namespace),
        cleanup.clone(),
        config.waits.clone(),
        &namespace,
        INFRASTRUCTURE_NAME,
    );
    let profile =
        CloudProfileConfig::for_region(&config.credentials.region, &config.credentials.auth_url);
    driver
        .create_prerequisites(
            &env.stores.prerequisites(&namespace),
            ClusterSpec::for_infrastructure(&namespace, &profile)?,
            &config.credentials,
        )
        .await?;

    let mut infra = Infrastructure::new(
        INFRASTRUCTURE_NAME,
        InfrastructureSpec::new(
            &namespace,
            &config.credentials.region,
            &infra_config,
            &config.ssh_public_key,
        )?,
    );
    infra.metadata.annotations = Some(case.strategy.creation_annotations());
    driver.create(infra).await?;
    let converged = driver.await_convergence().await?;

    let verifier = Verifier::new(env.provider.clone(), config.waits.existence_grace.clone());
    let ids = verifier
        .verify_infrastructure_created(&provider_status(&converged)?, &infra_config)
        .await?;
    let record = ConvergenceRecord::capture(&converged)?;

    if case.strategy.injects_state_loss() {
        driver.inject_state_loss().await?;
    }
    let reconciled = driver
        .trigger_reconcile(&case.strategy.trigger_annotations())
        .await?;
    if case.strategy.injects_state_loss() {
        record.assert_recovered(&reconciled)?;
    }
    let ids_after = verifier
        .verify_infrastructure_created(&provider_status(&reconciled)?, &infra_config)
        .await?;
    ids.assert_unchanged(&ids_after)?;

    driver.delete().await?;
    verifier
        .verify_infrastructure_deleted(&ids, &infra_config)
        .await?;

    info!(namespace = %namespace, "Infrastructure scenario passed");
    Ok(())
}
