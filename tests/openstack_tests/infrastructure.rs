//! Live infrastructure scenarios
//!
//! Each test drives one `Infrastructure` through create, reconcile and delete
//! and checks the result in Neutron and Nova.

use infra_harness::driver::ReconcileStrategy;
use infra_harness::scenario::run_scenario;
use infra_harness::scenarios::{run_infrastructure, InfrastructureCase, NetworkSource};

use super::helpers::{assert_clean_pass, live_environment, SCENARIO_DEADLINE};

async fn run_case(source: NetworkSource, strategy: ReconcileStrategy) {
    let env = live_environment().await;
    let case = InfrastructureCase::new(source, strategy);
    let report = run_scenario(&case.to_string(), SCENARIO_DEADLINE, |cleanup| {
        run_infrastructure(&env, case, cleanup)
    })
    .await;
    assert_clean_pass(&report);
}

// =============================================================================
// New network
// =============================================================================

/// Story: the flow backend creates network, router and subnet from nothing
#[tokio::test]
#[ignore = "requires a running reconciler and OpenStack credentials"]
async fn story_new_network_with_flow() {
    run_case(NetworkSource::New, ReconcileStrategy::Flow).await;
}

/// Story: an object created by the legacy backend is taken over by the flow backend
#[tokio::test]
#[ignore = "requires a running reconciler and OpenStack credentials"]
async fn story_new_network_migrates_to_flow() {
    run_case(NetworkSource::New, ReconcileStrategy::MigrateToFlow).await;
}

#[tokio::test]
#[ignore = "requires a running reconciler and OpenStack credentials"]
async fn new_network_with_terraformer() {
    run_case(NetworkSource::New, ReconcileStrategy::Terraformer).await;
}

// =============================================================================
// Pre-existing resources
// =============================================================================

/// Story: a router supplied by the user is reused and survives deletion
#[tokio::test]
#[ignore = "requires a running reconciler and OpenStack credentials"]
async fn story_existing_router_with_flow() {
    run_case(NetworkSource::ExistingRouter, ReconcileStrategy::Flow).await;
}

#[tokio::test]
#[ignore = "requires a running reconciler and OpenStack credentials"]
async fn existing_router_with_terraformer() {
    run_case(NetworkSource::ExistingRouter, ReconcileStrategy::Terraformer).await;
}

/// Story: a network supplied by the user is reused and survives deletion
#[tokio::test]
#[ignore = "requires a running reconciler and OpenStack credentials"]
async fn story_existing_network_with_flow() {
    run_case(NetworkSource::ExistingNetwork, ReconcileStrategy::Flow).await;
}

#[tokio::test]
#[ignore = "requires a running reconciler and OpenStack credentials"]
async fn existing_network_with_terraformer() {
    run_case(NetworkSource::ExistingNetwork, ReconcileStrategy::Terraformer).await;
}

/// Story: dropped state is rebuilt identically on top of user-supplied network and router
#[tokio::test]
#[ignore = "requires a running reconciler and OpenStack credentials"]
async fn story_existing_network_and_router_recovers_state() {
    run_case(
        NetworkSource::ExistingNetworkAndRouter,
        ReconcileStrategy::FlowRecoverState,
    )
    .await;
}

#[tokio::test]
#[ignore = "requires a running reconciler and OpenStack credentials"]
async fn existing_network_and_router_with_terraformer() {
    run_case(
        NetworkSource::ExistingNetworkAndRouter,
        ReconcileStrategy::Terraformer,
    )
    .await;
}
