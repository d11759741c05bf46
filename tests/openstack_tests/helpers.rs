//! Environment for the live suites

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use infra_harness::config::{HarnessConfig, OpenStackCredentials, WaitTiers, DEFAULT_WORKERS_CIDR};
use infra_harness::provider::OpenStackClient;
use infra_harness::scenario::ScenarioReport;
use infra_harness::scenarios::{Environment, KubeStores};
use infra_harness::telemetry::{init_tracing, LogFormat};

/// Deadline for one live scenario
pub const SCENARIO_DEADLINE: Duration = Duration::from_secs(60 * 60);

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Harness configuration from the `OS_*` variables
pub fn config_from_env() -> HarnessConfig {
    let floating_pool_name = env_or("FLOATING_POOL_NAME", "FloatingIP-external");
    HarnessConfig {
        credentials: OpenStackCredentials {
            auth_url: env_or("OS_AUTH_URL", ""),
            domain_name: env_or("OS_DOMAIN_NAME", ""),
            password: env_or("OS_PASSWORD", ""),
            region: env_or("OS_REGION_NAME", ""),
            tenant_name: env_or("OS_PROJECT_NAME", ""),
            user_name: env_or("OS_USERNAME", ""),
        },
        bastion_external_network: env_or("BASTION_EXTERNAL_NETWORK", &floating_pool_name),
        floating_pool_name,
        workers_cidr: env_or("WORKERS_CIDR", DEFAULT_WORKERS_CIDR),
        ssh_public_key: env_or("SSH_PUBLIC_KEY", ""),
        waits: WaitTiers::default(),
        scenario_deadline: SCENARIO_DEADLINE,
    }
}

/// Connect to the cluster in the current kubeconfig and the configured project
pub async fn live_environment() -> Environment {
    init_tracing(LogFormat::Text);
    let config = config_from_env();
    config
        .validate()
        .expect("OS_* variables must be set for live tests");

    let client = Client::try_default()
        .await
        .expect("kubeconfig must point at the cluster the reconciler watches");
    let provider =
        OpenStackClient::new(config.credentials.clone()).expect("failed to build OpenStack client");

    Environment {
        config,
        provider: Arc::new(provider),
        stores: Arc::new(KubeStores::new(client)),
    }
}

/// Fail the test with the scenario's outcome and any leaked resources
pub fn assert_clean_pass(report: &ScenarioReport) {
    assert!(
        report.outcome.passed(),
        "{} failed: {:?}",
        report.name,
        report.outcome
    );
    assert!(
        report.teardown.is_clean(),
        "{} leaked resources: {:?}",
        report.name,
        report.teardown.failure_messages()
    );
}
