//! infra-harness - reconciliation-verification harness for OpenStack extension objects

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kube::{Client, CustomResourceExt};
use tracing::info;

use infra_harness::config::{HarnessConfig, OpenStackCredentials, WaitTiers, DEFAULT_WORKERS_CIDR};
use infra_harness::crd::{Bastion, Cluster, Infrastructure};
use infra_harness::driver::ReconcileStrategy;
use infra_harness::provider::OpenStackClient;
use infra_harness::scenario::{Suite, SuiteSummary};
use infra_harness::scenarios::{
    run_bastion, run_infrastructure, Environment, InfrastructureCase, KubeStores, NetworkSource,
};
use infra_harness::telemetry::{init_tracing, LogFormat};
use infra_harness::wait::WaitConfig;

/// Drive Gardener OpenStack extension objects through their lifecycle and
/// verify the result against the cloud
#[derive(Parser, Debug)]
#[command(name = "infra-harness", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run infrastructure scenarios
    ///
    /// Without filters the curated suite runs: every network layout under the
    /// flow and legacy backends, the legacy-to-flow migration, and state
    /// recovery on a pre-existing network and router.
    Infrastructure(InfrastructureArgs),

    /// Run the bastion scenario
    Bastion(CommonArgs),

    /// Print the CRD manifests the harness expects on the cluster
    Crds,
}

/// Connection and tuning flags shared by every scenario
#[derive(Args, Debug)]
struct CommonArgs {
    /// Keystone endpoint
    #[arg(long, env = "OS_AUTH_URL", default_value = "")]
    auth_url: String,

    /// Keystone domain
    #[arg(long, env = "OS_DOMAIN_NAME", default_value = "")]
    domain_name: String,

    /// Password
    #[arg(long, env = "OS_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Region
    #[arg(long, env = "OS_REGION_NAME", default_value = "")]
    region: String,

    /// Project
    #[arg(long, env = "OS_PROJECT_NAME", default_value = "")]
    tenant_name: String,

    /// User
    #[arg(long, env = "OS_USERNAME", default_value = "")]
    user_name: String,

    /// External network used as floating pool by infrastructure objects
    #[arg(long, env = "FLOATING_POOL_NAME", default_value = "FloatingIP-external")]
    floating_pool_name: String,

    /// External network the bastion scenario routes through; defaults to the floating pool
    #[arg(long, env = "BASTION_EXTERNAL_NETWORK")]
    bastion_external_network: Option<String>,

    /// Worker CIDR requested from the reconciler
    #[arg(long, env = "WORKERS_CIDR", default_value = DEFAULT_WORKERS_CIDR)]
    workers_cidr: String,

    /// SSH public key placed into infrastructure objects and bastion user data
    #[arg(long, env = "SSH_PUBLIC_KEY", default_value = "")]
    ssh_public_key: String,

    /// How long provider-side resources may take to appear or vanish, in seconds
    #[arg(long, default_value = "60")]
    existence_grace_secs: u64,

    /// Deadline for a single scenario in seconds; cleanup still runs after it
    #[arg(long, default_value = "3600")]
    scenario_deadline_secs: u64,
}

impl CommonArgs {
    fn into_config(self) -> HarnessConfig {
        let waits = WaitTiers {
            existence_grace: WaitConfig::existence_grace()
                .with_timeout(Duration::from_secs(self.existence_grace_secs)),
            ..WaitTiers::default()
        };
        HarnessConfig {
            credentials: OpenStackCredentials {
                auth_url: self.auth_url,
                domain_name: self.domain_name,
                password: self.password,
                region: self.region,
                tenant_name: self.tenant_name,
                user_name: self.user_name,
            },
            bastion_external_network: self
                .bastion_external_network
                .unwrap_or_else(|| self.floating_pool_name.clone()),
            floating_pool_name: self.floating_pool_name,
            workers_cidr: self.workers_cidr,
            ssh_public_key: self.ssh_public_key,
            waits,
            scenario_deadline: Duration::from_secs(self.scenario_deadline_secs),
        }
    }
}

/// Infrastructure scenario selection
#[derive(Args, Debug)]
struct InfrastructureArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Only run these network layouts (repeatable)
    #[arg(long = "network-source", value_enum)]
    network_sources: Vec<NetworkSource>,

    /// Only run these reconciler strategies (repeatable)
    #[arg(long = "strategy", value_enum)]
    strategies: Vec<ReconcileStrategy>,

    /// Select from every layout and strategy combination instead of the curated suite
    #[arg(long)]
    all_combinations: bool,

    /// Scenarios run side by side
    #[arg(long, default_value = "1")]
    parallel: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let summary = match cli.command {
        Commands::Crds => {
            print_crds()?;
            return Ok(());
        }
        Commands::Infrastructure(args) => run_infrastructure_suite(args).await?,
        Commands::Bastion(args) => run_bastion_suite(args).await?,
    };

    if !summary.is_green() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_crds() -> anyhow::Result<()> {
    for crd in [Infrastructure::crd(), Bastion::crd(), Cluster::crd()] {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("---\n{yaml}");
    }
    Ok(())
}

/// Validate the configuration and connect to the cluster and the cloud
async fn environment(args: CommonArgs) -> anyhow::Result<Environment> {
    let config = args.into_config();
    config.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let provider = OpenStackClient::new(config.credentials.clone())?;
    info!(
        region = %config.credentials.region,
        auth_url = %config.credentials.auth_url,
        "Harness configured"
    );

    Ok(Environment {
        config,
        provider: Arc::new(provider),
        stores: Arc::new(KubeStores::new(client)),
    })
}

async fn run_infrastructure_suite(args: InfrastructureArgs) -> anyhow::Result<SuiteSummary> {
    let cases = InfrastructureCase::select(
        args.all_combinations,
        &args.network_sources,
        &args.strategies,
    );
    if cases.is_empty() {
        anyhow::bail!("no infrastructure scenario matches the given filters");
    }
    let parallel = args.parallel.max(1);
    let env = environment(args.common).await?;
    let suite = Suite::new("infrastructure scenarios", env.config.scenario_deadline);
    info!(scenarios = cases.len(), parallel, "Running infrastructure suite");

    futures::stream::iter(cases)
        .for_each_concurrent(parallel, |case| {
            let env = &env;
            let suite = &suite;
            async move {
                suite
                    .run(&case.to_string(), |cleanup| run_infrastructure(env, case, cleanup))
                    .await;
            }
        })
        .await;

    Ok(suite.finish())
}

async fn run_bastion_suite(args: CommonArgs) -> anyhow::Result<SuiteSummary> {
    let env = environment(args).await?;
    let suite = Suite::new("bastion scenarios", env.config.scenario_deadline);
    suite
        .run("bastion create and delete", |cleanup| run_bastion(&env, cleanup))
        .await;
    Ok(suite.finish())
}
