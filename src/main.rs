//! Impersonator - per-user impersonation principals on downstream clusters

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use impersonator::config::{ImpersonationConfig, TeardownPolicy};
use impersonator::identity::IdentityResolver;
use impersonator::kube_utils::create_client;
use impersonator::lifecycle::ImpersonationManager;
use impersonator::management::{GrantKind, KubeGrantIndex, KubeIdentityStore};
use impersonator::reconciler::Impersonator;
use impersonator::remote::KubeRemoteClient;
use impersonator::retry::RetryConfig;
use impersonator::telemetry::init_logging;

/// Impersonator - provisions impersonation ServiceAccounts for management-plane users
#[derive(Parser, Debug)]
#[command(name = "impersonator", version, about, long_about = None)]
struct Cli {
    /// Kubeconfig for the management cluster (defaults to in-cluster/KUBECONFIG)
    #[arg(long, env = "IMPERSONATOR_MANAGEMENT_KUBECONFIG", global = true)]
    management_kubeconfig: Option<PathBuf>,

    /// Kubeconfig for the downstream cluster
    #[arg(long, env = "IMPERSONATOR_CLUSTER_KUBECONFIG", global = true)]
    cluster_kubeconfig: Option<PathBuf>,

    /// Name of the downstream cluster on the management plane
    #[arg(long, env = "IMPERSONATOR_CLUSTER_NAME", default_value = "local", global = true)]
    cluster_name: String,

    /// Delete dependents explicitly instead of relying on owner cascade
    #[arg(long, env = "IMPERSONATOR_EXPLICIT_TEARDOWN", global = true)]
    explicit_teardown: bool,

    /// Readiness poll attempts while waiting for the token secret
    #[arg(long, env = "IMPERSONATOR_READINESS_ATTEMPTS", default_value = "10", global = true)]
    readiness_attempts: u32,

    /// Seconds between sweeps for principals whose users lost every grant
    #[arg(long, env = "IMPERSONATOR_SWEEP_INTERVAL_SECS", default_value = "300", global = true)]
    sweep_interval_secs: u64,

    /// Log as JSON
    #[arg(long, env = "IMPERSONATOR_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch grants and keep principals in sync (default mode)
    Controller,

    /// Ensure one user's principal and wait for it to be ready
    Ensure {
        /// User record name
        #[arg(long)]
        user: String,

        /// Extra group to include
        #[arg(long)]
        group: Option<String>,
    },

    /// Remove one user's principal if no grant still references it
    Remove {
        /// User record name
        #[arg(long)]
        user: String,
    },

    /// Print the bearer token of a user's principal
    Token {
        /// User record name
        #[arg(long)]
        user: String,
    },
}

impl Cli {
    fn impersonation_config(&self) -> ImpersonationConfig {
        let teardown = if self.explicit_teardown {
            TeardownPolicy::Explicit
        } else {
            TeardownPolicy::OwnerCascade
        };
        ImpersonationConfig::default()
            .with_readiness(RetryConfig::with_max_attempts(self.readiness_attempts))
            .with_teardown(teardown)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_json).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let config = cli.impersonation_config();

    let management = create_client(cli.management_kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create management client: {}", e))?;
    let downstream = create_client(cli.cluster_kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create cluster client: {}", e))?;

    let remote = Arc::new(KubeRemoteClient::start(downstream, &config.namespace).await?);
    let resolver = IdentityResolver::new(
        Arc::new(KubeIdentityStore::new(management.clone())),
        config.baseline_groups.clone(),
    );
    let manager = Arc::new(ImpersonationManager::new(
        cli.cluster_name.clone(),
        resolver,
        Arc::new(KubeGrantIndex::start(management.clone(), GrantKind::Cluster).await?),
        Arc::new(KubeGrantIndex::start(management.clone(), GrantKind::Project).await?),
        Impersonator::new(remote.clone(), config),
        remote,
    ));

    match cli.command {
        Some(Commands::Controller) | None => {
            let sweep_interval = Duration::from_secs(cli.sweep_interval_secs.max(1));
            run_controller(manager, management, sweep_interval).await
        }
        Some(Commands::Ensure { user, group }) => {
            manager.ensure_principal(&user, group.as_deref()).await?;
            tracing::info!(user = %user, "Impersonation principal ready");
            Ok(())
        }
        Some(Commands::Remove { user }) => {
            if manager.remove_principal(&user).await? {
                tracing::info!(user = %user, "Impersonation principal removed");
            } else {
                tracing::info!(user = %user, "User still has grants, principal kept");
            }
            Ok(())
        }
        Some(Commands::Token { user }) => {
            let token = manager.token_for(&user).await?;
            println!("{token}");
            Ok(())
        }
    }
}

/// Run the grant controllers until a shutdown signal
async fn run_controller(
    manager: Arc<ImpersonationManager>,
    management: kube::Client,
    sweep_interval: Duration,
) -> anyhow::Result<()> {
    tracing::info!(cluster = %manager.cluster_name(), "Impersonator controller starting...");

    impersonator::controller::run(manager, management, sweep_interval).await;

    tracing::info!("Impersonator controller shutting down");
    Ok(())
}
