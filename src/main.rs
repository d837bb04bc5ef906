//! cluster-bringup - provision a cluster and wait until its tenants serve traffic

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_bringup::config::{derive_controller_config, CREDENTIALS_ENV_VAR};
use cluster_bringup::error::error_chain;
use cluster_bringup::probe::probe_targets;
use cluster_bringup::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use cluster_bringup::workflow::Stage;
use cluster_bringup::{create_cluster, WorkflowContext, WorkflowDeps, WorkflowSettings};

/// Supervised cluster bring-up
#[derive(Parser, Debug)]
#[command(name = "cluster-bringup", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create (or reconcile) a cluster and wait until it serves traffic
    ///
    /// Infrastructure, configuration and the controller are applied
    /// idempotently, so re-running against an existing cluster converges it.
    Create(CreateArgs),
}

/// Create mode arguments
#[derive(Parser, Debug)]
struct CreateArgs {
    /// Path to the cluster definition YAML
    #[arg(short = 'f', long = "config")]
    config_file: PathBuf,

    /// Path to the provider credentials JSON
    #[arg(long = "credentials", env = CREDENTIALS_ENV_VAR)]
    credentials_file: PathBuf,

    /// Override the controller image from the cluster definition
    #[arg(long, env = "CLUSTER_CONTROLLER_IMAGE")]
    image: Option<String>,

    /// Maximum number of attempts
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Pause between attempts in seconds
    #[arg(long, default_value = "10")]
    retry_delay_secs: u64,

    /// Deadline for a single attempt in seconds
    #[arg(long, default_value = "2700")]
    attempt_timeout_secs: u64,

    /// Apply configuration but do not deploy the controller
    #[arg(long)]
    hold_controller: bool,

    /// Skip the registry check for the controller image
    #[arg(long)]
    skip_image_check: bool,

    /// Print the plan and exit without touching any cloud or cluster
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and reqwest both build rustls configs; pin the provider up front
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Failed to install rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create(args) => run_create(args).await,
    }
}

/// Resolve inputs, then either print the plan or run the supervised workflow
async fn run_create(args: CreateArgs) -> anyhow::Result<()> {
    let mut ctx = WorkflowContext::resolve(&args.config_file, &args.credentials_file).await?;

    if let Some(image) = args.image {
        ctx.config.image = image;
    }
    ctx.config.hold_controller |= args.hold_controller;
    ctx.config.skip_image_check |= args.skip_image_check;
    ctx.config.validate()?;

    if args.dry_run {
        return print_plan(&ctx);
    }

    let settings = WorkflowSettings {
        retry: RetryPolicy {
            max_attempts: args.max_attempts,
            delay: Duration::from_secs(args.retry_delay_secs),
            ..RetryPolicy::default()
        },
        attempt_timeout: Duration::from_secs(args.attempt_timeout_secs),
        ..WorkflowSettings::default()
    };
    let deps = Arc::new(WorkflowDeps::for_context(&ctx)?);

    let result = create_cluster(Arc::new(ctx), deps, settings, |err| {
        tracing::error!(error = %error_chain(err), "Cluster bring-up faulted, shutting down");
    })
    .await;

    match result {
        Ok(outcome) => {
            println!("Cluster bring-up finished: {:?}", outcome);
            Ok(())
        }
        Err(e) if e.kind().is_process_fatal() || e.is_task_fault() => {
            eprintln!("Cluster bring-up aborted: {}", error_chain(&e));
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

fn print_plan(ctx: &WorkflowContext) -> anyhow::Result<()> {
    let config = &ctx.config;
    let controller = derive_controller_config(config, &ctx.credentials)?;

    println!("=== Cluster bring-up plan ===");
    println!("Cluster: {}", config.name);
    println!("Provider: {} ({})", config.provider, config.region);
    println!("Controller image: {}", config.image);
    println!();
    println!("Controller configuration:");
    println!("{}", serde_yaml::to_string(&controller)?);

    println!("Stages:");
    for stage in Stage::ALL {
        println!("  {}", stage);
    }
    println!();

    println!("Readiness endpoints:");
    for target in probe_targets(config, config) {
        let auth = if target.auth_token.is_some() { " (auth)" } else { "" };
        println!("  [{}] {}{}", target.group_key, target.url, auth);
    }
    Ok(())
}
