use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use warden::attribution::GpuAttribution;
use warden::attribution::SystemdScopeMatcher;
use warden::config::AddUserArgs;
use warden::config::Cli;
use warden::config::Commands;
use warden::config::Config;
use warden::config::DaemonArgs;
use warden::daemon::EnforcementDaemon;
use warden::logging;
use warden::naming::NamingScheme;
use warden::quota::open_state_db;
use warden::runtime::DockerCli;
use warden::telemetry::GpuTelemetry;
use warden::telemetry::NvmlTelemetry;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon(args) => run_daemon(args).await,
        Commands::AddUser(args) => run_add_user(args).await,
    }
}

async fn run_daemon(args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(args.audit_log.as_deref());
    tracing::info!("starting pod-warden daemon");

    let config = Config::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    let defaults = config.default_quota.quota()?;
    let (users, quotas) = open_state_db(&args.state_db, defaults)
        .with_context(|| format!("opening state db at {}", args.state_db.display()))?;

    let telemetry = Arc::new(NvmlTelemetry::init().context("initializing NVML")?);
    let runtime = Arc::new(DockerCli::new());
    let naming = NamingScheme::new(config.name_prefix.clone());

    let gpu_ids: Vec<u32> = match &args.gpu_ids {
        Some(spec) => spec
            .split(',')
            .map(|id| id.trim().parse().context("invalid --gpu-ids"))
            .collect::<Result<_>>()?,
        None => (0..telemetry.device_count()?).collect(),
    };

    let attributor = Arc::new(GpuAttribution::new(
        Box::new(SystemdScopeMatcher::default()),
        runtime.clone(),
        naming,
    ));

    let daemon = EnforcementDaemon::new(
        telemetry,
        runtime,
        attributor,
        users,
        quotas,
        gpu_ids,
        Duration::from_secs(args.poll_interval_secs),
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            signal_cancel.cancel();
        }
    });

    daemon.run(cancel).await;
    Ok(())
}

async fn run_add_user(args: AddUserArgs) -> Result<()> {
    utils::logging::init();
    let (users, _) = open_state_db(&args.state_db, Default::default())?;
    let tenant = users.add_user(&args.username, &args.password, args.admin)?;
    println!("added user {} (id {})", tenant.name, tenant.userid);
    Ok(())
}
