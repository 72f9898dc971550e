use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use hami_scheduler::config::load_device_config;
use hami_scheduler::config::Cli;
use hami_scheduler::config::Commands;
use hami_scheduler::config::RegisterArgs;
use hami_scheduler::config::SchedulerArgs;
use hami_scheduler::device::DeviceRegistry;
use hami_scheduler::health::HealthBroker;
use hami_scheduler::k8s::KubeApiClient;
use hami_scheduler::logging;
use hami_scheduler::nodelock::NodeLockConfig;
use hami_scheduler::registration::watch_inventory_health;
use hami_scheduler::registration::Registrar;
use hami_scheduler::registration::YamlInventory;
use hami_scheduler::scheduler::Scheduler;
use hami_scheduler::scheduler::SchedulerConfig;
use hami_scheduler::score::ScorePolicies;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use utils::version;

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
        Commands::Scheduler(scheduler_args) => run_scheduler(scheduler_args).await,
        Commands::Register(register_args) => run_register(register_args).await,
    }
}

/// Cancel `token` on SIGTERM or SIGINT.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        token.cancel();
    });
    Ok(())
}

async fn load_registry(path: Option<&std::path::Path>) -> Result<Arc<DeviceRegistry>> {
    let device_config = load_device_config(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load device config: {e:?}"))?;
    Ok(Arc::new(DeviceRegistry::new(&device_config)))
}

async fn run_scheduler(args: SchedulerArgs) -> Result<()> {
    let _guard = logging::init(args.audit_log.as_deref())?;

    tracing::info!("Starting hami scheduler {}", &**version::VERSION);

    let registry = load_registry(args.device_config.as_deref()).await?;
    let client = KubeApiClient::connect(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Kubernetes: {e:?}"))?;

    let scheduler = Scheduler::new(
        Arc::new(client),
        registry,
        SchedulerConfig {
            scheduler_name: args.scheduler_name.clone(),
            policies: ScorePolicies {
                node: args.node_scheduler_policy,
                gpu: args.gpu_scheduler_policy,
            },
            resync_interval: args.resync_interval(),
        },
        NodeLockConfig {
            expire: args.node_lock_expire(),
            ..Default::default()
        },
    );

    let cancellation_token = CancellationToken::new();
    spawn_signal_handler(cancellation_token.clone())?;
    scheduler.run(cancellation_token).await;

    tracing::info!("Scheduler stopped");
    Ok(())
}

async fn run_register(args: RegisterArgs) -> Result<()> {
    let _guard = logging::init(None)?;

    tracing::info!("Starting hami device registration {}", &**version::VERSION);

    let registry = load_registry(args.device_config.as_deref()).await?;
    let vendor = registry
        .get(&args.device_type)
        .cloned()
        .with_context(|| format!("unknown device type {}", args.device_type))?;
    let client = KubeApiClient::connect(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Kubernetes: {e:?}"))?;

    let inventory = Arc::new(YamlInventory::new(&args.inventory));
    let broker = Arc::new(HealthBroker::new());
    let registrar = Registrar::new(
        Arc::new(client),
        args.node_name.clone(),
        vendor,
        inventory.clone(),
        broker.clone(),
        args.register_interval(),
    );

    let cancellation_token = CancellationToken::new();
    spawn_signal_handler(cancellation_token.clone())?;

    let (health_tx, health_rx) = mpsc::channel(16);
    let watcher = tokio::spawn(watch_inventory_health(
        inventory,
        args.node_name.clone(),
        args.register_interval(),
        health_tx,
        cancellation_token.clone(),
    ));
    let fan_out = tokio::spawn({
        let broker = broker.clone();
        let token = cancellation_token.clone();
        async move { broker.run(health_rx, token).await }
    });

    registrar.run(cancellation_token).await;
    let _ = futures::future::join(watcher, fan_out).await;

    tracing::info!("Registration stopped");
    Ok(())
}
