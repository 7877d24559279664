//! Switchyard Coordinator - Main Entry Point
//!
//! Loads the fleet configuration, starts the backends in order and serves
//! inference traffic until SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use switchyard_common::SwitchyardConfig;
use switchyard_coordinator::{
    AdmissionController, BackendClient, CommandLauncher, DescriptorStore, Dispatcher, FleetAlert, HealthTracker,
    LifecycleSupervisor, OpsServer, OpsState, PrefixCache, Router,
};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "switchyard-coordinator", version, about = "Inference router for a local model fleet")]
struct Args {
    /// Fleet configuration file
    #[arg(short, long, env = "SWITCHYARD_CONFIG", default_value = "configs/switchyard.yaml")]
    config: PathBuf,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(config: &SwitchyardConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.observability.log_level;
        format!("switchyard_coordinator={level},switchyard_common={level}").into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.observability.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = SwitchyardConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    init_tracing(&config);
    info!(
        "Starting Switchyard Coordinator: {} backends in {} device groups",
        config.backends.len(),
        config.device_groups.len()
    );

    let store = Arc::new(DescriptorStore::from_config(&config.device_groups, &config.backends)?);
    let client = Arc::new(BackendClient::new(
        config.health.probe_path.clone(),
        config.routing.request_timeout(),
    )?);

    let health = Arc::new(HealthTracker::new(store.clone(), client.clone(), config.health.clone()));
    let admission = Arc::new(AdmissionController::new(config.admission.clone()));
    let cache = Arc::new(PrefixCache::new(config.prefix_cache.clone()));
    let router = Arc::new(Router::new(
        store.clone(),
        health.clone(),
        admission.clone(),
        cache.clone(),
        config.routing.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(router, client.clone()));
    let supervisor = Arc::new(LifecycleSupervisor::new(
        store,
        health.clone(),
        client,
        Arc::new(CommandLauncher),
        config.supervisor.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        health.clone().start(shutdown_rx.clone()),
        admission.start(shutdown_rx.clone()),
        cache.start_sweeper(shutdown_rx.clone()),
        supervisor.clone().start_exit_watch(shutdown_rx.clone()),
    ];

    let mut alerts = health.subscribe_alerts();
    tasks.push(tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            match alert {
                FleetAlert::BackendDown { backend_id, reason } => {
                    error!("ALERT: backend {} is down: {}", backend_id, reason)
                }
                FleetAlert::BackendRecovered { backend_id } => info!("Backend {} recovered", backend_id),
            }
        }
    }));

    let order = config.startup_order();
    let startup = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let report = supervisor.startup(&order).await;
            for (id, reason) in &report.failed {
                warn!("Backend {} unavailable after startup: {}", id, reason);
            }
        })
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .context("invalid bind address")?;
    let server = OpsServer::new(
        OpsState {
            dispatcher,
            health,
            metrics_enabled: config.observability.enable_metrics,
        },
        bind_addr,
    );
    let mut server_task = tokio::spawn(server.run(shutdown_rx));

    info!("Switchyard Coordinator running");

    tokio::select! {
        _ = wait_for_signal() => {}
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => warn!("Operations server stopped unexpectedly"),
                Ok(Err(e)) => error!("Operations server failed: {}", e),
                Err(e) => error!("Operations server task panicked: {}", e),
            }
        }
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    let report = supervisor.shutdown().await;
    if !report.forced.is_empty() {
        warn!("Force-terminated: {}", report.forced.join(", "));
    }

    startup.abort();
    if !server_task.is_finished() {
        let _ = server_task.await;
    }
    for task in tasks {
        task.abort();
    }

    info!("Switchyard Coordinator shutdown complete");
    Ok(())
}
