//! Apiary control-plane entry point.
//!
//! Builds the whole object graph once (no ambient singletons), runs
//! until interrupted, then drains in reverse dependency order.
//!
//! Exit codes: 0 normal shutdown, 1 unrecoverable startup error,
//! 2 bad configuration, 130 on external interrupt.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use apiary::application::{
    AutoScaler, ControlCommandExecutor, MetricsCollector, MetricsRing, ProcessManager,
    SwarmCoordinator,
};
use apiary::domain::models::Config;
use apiary::domain::ports::{Clock, SystemClock, UuidSource};
use apiary::gateway::{ConnectionRegistry, ConsoleGateway, GatewayState};
use apiary::infrastructure::config::ConfigLoader;
use apiary::infrastructure::database::{
    AgentRepositoryImpl, DatabaseConnection, MemoryRepositoryImpl, ScalingRepositoryImpl,
    SwarmRepositoryImpl, TaskRepositoryImpl,
};
use apiary::infrastructure::logging;
use apiary::infrastructure::process::TokioProcessRunner;
use apiary::services::EventBus;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

const EXIT_OK: i32 = 0;
const EXIT_STARTUP: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_INTERRUPT: i32 = 130;

#[tokio::main]
async fn main() {
    let config = match ConfigLoader::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("apiary: configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    logging::init(&config.log_level);

    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Unrecoverable startup error");
            EXIT_STARTUP
        }
    };
    std::process::exit(code);
}

async fn run(config: Config) -> Result<i32> {
    info!(
        data_path = %config.data_path,
        bind = %format!("{}:{}", config.bind_host, config.bind_port),
        max_agents = config.max_agents,
        "Starting apiary control plane"
    );

    if let Some(parent) = std::path::Path::new(&config.data_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data directory {}", parent.display()))?;
        }
    }

    let db = DatabaseConnection::new(&format!("sqlite:{}", config.data_path))
        .await
        .context("failed to open database")?;
    db.migrate().await.context("failed to run migrations")?;

    let agent_repo = Arc::new(AgentRepositoryImpl::new(db.pool().clone()));
    let task_repo = Arc::new(TaskRepositoryImpl::new(db.pool().clone()));
    let swarm_repo = Arc::new(SwarmRepositoryImpl::new(db.pool().clone()));
    let scaling_repo = Arc::new(ScalingRepositoryImpl::new(db.pool().clone()));
    let memory_repo = Arc::new(MemoryRepositoryImpl::new(db.pool().clone()));

    let clock = Arc::new(SystemClock);
    let ids = Arc::new(UuidSource);
    let bus = Arc::new(EventBus::default());

    let (agent_events_tx, agent_events_rx) = mpsc::channel(256);
    let apm = Arc::new(ProcessManager::new(
        Arc::new(TokioProcessRunner),
        config.process.clone(),
        clock.clone(),
        agent_events_tx,
    ));

    let coordinator = Arc::new(SwarmCoordinator::new(
        agent_repo,
        task_repo,
        swarm_repo,
        Arc::clone(&apm),
        agent_events_rx,
        Arc::clone(&bus),
        clock.clone(),
        ids.clone(),
        config.clone(),
    ));
    coordinator
        .recover()
        .await
        .context("failed to recover persisted state")?;
    coordinator.start();

    let ring = Arc::new(MetricsRing::new(config.metrics.ring_capacity));
    let collector = Arc::new(MetricsCollector::new(
        Arc::clone(&ring),
        Arc::clone(&coordinator),
        Arc::clone(&bus),
        clock.clone(),
        config.metrics.clone(),
        config.metrics_interval_ms,
    ));
    let collector_handle = collector.start();

    let scaler = Arc::new(AutoScaler::new(
        Arc::clone(&coordinator),
        scaling_repo,
        Arc::clone(&ring),
        Arc::clone(&bus),
        clock.clone(),
        ids.clone(),
        config.clone(),
    ));
    let scaler_handle = scaler.start();

    let executor = Arc::new(ControlCommandExecutor::new(
        Arc::clone(&coordinator),
        Arc::clone(&scaler),
        memory_repo,
        clock.clone(),
        ids.clone(),
    ));

    let gateway_state = Arc::new(GatewayState {
        executor,
        registry: Arc::new(ConnectionRegistry::new(config.max_connections)),
        bus: Arc::clone(&bus),
        coordinator: Arc::clone(&coordinator),
        clock: clock.clone(),
        auth_token: config.auth_token.clone(),
        command_timeout: Duration::from_secs(30),
        started_at: clock.now(),
    });
    let gateway = Arc::new(ConsoleGateway::new(gateway_state));
    let bind_addr = format!("{}:{}", config.bind_host, config.bind_port);
    let gateway_handle = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if let Err(e) = gateway.serve(&bind_addr, None).await {
                error!(error = %format!("{e:#}"), "Gateway server failed");
            }
        })
    };

    info!("Control plane up");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            true
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            false
        }
    };

    // Drain in reverse dependency order.
    gateway.shutdown();
    scaler.shutdown();
    collector.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), gateway_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), scaler_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), collector_handle).await;
    coordinator.shutdown().await;
    db.close().await;
    info!("Shutdown complete");

    Ok(if interrupted { EXIT_INTERRUPT } else { EXIT_OK })
}
