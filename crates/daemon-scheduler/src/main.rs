// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Daemon Scheduler server
//!
//! Runs the reconciliation scheduler, the in-progress monitor and the
//! dispatcher against a SQLite-backed environment store.
//!
//! Only the simulated cluster ships with this binary. Set `BLOX_SIM_CLUSTER`
//! (and optionally `BLOX_SIM_INSTANCES`, `BLOX_SIM_ENVIRONMENT`,
//! `BLOX_SIM_TASK_DEFINITION`) to run against it.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use daemon_scheduler::config::{Config, SimulationConfig};
use daemon_scheduler::deployment_worker::DeploymentWorker;
use daemon_scheduler::facade::{EcsOrchestrator, InMemoryCluster};
use daemon_scheduler::runtime::SchedulerRuntime;
use daemon_scheduler::service::{DeploymentService, EnvironmentFacade, EnvironmentService};
use daemon_scheduler::store::{EnvironmentStore, SqliteKeyValueStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "daemon_scheduler=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        database_path = %config.database_path.display(),
        scheduler_interval_secs = config.scheduler_interval.as_secs(),
        monitor_interval_secs = config.monitor_interval.as_secs(),
        "Starting Daemon Scheduler"
    );

    let kv = SqliteKeyValueStore::from_path(&config.database_path)
        .await
        .context("Failed to open environment store")?;
    let store = EnvironmentStore::new(Arc::new(kv)).with_max_retries(config.store_max_retries);

    info!("Environment store ready");

    let Some(simulation) = config.simulation.clone() else {
        anyhow::bail!(
            "No cluster backend configured; set BLOX_SIM_CLUSTER to run against the simulated cluster"
        );
    };

    let cluster = Arc::new(InMemoryCluster::new());
    let orchestrator = Arc::new(EcsOrchestrator::new(cluster.clone()));
    bootstrap_simulation(&cluster, &store, orchestrator.clone(), &simulation).await?;

    let runtime = SchedulerRuntime::builder()
        .config(&config)
        .store(store)
        .cluster_state(cluster)
        .orchestrator(orchestrator)
        .build()?
        .start();

    info!("Daemon Scheduler ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Daemon Scheduler shut down");

    Ok(())
}

/// Register the simulated cluster's instances and, if requested, create an
/// environment and start its first deployment.
async fn bootstrap_simulation(
    cluster: &Arc<InMemoryCluster>,
    store: &EnvironmentStore,
    orchestrator: Arc<EcsOrchestrator<Arc<InMemoryCluster>>>,
    simulation: &SimulationConfig,
) -> anyhow::Result<()> {
    let cluster_arn = cluster.add_cluster(&simulation.cluster).await;
    for _ in 0..simulation.instances {
        cluster.add_instance(&cluster_arn).await?;
    }
    info!(
        cluster = %cluster_arn,
        instances = simulation.instances,
        "Simulated cluster ready"
    );

    let Some(name) = &simulation.environment else {
        return Ok(());
    };

    let family = simulation
        .task_definition
        .split(':')
        .next()
        .unwrap_or(&simulation.task_definition);
    cluster.register_task_definition(family).await;

    let environments = EnvironmentService::new(store.clone(), orchestrator.clone());
    let deployments = DeploymentService::new(store.clone(), orchestrator.clone());
    let worker = DeploymentWorker::new(
        store.clone(),
        deployments.clone(),
        EnvironmentFacade::new(cluster.clone()),
        orchestrator,
    );

    let environment = match environments.get_environment(name).await? {
        Some(existing) => existing,
        None => {
            environments
                .register_environment(name, &simulation.task_definition, &simulation.cluster)
                .await?
        }
    };

    if environment.current_deployment()?.is_none() && environment.pending_deployment()?.is_none() {
        let deployment = deployments
            .create_deployment(name, environment.token())
            .await?;
        info!(
            environment = %name,
            deployment_id = %deployment.id(),
            "Created initial deployment"
        );
    }

    if let Some(deployment) = worker.start_pending_deployment(name).await? {
        info!(
            environment = %name,
            deployment_id = %deployment.id(),
            instances = deployment.desired_task_count(),
            "Started initial deployment"
        );
    }

    Ok(())
}
