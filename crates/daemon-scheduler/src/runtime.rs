// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the daemon scheduler.
//!
//! [`SchedulerRuntime`] wires the services, the deployment worker, the
//! dispatcher, the scheduler and the monitor, and runs the three loops on
//! the current tokio runtime until [`SchedulerRuntime::shutdown`].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use daemon_scheduler::facade::{EcsOrchestrator, InMemoryCluster};
//! use daemon_scheduler::runtime::SchedulerRuntime;
//! use daemon_scheduler::store::{EnvironmentStore, SqliteKeyValueStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let kv = SqliteKeyValueStore::from_path(".data/daemon-scheduler.db").await?;
//!     let cluster = Arc::new(InMemoryCluster::new());
//!
//!     let runtime = SchedulerRuntime::builder()
//!         .store(EnvironmentStore::new(Arc::new(kv)))
//!         .cluster_state(cluster.clone())
//!         .orchestrator(Arc::new(EcsOrchestrator::new(cluster)))
//!         .build()?
//!         .start();
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Unless an output sender is supplied with [`SchedulerRuntimeBuilder::output`],
//! the dispatcher's results are drained into the log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::deployment_worker::DeploymentWorker;
use crate::engine::{Dispatcher, Event, Monitor, MonitorConfig, Scheduler, SchedulerConfig};
use crate::facade::{ClusterState, Orchestrator};
use crate::service::{DeploymentService, EnvironmentFacade, EnvironmentService};
use crate::store::EnvironmentStore;

/// Default bound of the dispatcher's channels.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 100;

/// Builder for creating a [`SchedulerRuntime`].
pub struct SchedulerRuntimeBuilder {
    store: Option<EnvironmentStore>,
    cluster_state: Option<Arc<dyn ClusterState>>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    scheduler: SchedulerConfig,
    monitor: MonitorConfig,
    event_channel_capacity: usize,
    output: Option<mpsc::Sender<Event>>,
}

impl Default for SchedulerRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            cluster_state: None,
            orchestrator: None,
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            output: None,
        }
    }
}

impl SchedulerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take intervals, TTL and channel capacity from a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.scheduler_interval(config.scheduler_interval)
            .monitor_interval(config.monitor_interval)
            .tracking_ttl(config.tracking_ttl)
            .event_channel_capacity(config.event_channel_capacity)
    }

    /// Set the environment store (required).
    pub fn store(mut self, store: EnvironmentStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the cluster state view (required).
    pub fn cluster_state(mut self, cluster_state: Arc<dyn ClusterState>) -> Self {
        self.cluster_state = Some(cluster_state);
        self
    }

    /// Set the orchestrator (required).
    pub fn orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler.interval = interval;
        self
    }

    pub fn tracking_ttl(mut self, ttl: Duration) -> Self {
        self.scheduler.tracking_ttl = ttl;
        self
    }

    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor.interval = interval;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Send the dispatcher's results to `output` instead of the log.
    pub fn output(mut self, output: mpsc::Sender<Event>) -> Self {
        self.output = Some(output);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or a value is out of range.
    pub fn build(self) -> Result<SchedulerRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let cluster_state = self
            .cluster_state
            .ok_or_else(|| anyhow::anyhow!("cluster_state is required"))?;
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| anyhow::anyhow!("orchestrator is required"))?;

        if self.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity must be greater than zero");
        }
        if self.scheduler.interval.is_zero() || self.monitor.interval.is_zero() {
            anyhow::bail!("scheduler and monitor intervals must be greater than zero");
        }

        Ok(SchedulerRuntimeConfig {
            store,
            cluster_state,
            orchestrator,
            scheduler: self.scheduler,
            monitor: self.monitor,
            event_channel_capacity: self.event_channel_capacity,
            output: self.output,
        })
    }
}

/// Configuration for a [`SchedulerRuntime`].
pub struct SchedulerRuntimeConfig {
    store: EnvironmentStore,
    cluster_state: Arc<dyn ClusterState>,
    orchestrator: Arc<dyn Orchestrator>,
    scheduler: SchedulerConfig,
    monitor: MonitorConfig,
    event_channel_capacity: usize,
    output: Option<mpsc::Sender<Event>>,
}

impl SchedulerRuntimeConfig {
    /// Start the runtime, spawning the dispatcher, scheduler and monitor tasks.
    pub fn start(self) -> SchedulerRuntime {
        let cancel = CancellationToken::new();

        let environments = EnvironmentService::new(self.store.clone(), self.orchestrator.clone());
        let deployments = DeploymentService::new(self.store.clone(), self.orchestrator.clone());
        let worker = DeploymentWorker::new(
            self.store.clone(),
            deployments.clone(),
            EnvironmentFacade::new(self.cluster_state.clone()),
            self.orchestrator.clone(),
        );

        let (input_tx, input_rx) = mpsc::channel(self.event_channel_capacity);

        // Dispatcher results go to the caller, or into the log.
        let (output_tx, drain_handle) = match self.output {
            Some(output) => (output, None),
            None => {
                let (output_tx, output_rx) = mpsc::channel(self.event_channel_capacity);
                let drain_cancel = cancel.clone();
                let handle = tokio::spawn(drain_events(output_rx, drain_cancel));
                (output_tx, Some(handle))
            }
        };

        let dispatcher = Dispatcher::new(
            deployments.clone(),
            worker,
            self.cluster_state.clone(),
            self.orchestrator.clone(),
            output_tx,
        );
        let dispatcher_cancel = cancel.clone();
        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run(input_rx, dispatcher_cancel).await;
        });

        let scheduler = Scheduler::new(
            environments.clone(),
            self.cluster_state.clone(),
            self.orchestrator.clone(),
            input_tx.clone(),
            self.scheduler.clone(),
        );
        let scheduler_loop = scheduler.clone();
        let scheduler_cancel = cancel.clone();
        let scheduler_handle = tokio::spawn(async move {
            scheduler_loop.run(scheduler_cancel).await;
        });

        let monitor = Monitor::new(environments.clone(), input_tx.clone(), self.monitor.clone());
        let monitor_cancel = cancel.clone();
        let monitor_handle = tokio::spawn(async move {
            monitor.run(monitor_cancel).await;
        });

        info!(
            scheduler_id = %scheduler.id(),
            scheduler_interval_secs = self.scheduler.interval.as_secs(),
            monitor_interval_secs = self.monitor.interval.as_secs(),
            tracking_ttl_secs = self.scheduler.tracking_ttl.as_secs(),
            "SchedulerRuntime started"
        );

        SchedulerRuntime {
            cancel,
            dispatcher_handle,
            scheduler_handle,
            monitor_handle,
            drain_handle,
            events: input_tx,
            environments,
            deployments,
            scheduler,
        }
    }
}

/// A running daemon scheduler that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct SchedulerRuntime {
    cancel: CancellationToken,
    dispatcher_handle: JoinHandle<()>,
    scheduler_handle: JoinHandle<()>,
    monitor_handle: JoinHandle<()>,
    drain_handle: Option<JoinHandle<()>>,
    events: mpsc::Sender<Event>,
    environments: EnvironmentService,
    deployments: DeploymentService,
    scheduler: Scheduler,
}

impl SchedulerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SchedulerRuntimeBuilder {
        SchedulerRuntimeBuilder::new()
    }

    /// Environment operations backed by the runtime's store.
    pub fn environments(&self) -> &EnvironmentService {
        &self.environments
    }

    /// Deployment operations backed by the runtime's store.
    pub fn deployments(&self) -> &DeploymentService {
        &self.deployments
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Sender into the dispatcher's input channel.
    pub fn events(&self) -> mpsc::Sender<Event> {
        self.events.clone()
    }

    /// Token cancelled when the runtime shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Check if all loops are still running.
    pub fn is_running(&self) -> bool {
        !self.dispatcher_handle.is_finished()
            && !self.scheduler_handle.is_finished()
            && !self.monitor_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the dispatcher, scheduler and monitor to stop and waits for
    /// their loops to exit. Events already being handled are not interrupted.
    pub async fn shutdown(self) -> Result<()> {
        info!("SchedulerRuntime shutting down...");
        self.cancel.cancel();

        let mut panicked = Vec::new();
        if let Err(e) = self.scheduler_handle.await {
            error!("Scheduler task panicked: {}", e);
            panicked.push("scheduler");
        }
        if let Err(e) = self.monitor_handle.await {
            error!("Monitor task panicked: {}", e);
            panicked.push("monitor");
        }
        if let Err(e) = self.dispatcher_handle.await {
            error!("Dispatcher task panicked: {}", e);
            panicked.push("dispatcher");
        }
        if let Some(handle) = self.drain_handle
            && let Err(e) = handle.await
        {
            error!("Event drain task panicked: {}", e);
            panicked.push("event drain");
        }

        if !panicked.is_empty() {
            anyhow::bail!("tasks panicked during shutdown: {}", panicked.join(", "));
        }
        info!("SchedulerRuntime shutdown complete");
        Ok(())
    }
}

/// Log dispatcher results until cancelled or every sender is gone.
async fn drain_events(mut output: mpsc::Receiver<Event>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            event = output.recv() => {
                let Some(event) = event else {
                    break;
                };
                log_event(&event);
            }
        }
    }
}

fn log_event(event: &Event) {
    match event {
        Event::Error { error } | Event::MonitorError { error } => {
            warn!(event = event.kind(), error = %error, "Dispatcher reported an error");
        }
        Event::SchedulerError { error, environment } => {
            warn!(
                event = event.kind(),
                environment = environment.as_ref().map(|e| e.name()).unwrap_or("-"),
                error = %error,
                "Dispatcher reported an error"
            );
        }
        Event::StopTasksResult { stopped_tasks } => {
            debug!(event = event.kind(), stopped = stopped_tasks.len(), "Tasks stopped");
        }
        Event::StartDeploymentResult { deployment } => {
            debug!(
                event = event.kind(),
                deployment_id = %deployment.id(),
                status = %deployment.status(),
                "Deployment started"
            );
        }
        other => debug!(event = other.kind(), "Dispatcher event"),
    }
}
