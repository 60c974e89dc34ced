// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for daemon-scheduler integration tests.
//!
//! Provides TestContext, a fully wired scheduler, dispatcher and monitor over
//! a simulated cluster and an environment store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use daemon_scheduler::deployment_worker::DeploymentWorker;
use daemon_scheduler::engine::{Dispatcher, Event, Monitor, MonitorConfig, Scheduler, SchedulerConfig};
use daemon_scheduler::facade::{EcsOrchestrator, InMemoryCluster, Orchestrator};
use daemon_scheduler::service::{DeploymentService, EnvironmentFacade, EnvironmentService};
use daemon_scheduler::store::{EnvironmentStore, MemoryKeyValueStore};
use daemon_scheduler::types::{Deployment, Environment};

pub const TRACKING_TTL: Duration = Duration::from_secs(60);

/// Everything needed to drive reconciliation passes by hand.
pub struct TestContext {
    pub sim: Arc<InMemoryCluster>,
    pub cluster: String,
    pub store: EnvironmentStore,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub environments: EnvironmentService,
    pub deployments: DeploymentService,
    pub worker: DeploymentWorker,
    pub dispatcher: Dispatcher,
    pub scheduler: Scheduler,
    pub monitor: Monitor,
    /// Requests and reports written by the scheduler and the monitor.
    pub events: mpsc::Receiver<Event>,
    /// Results written by the dispatcher's run loop (unused by `handle_event`).
    pub results: mpsc::Receiver<Event>,
}

impl TestContext {
    /// Context over an in-memory store and an empty cluster named `prod`.
    pub async fn new() -> Self {
        Self::with_store(EnvironmentStore::new(Arc::new(MemoryKeyValueStore::new()))).await
    }

    pub async fn with_store(store: EnvironmentStore) -> Self {
        let sim = Arc::new(InMemoryCluster::new());
        let cluster = sim.add_cluster("prod").await;
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(EcsOrchestrator::new(sim.clone()));

        let environments = EnvironmentService::new(store.clone(), orchestrator.clone());
        let deployments = DeploymentService::new(store.clone(), orchestrator.clone());
        let worker = DeploymentWorker::new(
            store.clone(),
            deployments.clone(),
            EnvironmentFacade::new(sim.clone()),
            orchestrator.clone(),
        );

        let (events_tx, events_rx) = mpsc::channel(1000);
        let (results_tx, results_rx) = mpsc::channel(1000);

        let dispatcher = Dispatcher::new(
            deployments.clone(),
            worker.clone(),
            sim.clone(),
            orchestrator.clone(),
            results_tx,
        );
        let scheduler = Scheduler::new(
            environments.clone(),
            sim.clone(),
            orchestrator.clone(),
            events_tx.clone(),
            SchedulerConfig {
                interval: Duration::from_secs(10),
                tracking_ttl: TRACKING_TTL,
            },
        );
        let monitor = Monitor::new(environments.clone(), events_tx, MonitorConfig::default());

        Self {
            sim,
            cluster,
            store,
            orchestrator,
            environments,
            deployments,
            worker,
            dispatcher,
            scheduler,
            monitor,
            events: events_rx,
            results: results_rx,
        }
    }

    /// Add `count` active instances and return their ARNs.
    pub async fn add_instances(&self, count: usize) -> Vec<String> {
        let mut arns = Vec::with_capacity(count);
        for _ in 0..count {
            arns.push(self.sim.add_instance(&self.cluster).await.unwrap());
        }
        arns
    }

    pub async fn create_environment(&self, name: &str) -> Environment {
        self.environments
            .create_environment(name, "web:1", &self.cluster)
            .await
            .unwrap()
    }

    pub async fn environment(&self, name: &str) -> Environment {
        self.environments.get_environment(name).await.unwrap().unwrap()
    }

    /// Create a deployment with the environment's current token and start it
    /// without placing any task. The scheduler places them.
    pub async fn start_deployment(&self, name: &str) -> Deployment {
        let token = self.environment(name).await.token().to_string();
        self.deployments.create_deployment(name, &token).await.unwrap();
        self.deployments.start_deployment(name, &[]).await.unwrap()
    }

    /// Mark the environment's in-progress deployment completed.
    pub async fn complete_deployment(&self, name: &str) -> Deployment {
        let mut deployment = self
            .deployments
            .get_in_progress_deployment(name)
            .await
            .unwrap()
            .unwrap();
        deployment.update_to_completed(vec![]).unwrap();
        self.deployments
            .update_in_progress_deployment(name, &deployment)
            .await
            .unwrap();
        deployment
    }

    /// Everything the scheduler and monitor emitted so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Run one reconciliation pass and return what it emitted.
    pub async fn reconcile(&mut self) -> Vec<Event> {
        self.scheduler.reconcile().await;
        self.drain_events()
    }

    /// Hand every event to the dispatcher, in order, and collect its results.
    pub async fn dispatch(&self, events: Vec<Event>) -> Vec<Event> {
        let mut results = Vec::new();
        for event in events {
            if let Some(result) = self.dispatcher.handle_event(event).await {
                results.push(result);
            }
        }
        results
    }

    /// Reconcile, then carry out the emitted requests. Returns the requests.
    pub async fn tick(&mut self) -> Vec<Event> {
        let events = self.reconcile().await;
        let requests: Vec<Event> = events.into_iter().filter(is_request).collect();
        let summary = summarize(&requests);
        self.dispatch(requests).await;
        summary
    }
}

/// Whether the dispatcher acts on this event.
pub fn is_request(event: &Event) -> bool {
    matches!(
        event,
        Event::StartDeployment { .. }
            | Event::StopTasks { .. }
            | Event::UpdateInProgressDeployment { .. }
    )
}

/// Copies of the start/stop requests, comparable in assertions.
pub fn summarize(events: &[Event]) -> Vec<Event> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StartDeployment {
                environment,
                instances,
            } => Some(Event::StartDeployment {
                environment: environment.clone(),
                instances: instances.clone(),
            }),
            Event::StopTasks {
                cluster,
                tasks,
                environment,
            } => Some(Event::StopTasks {
                cluster: cluster.clone(),
                tasks: tasks.clone(),
                environment: environment.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Instance lists of every StartDeployment request, in emission order.
pub fn started_instances(events: &[Event]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StartDeployment { instances, .. } => Some(instances.clone()),
            _ => None,
        })
        .collect()
}

/// Task lists of every StopTasks request, in emission order.
pub fn stopped_tasks(events: &[Event]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StopTasks { tasks, .. } => Some(tasks.clone()),
            _ => None,
        })
        .collect()
}

pub fn sorted(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values
}
