// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event dispatcher.
//!
//! Reads requests from its input channel and handles each one on its own
//! task, so a slow orchestrator call for one environment never holds up
//! another. Results and failures are written to the output channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::Event;
use crate::deployment_worker::DeploymentWorker;
use crate::error::Error;
use crate::facade::{ClusterState, Orchestrator, TASK_STOPPED};
use crate::service::DeploymentService;
use crate::types::Environment;

/// Routes scheduler and monitor requests to the services that carry them out.
#[derive(Clone)]
pub struct Dispatcher {
    deployments: DeploymentService,
    worker: DeploymentWorker,
    cluster_state: Arc<dyn ClusterState>,
    orchestrator: Arc<dyn Orchestrator>,
    output: mpsc::Sender<Event>,
}

impl Dispatcher {
    pub fn new(
        deployments: DeploymentService,
        worker: DeploymentWorker,
        cluster_state: Arc<dyn ClusterState>,
        orchestrator: Arc<dyn Orchestrator>,
        output: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            deployments,
            worker,
            cluster_state,
            orchestrator,
            output,
        }
    }

    /// Consume `input` until `cancel` fires or every sender is gone.
    ///
    /// Events already being handled keep running after shutdown.
    pub async fn run(&self, mut input: mpsc::Receiver<Event>, cancel: CancellationToken) {
        info!("Dispatcher started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Dispatcher received shutdown signal");
                    break;
                }

                event = input.recv() => {
                    let Some(event) = event else {
                        info!("Dispatcher input closed");
                        break;
                    };
                    let dispatcher = self.clone();
                    tokio::spawn(async move {
                        if let Some(result) = dispatcher.handle_event(event).await {
                            dispatcher.emit(result).await;
                        }
                    });
                }
            }
        }

        info!("Dispatcher stopped");
    }

    /// Handle one event and return the event to report, if any.
    pub async fn handle_event(&self, event: Event) -> Option<Event> {
        match event {
            Event::StartDeployment {
                environment,
                instances,
            } => Some(self.start_deployment(&environment, &instances).await),
            Event::StopTasks {
                cluster,
                tasks,
                environment,
            } => Some(self.stop_tasks(&cluster, &tasks, &environment).await),
            Event::UpdateInProgressDeployment { environment } => {
                self.update_in_progress_deployment(&environment).await
            }
            report => {
                if report.is_error() {
                    warn!(
                        event = report.kind(),
                        environment = report.environment_name().unwrap_or("-"),
                        details = ?report,
                        "Received error report"
                    );
                } else {
                    debug!(event = report.kind(), "Received event");
                }
                None
            }
        }
    }

    async fn start_deployment(&self, environment: &Environment, instances: &[String]) -> Event {
        match self
            .deployments
            .create_sub_deployment(environment.name(), instances)
            .await
        {
            Ok(deployment) => {
                info!(
                    environment = %environment.name(),
                    deployment_id = %deployment.id(),
                    instances = instances.len(),
                    "Started deployment on instances"
                );
                Event::StartDeploymentResult { deployment }
            }
            Err(e) => {
                error!(
                    environment = %environment.name(),
                    instances = instances.len(),
                    error = %e,
                    "Error starting deployment on instances"
                );
                Event::Error {
                    error: e.context(format!(
                        "Error starting deployment using environment {} on {} instances",
                        environment.name(),
                        instances.len()
                    )),
                }
            }
        }
    }

    async fn stop_tasks(&self, cluster: &str, tasks: &[String], environment: &Environment) -> Event {
        let known = match self.cluster_state.list_tasks(cluster).await {
            Ok(known) => known,
            Err(e) => {
                error!(cluster = %cluster, error = %e, "Error getting tasks in cluster");
                return Event::Error {
                    error: Error::from(e).context(format!(
                        "Error getting tasks in cluster {} to stop for environment {}",
                        cluster,
                        environment.name()
                    )),
                };
            }
        };
        let known: HashMap<&str, &str> = known
            .iter()
            .map(|t| (t.arn.as_str(), t.desired_status.as_str()))
            .collect();

        let mut stopped_tasks = Vec::new();
        for task_arn in tasks {
            let Some(desired_status) = known.get(task_arn.as_str()) else {
                debug!(task_arn = %task_arn, "Skipping task unknown to cluster state");
                continue;
            };
            if *desired_status == TASK_STOPPED {
                stopped_tasks.push(task_arn.clone());
                continue;
            }
            if let Err(e) = self.orchestrator.stop_task(cluster, task_arn).await {
                error!(task_arn = %task_arn, error = %e, "Error stopping task");
                continue;
            }
            stopped_tasks.push(task_arn.clone());
        }

        info!(
            environment = %environment.name(),
            stopped = stopped_tasks.len(),
            requested = tasks.len(),
            "Stopped tasks"
        );
        Event::StopTasksResult { stopped_tasks }
    }

    async fn update_in_progress_deployment(&self, environment: &Environment) -> Option<Event> {
        match self
            .worker
            .update_in_progress_deployment(environment.name())
            .await
        {
            Ok(Some(deployment)) => {
                debug!(
                    environment = %environment.name(),
                    deployment_id = %deployment.id(),
                    status = %deployment.status(),
                    "Refreshed in-progress deployment"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                error!(
                    environment = %environment.name(),
                    error = %e,
                    "Error updating in-progress deployment"
                );
                Some(Event::Error {
                    error: e.context(format!(
                        "Error updating in-progress deployment of environment {}",
                        environment.name()
                    )),
                })
            }
        }
    }

    async fn emit(&self, event: Event) {
        let kind = event.kind();
        if self.output.send(event).await.is_err() {
            debug!(event = kind, "Dispatcher output closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{ApiCall, EcsOrchestrator, InMemoryCluster, TASK_RUNNING};
    use crate::service::{EnvironmentFacade, EnvironmentService};
    use crate::store::{EnvironmentStore, MemoryKeyValueStore};
    use crate::types::DeploymentStatus;

    struct Fixture {
        sim: Arc<InMemoryCluster>,
        cluster: String,
        environments: EnvironmentService,
        deployments: DeploymentService,
        dispatcher: Dispatcher,
        output: mpsc::Receiver<Event>,
    }

    async fn fixture() -> Fixture {
        let sim = Arc::new(InMemoryCluster::new());
        let cluster = sim.add_cluster("prod").await;
        let store = EnvironmentStore::new(Arc::new(MemoryKeyValueStore::new()));
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(EcsOrchestrator::new(sim.clone()));
        let environments = EnvironmentService::new(store.clone(), orchestrator.clone());
        let deployments = DeploymentService::new(store.clone(), orchestrator.clone());
        let worker = DeploymentWorker::new(
            store,
            deployments.clone(),
            EnvironmentFacade::new(sim.clone()),
            orchestrator.clone(),
        );
        let (tx, rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(
            deployments.clone(),
            worker,
            sim.clone(),
            orchestrator,
            tx,
        );

        Fixture {
            sim,
            cluster,
            environments,
            deployments,
            dispatcher,
            output: rx,
        }
    }

    async fn started_environment(f: &Fixture) -> Environment {
        let env = f
            .environments
            .create_environment("web", "web:1", &f.cluster)
            .await
            .unwrap();
        f.deployments.create_deployment("web", env.token()).await.unwrap();
        f.deployments.start_deployment("web", &[]).await.unwrap();
        f.environments.get_environment("web").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_start_deployment_extends_current_deployment() {
        let f = fixture().await;
        let instance = f.sim.add_instance(&f.cluster).await.unwrap();
        let env = started_environment(&f).await;

        let result = f
            .dispatcher
            .handle_event(Event::StartDeployment {
                environment: env,
                instances: vec![instance.clone()],
            })
            .await;

        match result {
            Some(Event::StartDeploymentResult { deployment }) => {
                assert_eq!(deployment.status(), DeploymentStatus::InProgress);
            }
            other => panic!("unexpected result {:?}", other),
        }
        let tasks = f.sim.tasks(&f.cluster).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].instance_arn, instance);
    }

    #[tokio::test]
    async fn test_start_deployment_without_deployment_reports_error() {
        let f = fixture().await;
        let instance = f.sim.add_instance(&f.cluster).await.unwrap();
        let env = f
            .environments
            .create_environment("web", "web:1", &f.cluster)
            .await
            .unwrap();

        let result = f
            .dispatcher
            .handle_event(Event::StartDeployment {
                environment: env,
                instances: vec![instance],
            })
            .await;

        match result {
            Some(Event::Error { error }) => {
                assert!(error.is_not_found());
                assert!(
                    error
                        .to_string()
                        .starts_with("Error starting deployment using environment web on 1 instances"),
                    "{}",
                    error
                );
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_tasks_skips_unknown_and_counts_already_stopped() {
        let f = fixture().await;
        let instance = f.sim.add_instance(&f.cluster).await.unwrap();
        let env = started_environment(&f).await;
        let running = f
            .sim
            .insert_task(&f.cluster, &instance, "old", "web:1")
            .await
            .unwrap();
        let stopped = f
            .sim
            .insert_task(&f.cluster, &instance, "old", "web:1")
            .await
            .unwrap();
        f.dispatcher
            .orchestrator
            .stop_task(&f.cluster, &stopped)
            .await
            .unwrap();
        f.sim.reset_call_counts();

        let result = f
            .dispatcher
            .handle_event(Event::StopTasks {
                cluster: f.cluster.clone(),
                tasks: vec![running.clone(), stopped.clone(), "unknown".to_string()],
                environment: env,
            })
            .await;

        match result {
            Some(Event::StopTasksResult { stopped_tasks }) => {
                assert_eq!(stopped_tasks, vec![running.clone(), stopped]);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(f.sim.call_count(ApiCall::StopTask), 1);
        let task = f
            .sim
            .tasks(&f.cluster)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.arn == running)
            .unwrap();
        assert_eq!(task.desired_status, TASK_STOPPED);
    }

    #[tokio::test]
    async fn test_stop_tasks_leaves_out_failed_stops() {
        let f = fixture().await;
        let instance = f.sim.add_instance(&f.cluster).await.unwrap();
        let env = started_environment(&f).await;
        let task = f
            .sim
            .insert_task(&f.cluster, &instance, "old", "web:1")
            .await
            .unwrap();
        f.sim.fail_calls(ApiCall::StopTask, "throttled").await;

        let result = f
            .dispatcher
            .handle_event(Event::StopTasks {
                cluster: f.cluster.clone(),
                tasks: vec![task],
                environment: env,
            })
            .await;

        assert!(matches!(
            result,
            Some(Event::StopTasksResult { stopped_tasks }) if stopped_tasks.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_update_in_progress_deployment() {
        let f = fixture().await;
        let instance = f.sim.add_instance(&f.cluster).await.unwrap();
        let env = started_environment(&f).await;
        f.dispatcher
            .handle_event(Event::StartDeployment {
                environment: env.clone(),
                instances: vec![instance],
            })
            .await;
        f.sim.mark_tasks_running(&f.cluster).await.unwrap();

        let result = f
            .dispatcher
            .handle_event(Event::UpdateInProgressDeployment {
                environment: env.clone(),
            })
            .await;
        assert!(result.is_none());

        let current = f.deployments.get_current_deployment("web").await.unwrap().unwrap();
        assert_eq!(current.status(), DeploymentStatus::Completed);

        f.sim
            .fail_calls(ApiCall::ListTasksByStartedBy, "throttled")
            .await;
        // Nothing in progress any more, so the orchestrator is not asked.
        assert!(
            f.dispatcher
                .handle_event(Event::UpdateInProgressDeployment { environment: env })
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_update_in_progress_deployment_failure_reports_error() {
        let f = fixture().await;
        let env = started_environment(&f).await;
        f.sim
            .fail_calls(ApiCall::ListTasksByStartedBy, "throttled")
            .await;

        let result = f
            .dispatcher
            .handle_event(Event::UpdateInProgressDeployment { environment: env })
            .await;
        match result {
            Some(Event::Error { error }) => {
                assert!(matches!(error.root(), Error::Facade(_)));
                assert!(error.to_string().contains("environment web"), "{}", error);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reports_are_dropped() {
        let f = fixture().await;
        let env = started_environment(&f).await;

        for event in [
            Event::SchedulerEnvironment {
                environment: env.clone(),
                message: "done".to_string(),
            },
            Event::SchedulerError {
                error: Error::Other("boom".to_string()),
                environment: Some(env),
            },
            Event::StopTasksResult {
                stopped_tasks: vec![],
            },
        ] {
            assert!(f.dispatcher.handle_event(event).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_run_forwards_results_until_cancelled() {
        let mut f = fixture().await;
        let instance = f.sim.add_instance(&f.cluster).await.unwrap();
        let env = started_environment(&f).await;
        let task = f
            .sim
            .insert_task(&f.cluster, &instance, "old", "web:1")
            .await
            .unwrap();

        let (input_tx, input_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let dispatcher = f.dispatcher.clone();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { dispatcher.run(input_rx, run_cancel).await });

        input_tx
            .send(Event::StopTasks {
                cluster: f.cluster.clone(),
                tasks: vec![task.clone()],
                environment: env,
            })
            .await
            .unwrap();

        match f.output.recv().await {
            Some(Event::StopTasksResult { stopped_tasks }) => assert_eq!(stopped_tasks, vec![task]),
            other => panic!("unexpected output {:?}", other),
        }

        cancel.cancel();
        handle.await.unwrap();
        let running = f.sim.tasks(&f.cluster).await.unwrap();
        assert!(running.iter().all(|t| t.desired_status != TASK_RUNNING));
    }
}
