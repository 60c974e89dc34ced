// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment worker.
//!
//! Drives one environment's deployment forward:
//!
//! - [`DeploymentWorker::start_pending_deployment`] starts the pending
//!   deployment on every usable instance of the cluster.
//! - [`DeploymentWorker::update_in_progress_deployment`] asks the
//!   orchestrator for the tasks of the in-progress deployment and completes
//!   it once at least one task exists and none is still `PENDING`.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::facade::{Orchestrator, TASK_PENDING, Task};
use crate::service::{DeploymentService, EnvironmentFacade};
use crate::store::EnvironmentStore;
use crate::types::Deployment;

/// Advances deployments based on authoritative task status.
#[derive(Clone)]
pub struct DeploymentWorker {
    store: EnvironmentStore,
    deployments: DeploymentService,
    environment_facade: EnvironmentFacade,
    orchestrator: Arc<dyn Orchestrator>,
}

impl DeploymentWorker {
    /// Create a worker.
    pub fn new(
        store: EnvironmentStore,
        deployments: DeploymentService,
        environment_facade: EnvironmentFacade,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        Self {
            store,
            deployments,
            environment_facade,
            orchestrator,
        }
    }

    /// Start the environment's pending deployment on all of its cluster's
    /// instances. Returns `None` when there is nothing to start.
    pub async fn start_pending_deployment(&self, environment: &str) -> Result<Option<Deployment>> {
        let Some(env) = self.store.get_environment(environment).await? else {
            debug!(environment = %environment, "Environment does not exist, nothing to start");
            return Ok(None);
        };
        if env.in_progress_deployment()?.is_some() || env.pending_deployment()?.is_none() {
            return Ok(None);
        }

        let instance_arns = self.environment_facade.instance_arns(&env).await?;
        let deployment = self
            .deployments
            .start_deployment(environment, &instance_arns)
            .await?;
        Ok(Some(deployment))
    }

    /// Refresh the in-progress deployment from the orchestrator and complete
    /// it when all of its tasks have launched.
    ///
    /// Returns `None` when there is no in-progress deployment, or when another
    /// writer advanced the deployment first.
    pub async fn update_in_progress_deployment(
        &self,
        environment: &str,
    ) -> Result<Option<Deployment>> {
        let Some(env) = self.store.get_environment(environment).await? else {
            return Ok(None);
        };
        let Some(mut deployment) = env.in_progress_deployment()?.cloned() else {
            return Ok(None);
        };

        let task_arns = self
            .orchestrator
            .list_tasks(env.cluster(), deployment.id())
            .await?;
        let described = self
            .orchestrator
            .describe_tasks(env.cluster(), &task_arns)
            .await?;

        if deployment_completed(&described.tasks) {
            deployment.update_to_completed(Vec::new())?;
        } else {
            deployment.update_to_in_progress(deployment.desired_task_count(), described.failures)?;
        }

        match self
            .deployments
            .update_in_progress_deployment(environment, &deployment)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_unexpected_deployment_status() => {
                debug!(
                    environment = %environment,
                    deployment_id = %deployment.id(),
                    "Deployment was advanced concurrently, dropping update"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        if deployment.end_time().is_some() {
            info!(
                environment = %environment,
                deployment_id = %deployment.id(),
                tasks = described.tasks.len(),
                "Deployment completed"
            );
        }
        Ok(Some(deployment))
    }
}

fn deployment_completed(tasks: &[Task]) -> bool {
    !tasks.is_empty() && tasks.iter().all(|t| t.last_status != TASK_PENDING)
}
