// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment operations.
//!
//! Every write is an [`EnvironmentMutation`] run by
//! [`EnvironmentStore::put_environment`], so each rule below is checked
//! against the latest stored environment and retried on conflicts.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::facade::Orchestrator;
use crate::store::{EnvironmentMutation, EnvironmentStore};
use crate::types::{Deployment, DeploymentStatus, Environment};

/// Creates, starts and advances deployments of environments.
#[derive(Clone)]
pub struct DeploymentService {
    store: EnvironmentStore,
    orchestrator: Arc<dyn Orchestrator>,
}

impl DeploymentService {
    /// Create a service over a store and an orchestrator.
    pub fn new(store: EnvironmentStore, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Add a pending deployment of the environment's desired task definition.
    ///
    /// `token` must be the environment's current token. On success the
    /// environment's token rotates, so retrying the same request fails.
    pub async fn create_deployment(&self, environment: &str, token: &str) -> Result<Deployment> {
        require_name(environment, "creating a deployment")?;
        if token.is_empty() {
            return Err(Error::BadRequest(
                "Token is missing when creating a deployment".to_string(),
            ));
        }

        let deployment = self
            .store
            .put_environment(environment, &ValidateAndCreateDeployment::new(token))
            .await?;

        info!(
            environment = %environment,
            deployment_id = %deployment.id(),
            task_definition = %deployment.task_definition(),
            "Created pending deployment"
        );
        Ok(deployment)
    }

    /// Extend the current deployment onto additional instances.
    pub async fn create_sub_deployment(
        &self,
        environment: &str,
        instance_arns: &[String],
    ) -> Result<Deployment> {
        require_name(environment, "creating a sub-deployment")?;

        let mutation = ValidateAndCreateSubDeployment::new(self.orchestrator.clone(), instance_arns);
        let deployment = self.store.put_environment(environment, &mutation).await?;

        debug!(
            environment = %environment,
            deployment_id = %deployment.id(),
            instances = instance_arns.len(),
            "Created sub-deployment"
        );
        Ok(deployment)
    }

    /// Start the pending deployment on the given instances.
    pub async fn start_deployment(
        &self,
        environment: &str,
        instance_arns: &[String],
    ) -> Result<Deployment> {
        require_name(environment, "starting a deployment")?;

        let mutation = ValidateAndStartDeployment::new(self.orchestrator.clone(), instance_arns);
        let deployment = self.store.put_environment(environment, &mutation).await?;

        info!(
            environment = %environment,
            deployment_id = %deployment.id(),
            instances = instance_arns.len(),
            failures = deployment.failed_instances().len(),
            "Started deployment"
        );
        Ok(deployment)
    }

    /// Replace the environment's in-progress deployment with an updated version.
    ///
    /// Fails with [`Error::UnexpectedDeploymentStatus`] when `deployment` is no
    /// longer the environment's in-progress deployment.
    pub async fn update_in_progress_deployment(
        &self,
        environment: &str,
        deployment: &Deployment,
    ) -> Result<()> {
        require_name(environment, "updating a deployment")?;

        self.store
            .put_environment(
                environment,
                &ValidateAndUpdateInProgressDeployment::new(deployment.clone()),
            )
            .await
    }

    /// Look up a deployment by ID.
    pub async fn get_deployment(&self, environment: &str, id: &str) -> Result<Option<Deployment>> {
        if id.is_empty() {
            return Err(Error::BadRequest(
                "ID is missing when getting a deployment".to_string(),
            ));
        }
        let env = self.load(environment).await?;
        Ok(env.deployment(id).cloned())
    }

    /// The in-progress deployment, else the latest completed one.
    pub async fn get_current_deployment(&self, environment: &str) -> Result<Option<Deployment>> {
        let env = self.load(environment).await?;
        Ok(env.current_deployment()?.cloned())
    }

    /// The pending deployment, if any.
    pub async fn get_pending_deployment(&self, environment: &str) -> Result<Option<Deployment>> {
        let env = self.load(environment).await?;
        Ok(env.pending_deployment()?.cloned())
    }

    /// The in-progress deployment, if any.
    pub async fn get_in_progress_deployment(
        &self,
        environment: &str,
    ) -> Result<Option<Deployment>> {
        let env = self.load(environment).await?;
        Ok(env.in_progress_deployment()?.cloned())
    }

    /// All deployments, latest first.
    pub async fn list_deployments_sorted_reverse_chronologically(
        &self,
        environment: &str,
    ) -> Result<Vec<Deployment>> {
        let env = self.load(environment).await?;
        Ok(env.sorted_deployments().into_iter().cloned().collect())
    }

    async fn load(&self, environment: &str) -> Result<Environment> {
        require_name(environment, "reading deployments")?;
        self.store
            .get_environment(environment)
            .await?
            .ok_or_else(|| not_found(environment))
    }
}

/// Adds a pending deployment after checking the token and that no deployment
/// is in progress. An unstarted pending deployment is replaced. Outputs the
/// created deployment.
pub struct ValidateAndCreateDeployment {
    token: String,
}

impl ValidateAndCreateDeployment {
    /// Create the mutation for a request carrying `token`.
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl EnvironmentMutation for ValidateAndCreateDeployment {
    type Output = Deployment;

    async fn apply(&self, existing: Option<Environment>) -> Result<(Environment, Deployment)> {
        let mut env = existing.ok_or_else(|| Error::NotFound("Environment does not exist".to_string()))?;

        verify_token(&env, &self.token)?;
        if let Some(in_progress) = env.in_progress_deployment_id() {
            return Err(Error::BadRequest(format!(
                "There is already a deployment in progress: {}",
                in_progress
            )));
        }

        let deployment = Deployment::new(env.desired_task_definition(), env.token())?;
        if let Some(superseded) = env.add_pending_deployment(deployment.clone())? {
            debug!(
                environment = %env.name(),
                deployment_id = %superseded.id(),
                "Replacing pending deployment that was never started"
            );
        }
        env.rotate_token();
        Ok((env, deployment))
    }
}

/// Starts tasks for the current deployment on extra instances. Outputs the
/// (possibly unchanged) current deployment.
pub struct ValidateAndCreateSubDeployment {
    orchestrator: Arc<dyn Orchestrator>,
    instance_arns: Vec<String>,
}

impl ValidateAndCreateSubDeployment {
    /// Create the mutation for the given instances.
    pub fn new(orchestrator: Arc<dyn Orchestrator>, instance_arns: &[String]) -> Self {
        Self {
            orchestrator,
            instance_arns: instance_arns.to_vec(),
        }
    }
}

#[async_trait]
impl EnvironmentMutation for ValidateAndCreateSubDeployment {
    type Output = Deployment;

    async fn apply(&self, existing: Option<Environment>) -> Result<(Environment, Deployment)> {
        let mut env = existing.ok_or_else(|| Error::NotFound("Environment does not exist".to_string()))?;

        let current = env.current_deployment()?.cloned().ok_or_else(|| {
            Error::NotFound(format!(
                "There is no deployment for environment with name '{}' to create a sub-deployment",
                env.name()
            ))
        })?;

        let deployment = start_tasks_and_update_deployment_info(
            self.orchestrator.as_ref(),
            &mut env,
            current,
            &self.instance_arns,
        )
        .await?;
        Ok((env, deployment))
    }
}

/// Starts tasks for the pending deployment and promotes it to in progress.
/// Outputs the started deployment.
pub struct ValidateAndStartDeployment {
    orchestrator: Arc<dyn Orchestrator>,
    instance_arns: Vec<String>,
}

impl ValidateAndStartDeployment {
    /// Create the mutation for the given instances.
    pub fn new(orchestrator: Arc<dyn Orchestrator>, instance_arns: &[String]) -> Self {
        Self {
            orchestrator,
            instance_arns: instance_arns.to_vec(),
        }
    }
}

#[async_trait]
impl EnvironmentMutation for ValidateAndStartDeployment {
    type Output = Deployment;

    async fn apply(&self, existing: Option<Environment>) -> Result<(Environment, Deployment)> {
        let mut env = existing.ok_or_else(|| Error::NotFound("Environment does not exist".to_string()))?;

        if let Some(in_progress) = env.in_progress_deployment_id() {
            return Err(Error::BadRequest(format!(
                "There is already a deployment in progress '{}'",
                in_progress
            )));
        }
        let pending = env
            .pending_deployment()?
            .cloned()
            .ok_or_else(|| Error::BadRequest("There is no pending deployment".to_string()))?;

        let deployment = start_tasks_and_update_deployment_info(
            self.orchestrator.as_ref(),
            &mut env,
            pending,
            &self.instance_arns,
        )
        .await?;
        Ok((env, deployment))
    }
}

/// Replaces the in-progress deployment with an updated copy.
pub struct ValidateAndUpdateInProgressDeployment {
    deployment: Deployment,
}

impl ValidateAndUpdateInProgressDeployment {
    /// Create the mutation for an updated deployment.
    pub fn new(deployment: Deployment) -> Self {
        Self { deployment }
    }
}

#[async_trait]
impl EnvironmentMutation for ValidateAndUpdateInProgressDeployment {
    type Output = ();

    async fn apply(&self, existing: Option<Environment>) -> Result<(Environment, ())> {
        let mut env = existing.ok_or_else(|| Error::NotFound("Environment does not exist".to_string()))?;

        if env.in_progress_deployment_id() != Some(self.deployment.id()) {
            return Err(Error::UnexpectedDeploymentStatus(format!(
                "The in-progress deployment of environment with name '{}' is '{}' and not '{}'",
                env.name(),
                env.in_progress_deployment_id().unwrap_or_default(),
                self.deployment.id()
            )));
        }

        env.replace_deployment(self.deployment.clone())?;
        Ok((env, ()))
    }
}

/// Start tasks for `deployment`, fold the placement failures into it and
/// write it back into `env`. Completed deployments are returned untouched.
async fn start_tasks_and_update_deployment_info(
    orchestrator: &dyn Orchestrator,
    env: &mut Environment,
    mut deployment: Deployment,
    instance_arns: &[String],
) -> Result<Deployment> {
    let resp = orchestrator
        .start_task(
            env.cluster(),
            instance_arns,
            deployment.id(),
            deployment.task_definition(),
        )
        .await?;

    let mut failures = resp.failures;
    failures.extend(deployment.failed_instances().iter().cloned());

    match deployment.status() {
        DeploymentStatus::Completed => return Ok(deployment),
        DeploymentStatus::Pending => {
            deployment.update_to_in_progress(instance_arns.len(), failures)?;
            env.update_pending_deployment_to_in_progress()?;
        }
        DeploymentStatus::InProgress => {
            deployment.update_to_in_progress(instance_arns.len(), failures)?;
        }
    }

    env.replace_deployment(deployment.clone())?;
    Ok(deployment)
}

fn verify_token(env: &Environment, token: &str) -> Result<()> {
    if !token.is_empty() && env.token() != token {
        return Err(Error::BadRequest(format!(
            "Token '{}' is outdated and does not match the environment token '{}'",
            token,
            env.token()
        )));
    }

    if env.deployments().values().any(|d| d.token() == token) {
        return Err(Error::BadRequest(format!(
            "Deployment with token '{}' already exists",
            token
        )));
    }

    Ok(())
}

fn require_name(environment: &str, action: &str) -> Result<()> {
    if environment.is_empty() {
        return Err(Error::BadRequest(format!(
            "Environment name is missing when {}",
            action
        )));
    }
    Ok(())
}

fn not_found(environment: &str) -> Error {
    Error::NotFound(format!("Environment '{}' does not exist", environment))
}
