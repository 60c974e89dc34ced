// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment entity and its state machine.
//!
//! ```text
//!   ┌─────────┐  update_to_in_progress  ┌─────────────┐  update_to_completed  ┌───────────┐
//!   │ PENDING │ ──────────────────────► │ IN_PROGRESS │ ────────────────────► │ COMPLETED │
//!   └─────────┘                         └──────┬──────┘                       └───────────┘
//!                                              │ ▲
//!                                              └─┘ update_to_in_progress
//!                                                  (refresh failures/health)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle status of a deployment. Ordered: a status never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, no tasks started yet.
    Pending,
    /// Tasks have been started and are being tracked.
    InProgress,
    /// Terminal.
    Completed,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Health of a deployment, derived from its placement failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentHealth {
    /// No instance reported a placement failure.
    Healthy,
    /// At least one instance reported a placement failure.
    Unhealthy,
}

/// A placement or lookup failure reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Failure {
    /// ARN of the instance or task the failure refers to.
    pub arn: Option<String>,
    /// Reason reported by the orchestrator (e.g. `RESOURCE:MEMORY`).
    pub reason: String,
}

impl Failure {
    /// Create a failure for the given ARN.
    pub fn new(arn: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            arn: Some(arn.into()),
            reason: reason.into(),
        }
    }
}

/// One rollout of a task definition to the instances of an environment's cluster.
///
/// Fields are only mutated through the transition methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    id: String,
    status: DeploymentStatus,
    health: DeploymentHealth,
    task_definition: String,
    desired_task_count: usize,
    token: String,
    #[serde(default)]
    failed_instances: Vec<Failure>,
    start_time: DateTime<Utc>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Create a new pending, healthy deployment.
    pub fn new(task_definition: &str, token: &str) -> Result<Self> {
        if task_definition.is_empty() {
            return Err(Error::BadRequest(
                "Task definition cannot be empty".to_string(),
            ));
        }
        if token.is_empty() {
            return Err(Error::BadRequest("Token cannot be empty".to_string()));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            status: DeploymentStatus::Pending,
            health: DeploymentHealth::Healthy,
            task_definition: task_definition.to_string(),
            desired_task_count: 0,
            token: token.to_string(),
            failed_instances: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
        })
    }

    /// Unique identifier, also used as the `startedBy` tag of its tasks.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle status.
    pub fn status(&self) -> DeploymentStatus {
        self.status
    }

    /// Current health.
    pub fn health(&self) -> DeploymentHealth {
        self.health
    }

    /// Task definition rolled out by this deployment.
    pub fn task_definition(&self) -> &str {
        &self.task_definition
    }

    /// Number of instances targeted by the latest placement attempt.
    pub fn desired_task_count(&self) -> usize {
        self.desired_task_count
    }

    /// Environment token at creation time.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Instances that failed placement, as of the latest progress update.
    pub fn failed_instances(&self) -> &[Failure] {
        &self.failed_instances
    }

    /// When the deployment was created.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// When the deployment completed.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Move to (or refresh) the in-progress state.
    ///
    /// Can be called repeatedly while in progress to refresh the failure and
    /// health snapshot.
    pub fn update_to_in_progress(
        &mut self,
        desired_task_count: usize,
        failures: Vec<Failure>,
    ) -> Result<()> {
        if self.status == DeploymentStatus::Completed {
            return Err(Error::InvalidTransition(format!(
                "Deployment '{}' cannot move from completed to in-progress",
                self.id
            )));
        }

        self.health = health_from(&failures);
        self.status = DeploymentStatus::InProgress;
        self.desired_task_count = desired_task_count;
        self.failed_instances = failures;
        Ok(())
    }

    /// Finalize the deployment. The deployment is healthy once completed.
    pub fn update_to_completed(&mut self, failures: Vec<Failure>) -> Result<()> {
        match self.status {
            DeploymentStatus::Pending => Err(Error::InvalidTransition(format!(
                "Deployment '{}' cannot move from pending to completed",
                self.id
            ))),
            DeploymentStatus::Completed => Ok(()),
            DeploymentStatus::InProgress => {
                self.status = DeploymentStatus::Completed;
                self.health = DeploymentHealth::Healthy;
                self.failed_instances = failures;
                self.end_time = Some(Utc::now());
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }
}

fn health_from(failures: &[Failure]) -> DeploymentHealth {
    if failures.is_empty() {
        DeploymentHealth::Healthy
    } else {
        DeploymentHealth::Unhealthy
    }
}
