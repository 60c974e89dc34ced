// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Infrastructure facades.
//!
//! The scheduler talks to the outside world through two narrow traits:
//!
//! - [`ClusterState`]: an eventually consistent, possibly stale view of the
//!   instances and tasks of a cluster. Cheap to query on every tick.
//! - [`Orchestrator`]: the authoritative, rate limited infrastructure API
//!   used for side effects and for authoritative checks.
//!
//! [`EcsOrchestrator`] implements [`Orchestrator`] over a raw
//! [`OrchestratorApi`] client, splitting large requests into the per-call
//! limits of the provider. [`InMemoryCluster`] simulates both sides for
//! tests and local runs.

mod ecs;
mod memory;

pub use ecs::EcsOrchestrator;
pub use memory::{ApiCall, InMemoryCluster};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::types::Failure;

/// Maximum number of instances per StartTask call.
pub const START_TASK_BATCH_SIZE: usize = 10;

/// Maximum number of tasks per DescribeTasks call.
pub const DESCRIBE_TASKS_BATCH_SIZE: usize = 100;

/// Instance status of a registered, usable instance.
pub const INSTANCE_ACTIVE: &str = "ACTIVE";
/// Instance status of a deregistered or draining instance.
pub const INSTANCE_INACTIVE: &str = "INACTIVE";

/// Task status while the task is being placed and launched.
pub const TASK_PENDING: &str = "PENDING";
/// Task status while the task is running.
pub const TASK_RUNNING: &str = "RUNNING";
/// Task status once the task has stopped.
pub const TASK_STOPPED: &str = "STOPPED";

/// Errors from facade calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FacadeError {
    /// A call to the underlying service failed.
    #[error("{operation} failed: {message}")]
    Request {
        /// Operation that failed.
        operation: &'static str,
        /// Failure detail.
        message: String,
    },

    /// A raw request exceeded the provider's per-call limit.
    #[error("{operation} accepts at most {limit} items per call, got {actual}")]
    BatchLimitExceeded {
        /// Operation that was called.
        operation: &'static str,
        /// Per-call limit.
        limit: usize,
        /// Number of items passed.
        actual: usize,
    },

    /// Cluster does not exist.
    #[error("Cluster '{0}' not found")]
    ClusterNotFound(String),

    /// Task definition does not exist.
    #[error("Task definition '{0}' not found")]
    TaskDefinitionNotFound(String),
}

/// Result type for facade calls.
pub type FacadeResult<T> = std::result::Result<T, FacadeError>;

/// A worker instance registered in a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Instance ARN.
    pub arn: String,
    /// ARN of the owning cluster.
    pub cluster_arn: String,
    /// `ACTIVE` or `INACTIVE`.
    pub status: String,
}

/// A task placed on an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task ARN.
    pub arn: String,
    /// ARN of the owning cluster.
    pub cluster_arn: String,
    /// ARN of the instance running the task.
    pub instance_arn: String,
    /// Tag set at start time. Deployments use their ID.
    pub started_by: Option<String>,
    /// Status the orchestrator is driving the task towards.
    pub desired_status: String,
    /// Last observed status.
    pub last_status: String,
    /// Task definition ARN.
    pub task_definition: String,
}

/// Tasks plus per-item failures, as returned by StartTask and DescribeTasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TasksOutput {
    /// Tasks placed or described.
    pub tasks: Vec<Task>,
    /// Items that could not be placed or described.
    pub failures: Vec<Failure>,
}

impl TasksOutput {
    fn extend(&mut self, other: TasksOutput) {
        self.tasks.extend(other.tasks);
        self.failures.extend(other.failures);
    }
}

/// Cluster description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Cluster ARN.
    pub arn: String,
    /// Cluster name.
    pub name: String,
    /// Cluster status.
    pub status: String,
}

/// Task definition description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    /// Task definition ARN.
    pub arn: String,
    /// Family name.
    pub family: String,
    /// Revision within the family.
    pub revision: u32,
}

/// Filter for the raw ListTasks call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFilter {
    /// Tasks whose `startedBy` tag matches.
    StartedBy(String),
    /// Tasks placed on the given instance.
    ContainerInstance(String),
}

/// Eventually consistent view of cluster instances and tasks.
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// All instances registered in the cluster.
    async fn list_instances(&self, cluster: &str) -> FacadeResult<Vec<Instance>>;

    /// All tasks known in the cluster, in any status.
    async fn list_tasks(&self, cluster: &str) -> FacadeResult<Vec<Task>>;
}

/// Authoritative orchestrator API used by the core.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Start one task per instance, tagged with `started_by`.
    async fn start_task(
        &self,
        cluster: &str,
        instance_arns: &[String],
        started_by: &str,
        task_definition: &str,
    ) -> FacadeResult<TasksOutput>;

    /// Stop one task.
    async fn stop_task(&self, cluster: &str, task_arn: &str) -> FacadeResult<()>;

    /// ARNs of tasks started with the given `started_by` tag.
    async fn list_tasks(&self, cluster: &str, started_by: &str) -> FacadeResult<Vec<String>>;

    /// ARNs of tasks placed on the given instance.
    async fn list_tasks_by_instance(
        &self,
        cluster: &str,
        instance_arn: &str,
    ) -> FacadeResult<Vec<String>>;

    /// Describe tasks by ARN.
    async fn describe_tasks(&self, cluster: &str, task_arns: &[String])
    -> FacadeResult<TasksOutput>;

    /// Describe a cluster by name or ARN.
    async fn describe_cluster(&self, cluster: &str) -> FacadeResult<Cluster>;

    /// Describe a task definition by family, `family:revision` or ARN.
    async fn describe_task_definition(&self, task_definition: &str)
    -> FacadeResult<TaskDefinition>;
}

/// Raw single-call orchestrator client.
///
/// Each call maps to one provider request and must respect the provider's
/// per-call limits ([`START_TASK_BATCH_SIZE`], [`DESCRIBE_TASKS_BATCH_SIZE`]).
#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    /// StartTask on at most [`START_TASK_BATCH_SIZE`] instances.
    async fn start_task(
        &self,
        cluster: &str,
        instance_arns: &[String],
        started_by: &str,
        task_definition: &str,
    ) -> FacadeResult<TasksOutput>;

    /// StopTask.
    async fn stop_task(&self, cluster: &str, task_arn: &str) -> FacadeResult<()>;

    /// ListTasks with a single filter.
    async fn list_tasks(&self, cluster: &str, filter: TaskFilter) -> FacadeResult<Vec<String>>;

    /// DescribeTasks on at most [`DESCRIBE_TASKS_BATCH_SIZE`] tasks.
    async fn describe_tasks(&self, cluster: &str, task_arns: &[String])
    -> FacadeResult<TasksOutput>;

    /// DescribeClusters. Unknown clusters are omitted from the result.
    async fn describe_clusters(&self, clusters: &[String]) -> FacadeResult<Vec<Cluster>>;

    /// DescribeTaskDefinition.
    async fn describe_task_definition(&self, task_definition: &str)
    -> FacadeResult<TaskDefinition>;
}

#[async_trait]
impl<A: OrchestratorApi + ?Sized> OrchestratorApi for Arc<A> {
    async fn start_task(
        &self,
        cluster: &str,
        instance_arns: &[String],
        started_by: &str,
        task_definition: &str,
    ) -> FacadeResult<TasksOutput> {
        (**self)
            .start_task(cluster, instance_arns, started_by, task_definition)
            .await
    }

    async fn stop_task(&self, cluster: &str, task_arn: &str) -> FacadeResult<()> {
        (**self).stop_task(cluster, task_arn).await
    }

    async fn list_tasks(&self, cluster: &str, filter: TaskFilter) -> FacadeResult<Vec<String>> {
        (**self).list_tasks(cluster, filter).await
    }

    async fn describe_tasks(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> FacadeResult<TasksOutput> {
        (**self).describe_tasks(cluster, task_arns).await
    }

    async fn describe_clusters(&self, clusters: &[String]) -> FacadeResult<Vec<Cluster>> {
        (**self).describe_clusters(clusters).await
    }

    async fn describe_task_definition(
        &self,
        task_definition: &str,
    ) -> FacadeResult<TaskDefinition> {
        (**self).describe_task_definition(task_definition).await
    }
}
