// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batching orchestrator over a raw orchestrator client.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    Cluster, DESCRIBE_TASKS_BATCH_SIZE, FacadeError, FacadeResult, Orchestrator, OrchestratorApi,
    START_TASK_BATCH_SIZE, TaskDefinition, TaskFilter, TasksOutput,
};

/// [`Orchestrator`] that splits StartTask and DescribeTasks into
/// provider-sized batches and merges the results.
pub struct EcsOrchestrator<A> {
    api: A,
}

impl<A: OrchestratorApi> EcsOrchestrator<A> {
    /// Wrap a raw client.
    pub fn new(api: A) -> Self {
        Self { api }
    }

    /// The wrapped raw client.
    pub fn api(&self) -> &A {
        &self.api
    }
}

#[async_trait]
impl<A: OrchestratorApi> Orchestrator for EcsOrchestrator<A> {
    async fn start_task(
        &self,
        cluster: &str,
        instance_arns: &[String],
        started_by: &str,
        task_definition: &str,
    ) -> FacadeResult<TasksOutput> {
        let mut output = TasksOutput::default();

        for batch in instance_arns.chunks(START_TASK_BATCH_SIZE) {
            let resp = self
                .api
                .start_task(cluster, batch, started_by, task_definition)
                .await
                .inspect_err(|e| {
                    warn!(
                        cluster = %cluster,
                        task_definition = %task_definition,
                        error = %e,
                        "Could not start task definition on cluster"
                    );
                })?;
            output.extend(resp);
        }

        debug!(
            cluster = %cluster,
            started_by = %started_by,
            placed = output.tasks.len(),
            failures = output.failures.len(),
            "Started tasks"
        );
        Ok(output)
    }

    async fn stop_task(&self, cluster: &str, task_arn: &str) -> FacadeResult<()> {
        self.api.stop_task(cluster, task_arn).await
    }

    async fn list_tasks(&self, cluster: &str, started_by: &str) -> FacadeResult<Vec<String>> {
        self.api
            .list_tasks(cluster, TaskFilter::StartedBy(started_by.to_string()))
            .await
    }

    async fn list_tasks_by_instance(
        &self,
        cluster: &str,
        instance_arn: &str,
    ) -> FacadeResult<Vec<String>> {
        self.api
            .list_tasks(
                cluster,
                TaskFilter::ContainerInstance(instance_arn.to_string()),
            )
            .await
    }

    async fn describe_tasks(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> FacadeResult<TasksOutput> {
        let mut output = TasksOutput::default();

        for batch in task_arns.chunks(DESCRIBE_TASKS_BATCH_SIZE) {
            output.extend(self.api.describe_tasks(cluster, batch).await?);
        }

        Ok(output)
    }

    async fn describe_cluster(&self, cluster: &str) -> FacadeResult<Cluster> {
        self.api
            .describe_clusters(&[cluster.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FacadeError::ClusterNotFound(cluster.to_string()))
    }

    async fn describe_task_definition(
        &self,
        task_definition: &str,
    ) -> FacadeResult<TaskDefinition> {
        self.api.describe_task_definition(task_definition).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::facade::{ApiCall, InMemoryCluster};

    #[tokio::test]
    async fn test_start_task_splits_into_batches() {
        let sim = Arc::new(InMemoryCluster::new());
        let cluster = sim.add_cluster("prod").await;
        let mut instances = Vec::new();
        for _ in 0..25 {
            instances.push(sim.add_instance(&cluster).await.unwrap());
        }

        let orchestrator = EcsOrchestrator::new(sim.clone());
        let output = orchestrator
            .start_task(&cluster, &instances, "dep-1", "web:1")
            .await
            .unwrap();

        assert_eq!(output.tasks.len(), 25);
        assert!(output.failures.is_empty());
        assert_eq!(sim.call_count(ApiCall::StartTask), 3);
    }

    #[tokio::test]
    async fn test_start_task_merges_failures_across_batches() {
        let sim = Arc::new(InMemoryCluster::new());
        let cluster = sim.add_cluster("prod").await;
        let mut instances = Vec::new();
        for _ in 0..12 {
            instances.push(sim.add_instance(&cluster).await.unwrap());
        }
        sim.set_placement_failure(&instances[1], "RESOURCE:MEMORY").await;
        sim.set_placement_failure(&instances[11], "RESOURCE:CPU").await;

        let orchestrator = EcsOrchestrator::new(sim.clone());
        let output = orchestrator
            .start_task(&cluster, &instances, "dep-1", "web:1")
            .await
            .unwrap();

        assert_eq!(output.tasks.len(), 10);
        assert_eq!(output.failures.len(), 2);
        assert_eq!(output.failures[1].reason, "RESOURCE:CPU");
    }

    #[tokio::test]
    async fn test_describe_tasks_splits_into_batches() {
        let sim = Arc::new(InMemoryCluster::new());
        let cluster = sim.add_cluster("prod").await;
        let mut instances = Vec::new();
        for _ in 0..150 {
            instances.push(sim.add_instance(&cluster).await.unwrap());
        }

        let orchestrator = EcsOrchestrator::new(sim.clone());
        let started = orchestrator
            .start_task(&cluster, &instances, "dep-1", "web:1")
            .await
            .unwrap();
        let arns: Vec<String> = started.tasks.iter().map(|t| t.arn.clone()).collect();

        let described = orchestrator.describe_tasks(&cluster, &arns).await.unwrap();
        assert_eq!(described.tasks.len(), 150);
        assert_eq!(sim.call_count(ApiCall::DescribeTasks), 2);
    }

    #[tokio::test]
    async fn test_describe_tasks_with_no_tasks_makes_no_call() {
        let sim = Arc::new(InMemoryCluster::new());
        let cluster = sim.add_cluster("prod").await;

        let orchestrator = EcsOrchestrator::new(sim.clone());
        let described = orchestrator.describe_tasks(&cluster, &[]).await.unwrap();
        assert!(described.tasks.is_empty());
        assert_eq!(sim.call_count(ApiCall::DescribeTasks), 0);
    }

    #[tokio::test]
    async fn test_describe_cluster_not_found() {
        let sim = Arc::new(InMemoryCluster::new());
        let orchestrator = EcsOrchestrator::new(sim);

        let err = orchestrator.describe_cluster("missing").await.unwrap_err();
        assert!(matches!(err, FacadeError::ClusterNotFound(_)));
    }

    #[tokio::test]
    async fn test_start_task_propagates_request_failures() {
        let sim = Arc::new(InMemoryCluster::new());
        let cluster = sim.add_cluster("prod").await;
        let instance = sim.add_instance(&cluster).await.unwrap();
        sim.fail_calls(ApiCall::StartTask, "throttled").await;

        let orchestrator = EcsOrchestrator::new(sim.clone());
        let err = orchestrator
            .start_task(&cluster, &[instance], "dep-1", "web:1")
            .await
            .unwrap_err();
        assert!(matches!(err, FacadeError::Request { operation: "StartTask", .. }));
    }
}
