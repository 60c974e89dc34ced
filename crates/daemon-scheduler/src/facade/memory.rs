// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory simulated cluster.
//!
//! Implements both the raw [`OrchestratorApi`] and the [`ClusterState`] view
//! over the same process-local state. The cluster-state view can be made to
//! lag behind the orchestrator (see [`InMemoryCluster::set_auto_publish`]) to
//! reproduce read-after-write delays of the real cluster-state service.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    Cluster, ClusterState, DESCRIBE_TASKS_BATCH_SIZE, FacadeError, FacadeResult, INSTANCE_ACTIVE,
    Instance, OrchestratorApi, START_TASK_BATCH_SIZE, TASK_PENDING, TASK_RUNNING, TASK_STOPPED,
    Task, TaskDefinition, TaskFilter, TasksOutput,
};
use crate::types::Failure;

const ARN_PREFIX: &str = "arn:aws:ecs:us-east-1:123456789012";

/// Calls recorded by [`InMemoryCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiCall {
    /// Orchestrator StartTask.
    StartTask,
    /// Orchestrator StopTask.
    StopTask,
    /// Orchestrator ListTasks filtered by `startedBy`.
    ListTasksByStartedBy,
    /// Orchestrator ListTasks filtered by instance.
    ListTasksByInstance,
    /// Orchestrator DescribeTasks.
    DescribeTasks,
    /// Orchestrator DescribeClusters.
    DescribeClusters,
    /// Orchestrator DescribeTaskDefinition.
    DescribeTaskDefinition,
    /// Cluster state ListInstances.
    ListInstances,
    /// Cluster state ListTasks.
    ListClusterTasks,
}

impl ApiCall {
    const COUNT: usize = 9;

    fn operation(self) -> &'static str {
        match self {
            Self::StartTask => "StartTask",
            Self::StopTask => "StopTask",
            Self::ListTasksByStartedBy | Self::ListTasksByInstance => "ListTasks",
            Self::DescribeTasks => "DescribeTasks",
            Self::DescribeClusters => "DescribeClusters",
            Self::DescribeTaskDefinition => "DescribeTaskDefinition",
            Self::ListInstances => "ListInstances",
            Self::ListClusterTasks => "ListClusterTasks",
        }
    }
}

struct SimCluster {
    arn: String,
    name: String,
    instances: BTreeMap<String, Instance>,
    tasks: BTreeMap<String, Task>,
    published_tasks: Vec<Task>,
}

impl SimCluster {
    fn matches(&self, cluster: &str) -> bool {
        self.arn == cluster || self.name == cluster
    }

    fn publish(&mut self) {
        self.published_tasks = self.tasks.values().cloned().collect();
    }
}

struct SimState {
    clusters: Vec<SimCluster>,
    task_definitions: BTreeMap<String, u32>,
    placement_failures: HashMap<String, String>,
    failing: HashMap<ApiCall, String>,
    auto_publish: bool,
    launch_status: String,
}

impl SimState {
    fn cluster(&self, cluster: &str) -> FacadeResult<&SimCluster> {
        self.clusters
            .iter()
            .find(|c| c.matches(cluster))
            .ok_or_else(|| FacadeError::ClusterNotFound(cluster.to_string()))
    }

    fn cluster_mut(&mut self, cluster: &str) -> FacadeResult<&mut SimCluster> {
        self.clusters
            .iter_mut()
            .find(|c| c.matches(cluster))
            .ok_or_else(|| FacadeError::ClusterNotFound(cluster.to_string()))
    }

    fn after_write(&mut self, cluster: &str) {
        if !self.auto_publish {
            return;
        }
        if let Ok(c) = self.cluster_mut(cluster) {
            c.publish();
        }
    }
}

/// Simulated cluster backing both infrastructure facades.
pub struct InMemoryCluster {
    state: Mutex<SimState>,
    calls: [AtomicUsize; ApiCall::COUNT],
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// Create an empty simulation. The cluster-state view follows the
    /// orchestrator immediately and new tasks launch as `PENDING`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                clusters: Vec::new(),
                task_definitions: BTreeMap::new(),
                placement_failures: HashMap::new(),
                failing: HashMap::new(),
                auto_publish: true,
                launch_status: TASK_PENDING.to_string(),
            }),
            calls: Default::default(),
        }
    }

    /// Create a cluster (or return the existing one) and return its ARN.
    pub async fn add_cluster(&self, name: &str) -> String {
        let mut state = self.state.lock().await;
        if let Ok(existing) = state.cluster(name) {
            return existing.arn.clone();
        }

        let arn = format!("{}:cluster/{}", ARN_PREFIX, name);
        state.clusters.push(SimCluster {
            arn: arn.clone(),
            name: name.to_string(),
            instances: BTreeMap::new(),
            tasks: BTreeMap::new(),
            published_tasks: Vec::new(),
        });
        arn
    }

    /// Register an active instance in the cluster and return its ARN.
    pub async fn add_instance(&self, cluster: &str) -> FacadeResult<String> {
        let mut state = self.state.lock().await;
        let c = state.cluster_mut(cluster)?;
        let arn = format!(
            "{}:container-instance/{}/{}",
            ARN_PREFIX,
            c.name,
            Uuid::new_v4().simple()
        );
        c.instances.insert(
            arn.clone(),
            Instance {
                arn: arn.clone(),
                cluster_arn: c.arn.clone(),
                status: INSTANCE_ACTIVE.to_string(),
            },
        );
        Ok(arn)
    }

    /// Change an instance's status (e.g. to `INACTIVE`).
    pub async fn set_instance_status(&self, instance_arn: &str, status: &str) {
        let mut state = self.state.lock().await;
        for c in state.clusters.iter_mut() {
            if let Some(instance) = c.instances.get_mut(instance_arn) {
                instance.status = status.to_string();
            }
        }
    }

    /// Deregister an instance entirely.
    pub async fn remove_instance(&self, instance_arn: &str) {
        let mut state = self.state.lock().await;
        for c in state.clusters.iter_mut() {
            c.instances.remove(instance_arn);
        }
    }

    /// Register a new revision of a task definition family and return its ARN.
    pub async fn register_task_definition(&self, family: &str) -> String {
        let mut state = self.state.lock().await;
        let revision = state
            .task_definitions
            .entry(family.to_string())
            .and_modify(|r| *r += 1)
            .or_insert(1);
        task_definition_arn(family, *revision)
    }

    /// Make placements on the instance fail with the given reason.
    pub async fn set_placement_failure(&self, instance_arn: &str, reason: &str) {
        self.state
            .lock()
            .await
            .placement_failures
            .insert(instance_arn.to_string(), reason.to_string());
    }

    /// Let placements on the instance succeed again.
    pub async fn clear_placement_failure(&self, instance_arn: &str) {
        self.state
            .lock()
            .await
            .placement_failures
            .remove(instance_arn);
    }

    /// Make every subsequent call of the given kind fail.
    pub async fn fail_calls(&self, call: ApiCall, message: &str) {
        self.state
            .lock()
            .await
            .failing
            .insert(call, message.to_string());
    }

    /// Let all calls succeed again.
    pub async fn clear_call_failures(&self) {
        self.state.lock().await.failing.clear();
    }

    /// When disabled, the cluster-state task view only changes on
    /// [`publish_cluster_state`](Self::publish_cluster_state).
    pub async fn set_auto_publish(&self, auto_publish: bool) {
        self.state.lock().await.auto_publish = auto_publish;
    }

    /// Copy the orchestrator's current tasks into the cluster-state view.
    pub async fn publish_cluster_state(&self) {
        let mut state = self.state.lock().await;
        for c in state.clusters.iter_mut() {
            c.publish();
        }
    }

    /// Status new tasks report right after StartTask.
    pub async fn set_launch_status(&self, status: &str) {
        self.state.lock().await.launch_status = status.to_string();
    }

    /// Set a task's last status.
    pub async fn set_task_status(&self, task_arn: &str, last_status: &str) {
        let mut state = self.state.lock().await;
        let mut touched = Vec::new();
        for c in state.clusters.iter_mut() {
            if let Some(task) = c.tasks.get_mut(task_arn) {
                task.last_status = last_status.to_string();
                touched.push(c.arn.clone());
            }
        }
        for cluster in touched {
            state.after_write(&cluster);
        }
    }

    /// Move every launching task of the cluster to `RUNNING`. Returns how many moved.
    pub async fn mark_tasks_running(&self, cluster: &str) -> FacadeResult<usize> {
        let mut state = self.state.lock().await;
        let c = state.cluster_mut(cluster)?;
        let mut moved = 0;
        for task in c.tasks.values_mut() {
            if task.desired_status == TASK_RUNNING && task.last_status == TASK_PENDING {
                task.last_status = TASK_RUNNING.to_string();
                moved += 1;
            }
        }
        let arn = c.arn.clone();
        state.after_write(&arn);
        Ok(moved)
    }

    /// Place a running task directly, bypassing StartTask. Returns its ARN.
    pub async fn insert_task(
        &self,
        cluster: &str,
        instance_arn: &str,
        started_by: &str,
        task_definition: &str,
    ) -> FacadeResult<String> {
        let mut state = self.state.lock().await;
        let c = state.cluster_mut(cluster)?;
        let task = new_task(&c.arn, instance_arn, started_by, task_definition, TASK_RUNNING);
        let arn = task.arn.clone();
        c.tasks.insert(arn.clone(), task);
        let cluster_arn = c.arn.clone();
        state.after_write(&cluster_arn);
        Ok(arn)
    }

    /// Current orchestrator-side tasks of the cluster.
    pub async fn tasks(&self, cluster: &str) -> FacadeResult<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state.cluster(cluster)?.tasks.values().cloned().collect())
    }

    /// Number of calls of the given kind so far.
    pub fn call_count(&self, call: ApiCall) -> usize {
        self.calls[call as usize].load(Ordering::SeqCst)
    }

    /// Reset all call counters.
    pub fn reset_call_counts(&self) {
        for counter in &self.calls {
            counter.store(0, Ordering::SeqCst);
        }
    }

    fn record(&self, state: &SimState, call: ApiCall) -> FacadeResult<()> {
        self.calls[call as usize].fetch_add(1, Ordering::SeqCst);
        match state.failing.get(&call) {
            Some(message) => Err(FacadeError::Request {
                operation: call.operation(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn task_definition_arn(family: &str, revision: u32) -> String {
    format!("{}:task-definition/{}:{}", ARN_PREFIX, family, revision)
}

fn new_task(
    cluster_arn: &str,
    instance_arn: &str,
    started_by: &str,
    task_definition: &str,
    last_status: &str,
) -> Task {
    Task {
        arn: format!("{}:task/{}", ARN_PREFIX, Uuid::new_v4()),
        cluster_arn: cluster_arn.to_string(),
        instance_arn: instance_arn.to_string(),
        started_by: Some(started_by.to_string()),
        desired_status: TASK_RUNNING.to_string(),
        last_status: last_status.to_string(),
        task_definition: task_definition.to_string(),
    }
}

#[async_trait]
impl OrchestratorApi for InMemoryCluster {
    async fn start_task(
        &self,
        cluster: &str,
        instance_arns: &[String],
        started_by: &str,
        task_definition: &str,
    ) -> FacadeResult<TasksOutput> {
        let mut state = self.state.lock().await;
        self.record(&state, ApiCall::StartTask)?;
        if instance_arns.len() > START_TASK_BATCH_SIZE {
            return Err(FacadeError::BatchLimitExceeded {
                operation: "StartTask",
                limit: START_TASK_BATCH_SIZE,
                actual: instance_arns.len(),
            });
        }

        let launch_status = state.launch_status.clone();
        let placement_failures = state.placement_failures.clone();
        let c = state.cluster_mut(cluster)?;
        let mut output = TasksOutput::default();

        for instance_arn in instance_arns {
            let active = c
                .instances
                .get(instance_arn)
                .is_some_and(|i| i.status == INSTANCE_ACTIVE);
            if !active {
                output.failures.push(Failure::new(instance_arn, "MISSING"));
                continue;
            }
            if let Some(reason) = placement_failures.get(instance_arn) {
                output.failures.push(Failure::new(instance_arn, reason));
                continue;
            }

            let task = new_task(
                &c.arn,
                instance_arn,
                started_by,
                task_definition,
                &launch_status,
            );
            c.tasks.insert(task.arn.clone(), task.clone());
            output.tasks.push(task);
        }

        let cluster_arn = c.arn.clone();
        state.after_write(&cluster_arn);
        Ok(output)
    }

    async fn stop_task(&self, cluster: &str, task_arn: &str) -> FacadeResult<()> {
        let mut state = self.state.lock().await;
        self.record(&state, ApiCall::StopTask)?;
        let c = state.cluster_mut(cluster)?;
        let task = c
            .tasks
            .get_mut(task_arn)
            .ok_or_else(|| FacadeError::Request {
                operation: "StopTask",
                message: format!("The referenced task '{}' was not found", task_arn),
            })?;
        task.desired_status = TASK_STOPPED.to_string();
        task.last_status = TASK_STOPPED.to_string();

        let cluster_arn = c.arn.clone();
        state.after_write(&cluster_arn);
        Ok(())
    }

    async fn list_tasks(&self, cluster: &str, filter: TaskFilter) -> FacadeResult<Vec<String>> {
        let state = self.state.lock().await;
        let call = match filter {
            TaskFilter::StartedBy(_) => ApiCall::ListTasksByStartedBy,
            TaskFilter::ContainerInstance(_) => ApiCall::ListTasksByInstance,
        };
        self.record(&state, call)?;

        // Like the real API, only tasks still meant to run are listed.
        Ok(state
            .cluster(cluster)?
            .tasks
            .values()
            .filter(|t| t.desired_status == TASK_RUNNING)
            .filter(|t| match &filter {
                TaskFilter::StartedBy(s) => t.started_by.as_deref() == Some(s.as_str()),
                TaskFilter::ContainerInstance(i) => &t.instance_arn == i,
            })
            .map(|t| t.arn.clone())
            .collect())
    }

    async fn describe_tasks(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> FacadeResult<TasksOutput> {
        let state = self.state.lock().await;
        self.record(&state, ApiCall::DescribeTasks)?;
        if task_arns.len() > DESCRIBE_TASKS_BATCH_SIZE {
            return Err(FacadeError::BatchLimitExceeded {
                operation: "DescribeTasks",
                limit: DESCRIBE_TASKS_BATCH_SIZE,
                actual: task_arns.len(),
            });
        }

        let c = state.cluster(cluster)?;
        let mut output = TasksOutput::default();
        for arn in task_arns {
            match c.tasks.get(arn) {
                Some(task) => output.tasks.push(task.clone()),
                None => output.failures.push(Failure::new(arn, "MISSING")),
            }
        }
        Ok(output)
    }

    async fn describe_clusters(&self, clusters: &[String]) -> FacadeResult<Vec<Cluster>> {
        let state = self.state.lock().await;
        self.record(&state, ApiCall::DescribeClusters)?;

        Ok(clusters
            .iter()
            .filter_map(|name| state.cluster(name).ok())
            .map(|c| Cluster {
                arn: c.arn.clone(),
                name: c.name.clone(),
                status: INSTANCE_ACTIVE.to_string(),
            })
            .collect())
    }

    async fn describe_task_definition(
        &self,
        task_definition: &str,
    ) -> FacadeResult<TaskDefinition> {
        let state = self.state.lock().await;
        self.record(&state, ApiCall::DescribeTaskDefinition)?;

        let short = task_definition
            .rsplit_once("task-definition/")
            .map(|(_, rest)| rest)
            .unwrap_or(task_definition);
        let (family, revision) = match short.split_once(':') {
            Some((family, revision)) => (family, revision.parse::<u32>().ok()),
            None => (short, None),
        };

        let latest = state
            .task_definitions
            .get(family)
            .copied()
            .ok_or_else(|| FacadeError::TaskDefinitionNotFound(task_definition.to_string()))?;
        let revision = match revision {
            Some(r) if r >= 1 && r <= latest => r,
            Some(_) => {
                return Err(FacadeError::TaskDefinitionNotFound(
                    task_definition.to_string(),
                ));
            }
            None => latest,
        };

        Ok(TaskDefinition {
            arn: task_definition_arn(family, revision),
            family: family.to_string(),
            revision,
        })
    }
}

#[async_trait]
impl ClusterState for InMemoryCluster {
    async fn list_instances(&self, cluster: &str) -> FacadeResult<Vec<Instance>> {
        let state = self.state.lock().await;
        self.record(&state, ApiCall::ListInstances)?;
        Ok(state.cluster(cluster)?.instances.values().cloned().collect())
    }

    async fn list_tasks(&self, cluster: &str) -> FacadeResult<Vec<Task>> {
        let state = self.state.lock().await;
        self.record(&state, ApiCall::ListClusterTasks)?;
        Ok(state.cluster(cluster)?.published_tasks.clone())
    }
}
