// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation loop.
//!
//! On every tick the scheduler walks all environments and compares the
//! instances of each environment's cluster with the tasks running on them:
//!
//! - Instances that never received the environment get one batched
//!   [`Event::StartDeployment`].
//! - Instances running a task of an older deployment get an
//!   [`Event::StopTasks`] for the stale task followed by a single-instance
//!   [`Event::StartDeployment`].
//! - Instances the scheduler dispatched a start to are not started again
//!   until the tracking TTL elapses, whatever the lagging cluster state
//!   still shows for them. After that the orchestrator is asked directly
//!   whether the current deployment landed there.
//!
//! Each environment is reconciled concurrently with the others, under its
//! own guard, and ends with an [`Event::SchedulerEnvironment`]. Failures
//! become [`Event::SchedulerError`] and the loop carries on with the next tick.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::Event;
use super::tracking::TrackingInfo;
use crate::error::{Error, Result};
use crate::facade::{ClusterState, INSTANCE_INACTIVE, Orchestrator, TASK_RUNNING};
use crate::service::EnvironmentService;
use crate::types::{Deployment, Environment};

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between reconciliation passes.
    pub interval: Duration,
    /// How long a dispatched start is trusted before asking the orchestrator.
    pub tracking_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            tracking_ttl: Duration::from_secs(60),
        }
    }
}

/// What the scheduler knows about one environment task on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Observation {
    /// Cluster state reports the task running.
    Confirmed {
        task_arn: String,
        deployment_id: String,
    },
    /// The scheduler dispatched a start to the instance and still tracks it.
    Unconfirmed,
}

#[derive(Debug, Default)]
struct InstanceLookup {
    total_instances: usize,
    new_instances: Vec<String>,
    deployed_instances: BTreeMap<String, Vec<Observation>>,
}

struct SchedulerInner {
    id: String,
    environments: EnvironmentService,
    cluster_state: Arc<dyn ClusterState>,
    orchestrator: Arc<dyn Orchestrator>,
    events: mpsc::Sender<Event>,
    config: SchedulerConfig,
    in_progress: AtomicBool,
    states: Mutex<HashMap<String, Arc<Mutex<TrackingInfo>>>>,
}

/// Keeps every environment's current deployment on every usable instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Clears the overall in-progress flag when a pass ends, even by panic.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Scheduler {
    /// Create a scheduler emitting its requests and reports on `events`.
    pub fn new(
        environments: EnvironmentService,
        cluster_state: Arc<dyn ClusterState>,
        orchestrator: Arc<dyn Orchestrator>,
        events: mpsc::Sender<Event>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                id: Uuid::new_v4().to_string(),
                environments,
                cluster_state,
                orchestrator,
                events,
                config,
                in_progress: AtomicBool::new(false),
                states: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Identifier of this scheduler instance, used in logs.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Run the loop until `cancel` fires.
    ///
    /// The first pass starts immediately. Each pass runs on its own task, so
    /// a pass that outlives the interval makes the next tick report
    /// [`Event::SchedulerError`] instead of piling up.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            scheduler_id = %self.inner.id,
            interval_secs = self.inner.config.interval.as_secs(),
            tracking_ttl_secs = self.inner.config.tracking_ttl.as_secs(),
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(self.inner.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(scheduler_id = %self.inner.id, "Scheduler received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        scheduler.reconcile().await;
                    });
                }
            }
        }

        info!(scheduler_id = %self.inner.id, "Scheduler stopped");
    }

    /// Run one reconciliation pass over all environments and wait for it.
    pub async fn reconcile(&self) {
        if self
            .inner
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(
                scheduler_id = %self.inner.id,
                "Another reconciliation pass is already in progress, skipping"
            );
            self.emit(Event::SchedulerError {
                error: Error::Other(format!(
                    "Scheduler {} is already reconciling, skipping this tick",
                    self.inner.id
                )),
                environment: None,
            })
            .await;
            return;
        }
        let _guard = PassGuard(&self.inner.in_progress);

        if let Err(e) = self.reconcile_all().await {
            error!(scheduler_id = %self.inner.id, error = %e, "Reconciliation pass failed");
            self.emit(Event::SchedulerError {
                error: e,
                environment: None,
            })
            .await;
        }
    }

    /// Instances currently tracked for `environment`, sorted.
    pub async fn tracked_instances(&self, environment: &str) -> Vec<String> {
        let state = self.inner.states.lock().await.get(environment).cloned();
        let Some(state) = state else {
            return Vec::new();
        };
        let tracking = state.lock().await;
        let mut instances: Vec<String> = tracking.instances().map(str::to_string).collect();
        instances.sort();
        instances
    }

    async fn reconcile_all(&self) -> Result<()> {
        let environments = self.inner.environments.list_environments().await?;
        let states = self.environment_states(environments).await;

        let mut set = JoinSet::new();
        for (environment, state) in states {
            let scheduler = self.clone();
            set.spawn(async move {
                scheduler.reconcile_and_report(environment, state).await;
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(scheduler_id = %self.inner.id, error = %e, "Environment reconciliation task panicked");
            }
        }
        Ok(())
    }

    /// Pair each environment with its tracking state, creating missing
    /// states and dropping those of environments that no longer exist.
    async fn environment_states(
        &self,
        environments: Vec<Environment>,
    ) -> Vec<(Environment, Arc<Mutex<TrackingInfo>>)> {
        let mut states = self.inner.states.lock().await;
        {
            let names: HashSet<&str> = environments.iter().map(|e| e.name()).collect();
            states.retain(|name, _| names.contains(name.as_str()));
        }

        environments
            .into_iter()
            .map(|environment| {
                let state = states
                    .entry(environment.name().to_string())
                    .or_default()
                    .clone();
                (environment, state)
            })
            .collect()
    }

    async fn reconcile_and_report(&self, environment: Environment, state: Arc<Mutex<TrackingInfo>>) {
        let Ok(mut tracking) = state.try_lock_owned() else {
            info!(
                scheduler_id = %self.inner.id,
                environment = %environment.name(),
                "Reconciliation for environment is already in progress"
            );
            self.emit(Event::SchedulerEnvironment {
                environment,
                message: "Reconciliation already in progress, skipped".to_string(),
            })
            .await;
            return;
        };

        match self.reconcile_environment(&environment, &mut tracking).await {
            Ok(message) => {
                debug!(
                    scheduler_id = %self.inner.id,
                    environment = %environment.name(),
                    "{}", message
                );
                self.emit(Event::SchedulerEnvironment {
                    environment,
                    message,
                })
                .await;
            }
            Err(e) => {
                error!(
                    scheduler_id = %self.inner.id,
                    environment = %environment.name(),
                    error = %e,
                    "Error reconciling environment"
                );
                self.emit(Event::SchedulerError {
                    error: e,
                    environment: Some(environment),
                })
                .await;
            }
        }
    }

    async fn reconcile_environment(
        &self,
        environment: &Environment,
        tracking: &mut TrackingInfo,
    ) -> Result<String> {
        let name = environment.name();
        debug!(
            scheduler_id = %self.inner.id,
            environment = %name,
            tracked = tracking.len(),
            "Reconciling environment"
        );

        let Some(latest) = self.inner.environments.get_environment(name).await? else {
            return Ok("Environment no longer exists".to_string());
        };
        let Some(current) = latest.current_deployment()?.cloned() else {
            return Ok("No deployment available for environment".to_string());
        };

        let lookup = self.lookup_instances(&latest, tracking).await?;
        debug!(
            scheduler_id = %self.inner.id,
            environment = %name,
            new = lookup.new_instances.len(),
            deployed = lookup.deployed_instances.len(),
            total = lookup.total_instances,
            "Instance lookup result"
        );

        self.deploy_to_new_instances(environment, tracking, lookup.new_instances)
            .await;
        self.update_deployed_instances(environment, &current, tracking, lookup.deployed_instances)
            .await?;

        Ok(format!(
            "Done reconciling environment against deployment {}",
            current.id()
        ))
    }

    async fn lookup_instances(
        &self,
        environment: &Environment,
        tracking: &mut TrackingInfo,
    ) -> Result<InstanceLookup> {
        let cluster = environment.cluster();
        let instances = self.inner.cluster_state.list_instances(cluster).await?;
        let usable: Vec<&str> = instances
            .iter()
            .filter(|i| i.status != INSTANCE_INACTIVE)
            .map(|i| i.arn.as_str())
            .collect();
        let usable_set: HashSet<&str> = usable.iter().copied().collect();

        let evicted = tracking.retain_instances(&usable_set);
        if evicted > 0 {
            debug!(
                environment = %environment.name(),
                evicted,
                "Stopped tracking instances that left the cluster or became inactive"
            );
        }

        let tasks = self.inner.cluster_state.list_tasks(cluster).await?;
        let mut deployed: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
        for task in tasks {
            if task.desired_status != TASK_RUNNING {
                continue;
            }
            let Some(started_by) = task.started_by else {
                continue;
            };
            if environment.deployment(&started_by).is_none() {
                continue;
            }
            if !usable_set.contains(task.instance_arn.as_str()) {
                continue;
            }
            deployed
                .entry(task.instance_arn)
                .or_default()
                .push(Observation::Confirmed {
                    task_arn: task.arn,
                    deployment_id: started_by,
                });
        }

        // Dispatched starts the cluster state may not have caught up with yet.
        // Appended after the confirmed tasks, even when the instance has some:
        // a lagging view can still show the task a start just replaced.
        for instance_arn in tracking.instances() {
            deployed
                .entry(instance_arn.to_string())
                .or_default()
                .push(Observation::Unconfirmed);
        }

        let new_instances = usable
            .iter()
            .filter(|arn| !deployed.contains_key(**arn))
            .map(|arn| arn.to_string())
            .collect();

        Ok(InstanceLookup {
            total_instances: instances.len(),
            new_instances,
            deployed_instances: deployed,
        })
    }

    async fn deploy_to_new_instances(
        &self,
        environment: &Environment,
        tracking: &mut TrackingInfo,
        instances: Vec<String>,
    ) {
        if instances.is_empty() {
            return;
        }

        let now = Instant::now();
        for instance_arn in &instances {
            tracking.track(instance_arn, now);
        }

        debug!(
            environment = %environment.name(),
            instances = instances.len(),
            "Starting deployment on new instances"
        );
        self.emit(Event::StartDeployment {
            environment: environment.clone(),
            instances,
        })
        .await;
    }

    async fn update_deployed_instances(
        &self,
        environment: &Environment,
        current: &Deployment,
        tracking: &mut TrackingInfo,
        deployed_instances: BTreeMap<String, Vec<Observation>>,
    ) -> Result<()> {
        let ttl = self.inner.config.tracking_ttl;

        for (instance_arn, observations) in deployed_instances {
            let mut should_deploy = true;
            let mut tasks_to_stop = Vec::new();

            for observation in observations {
                match observation {
                    Observation::Confirmed {
                        task_arn,
                        deployment_id,
                    } => {
                        if deployment_id == current.id() {
                            tracking.untrack(&instance_arn);
                            // Keep one task of the current deployment, stop any duplicates.
                            if should_deploy {
                                should_deploy = false;
                                continue;
                            }
                        }
                        debug!(
                            environment = %environment.name(),
                            instance_arn = %instance_arn,
                            task_arn = %task_arn,
                            "Adding task to stop list"
                        );
                        tasks_to_stop.push(task_arn);
                    }
                    Observation::Unconfirmed => {
                        let now = Instant::now();
                        if tracking.is_expired(&instance_arn, ttl, now) {
                            let deployed = self
                                .is_deployed_to_instance(environment, current, &instance_arn)
                                .await?;
                            if deployed {
                                tracking.track(&instance_arn, now);
                            }
                            should_deploy = !deployed;
                        } else if tracking.tracked_at(&instance_arn).is_some() {
                            should_deploy = false;
                        }
                    }
                }
            }

            if !tasks_to_stop.is_empty() {
                debug!(
                    environment = %environment.name(),
                    tasks = tasks_to_stop.len(),
                    "Stopping stale tasks"
                );
                self.emit(Event::StopTasks {
                    cluster: environment.cluster().to_string(),
                    tasks: tasks_to_stop,
                    environment: environment.clone(),
                })
                .await;
            }

            if should_deploy {
                debug!(
                    environment = %environment.name(),
                    deployment_id = %current.id(),
                    instance_arn = %instance_arn,
                    "Redeploying to instance"
                );
                tracking.track(&instance_arn, Instant::now());
                self.emit(Event::StartDeployment {
                    environment: environment.clone(),
                    instances: vec![instance_arn],
                })
                .await;
            }
        }

        Ok(())
    }

    /// Ask the orchestrator whether a task of `current` exists on the instance.
    async fn is_deployed_to_instance(
        &self,
        environment: &Environment,
        current: &Deployment,
        instance_arn: &str,
    ) -> Result<bool> {
        let cluster = environment.cluster();
        let task_arns = self
            .inner
            .orchestrator
            .list_tasks_by_instance(cluster, instance_arn)
            .await?;
        if task_arns.is_empty() {
            return Ok(false);
        }

        let described = self
            .inner
            .orchestrator
            .describe_tasks(cluster, &task_arns)
            .await?;
        Ok(described
            .tasks
            .iter()
            .any(|t| t.started_by.as_deref() == Some(current.id())))
    }

    async fn emit(&self, event: Event) {
        let kind = event.kind();
        if self.inner.events.send(event).await.is_err() {
            warn!(
                scheduler_id = %self.inner.id,
                event = kind,
                "Event channel closed, dropping event"
            );
        }
    }
}
