// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment aggregate.
//!
//! An environment owns every deployment made for it and keeps two pointers
//! into its deployment map: the pending deployment (created, not started) and
//! the in-progress deployment (tasks started, not yet completed).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::deployment::{Deployment, DeploymentHealth, DeploymentStatus};
use crate::error::{Error, Result};

/// Health of an environment, mirrored from its latest updated deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentHealth {
    /// The latest deployment update was healthy.
    Healthy,
    /// The latest deployment update reported placement failures.
    Unhealthy,
}

/// A named daemon workload bound to one cluster and one task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    name: String,
    cluster: String,
    desired_task_definition: String,
    desired_task_count: usize,
    health: EnvironmentHealth,
    token: String,
    #[serde(default)]
    pending_deployment_id: Option<String>,
    #[serde(default)]
    in_progress_deployment_id: Option<String>,
    #[serde(default)]
    deployments: HashMap<String, Deployment>,
}

impl Environment {
    /// Create a healthy environment with no deployments and a fresh token.
    pub fn new(name: &str, task_definition: &str, cluster: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::BadRequest("Environment name is missing".to_string()));
        }
        if task_definition.is_empty() {
            return Err(Error::BadRequest(
                "Environment task definition is missing".to_string(),
            ));
        }
        if cluster.is_empty() {
            return Err(Error::BadRequest(
                "Environment cluster is missing".to_string(),
            ));
        }

        Ok(Self {
            name: name.to_string(),
            cluster: cluster.to_string(),
            desired_task_definition: task_definition.to_string(),
            desired_task_count: 0,
            health: EnvironmentHealth::Healthy,
            token: Uuid::new_v4().to_string(),
            pending_deployment_id: None,
            in_progress_deployment_id: None,
            deployments: HashMap::new(),
        })
    }

    /// Unique environment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster the environment is bound to.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Task definition new deployments roll out.
    pub fn desired_task_definition(&self) -> &str {
        &self.desired_task_definition
    }

    /// Desired task count of the latest updated deployment.
    pub fn desired_task_count(&self) -> usize {
        self.desired_task_count
    }

    /// Current health.
    pub fn health(&self) -> EnvironmentHealth {
        self.health
    }

    /// Token the next deployment-create request must present.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// ID of the pending deployment, if any.
    pub fn pending_deployment_id(&self) -> Option<&str> {
        self.pending_deployment_id.as_deref()
    }

    /// ID of the in-progress deployment, if any.
    pub fn in_progress_deployment_id(&self) -> Option<&str> {
        self.in_progress_deployment_id.as_deref()
    }

    /// All deployments keyed by ID.
    pub fn deployments(&self) -> &HashMap<String, Deployment> {
        &self.deployments
    }

    /// Look up a deployment by ID.
    pub fn deployment(&self, id: &str) -> Option<&Deployment> {
        self.deployments.get(id)
    }

    /// The pending deployment. Errors if the pointer references a missing deployment.
    pub fn pending_deployment(&self) -> Result<Option<&Deployment>> {
        self.resolve(self.pending_deployment_id.as_deref())
    }

    /// The in-progress deployment. Errors if the pointer references a missing deployment.
    pub fn in_progress_deployment(&self) -> Result<Option<&Deployment>> {
        self.resolve(self.in_progress_deployment_id.as_deref())
    }

    fn resolve(&self, id: Option<&str>) -> Result<Option<&Deployment>> {
        match id {
            None => Ok(None),
            Some(id) => self.deployments.get(id).map(Some).ok_or_else(|| {
                Error::NotFound(format!(
                    "Deployment with ID '{}' does not exist in the deployments for environment with name '{}'",
                    id, self.name
                ))
            }),
        }
    }

    /// Deployments ordered by start time, latest first. Equal start times are
    /// ordered by deployment ID.
    pub fn sorted_deployments(&self) -> Vec<&Deployment> {
        let mut deployments: Vec<&Deployment> = self.deployments.values().collect();
        deployments.sort_by(|a, b| {
            b.start_time()
                .cmp(&a.start_time())
                .then_with(|| a.id().cmp(b.id()))
        });
        deployments
    }

    /// The deployment used for starting tasks: the in-progress deployment if
    /// one exists, otherwise the latest completed one.
    pub fn current_deployment(&self) -> Result<Option<&Deployment>> {
        if let Some(in_progress) = self.in_progress_deployment()? {
            return Ok(Some(in_progress));
        }

        Ok(self
            .sorted_deployments()
            .into_iter()
            .find(|d| d.status() == DeploymentStatus::Completed))
    }

    /// Add a pending deployment and point the pending pointer at it.
    ///
    /// A pending deployment that was never started is superseded: it is
    /// removed from the environment and returned.
    pub fn add_pending_deployment(&mut self, deployment: Deployment) -> Result<Option<Deployment>> {
        if deployment.status() != DeploymentStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "Deployment '{}' is {} and cannot be added as pending",
                deployment.id(),
                deployment.status()
            )));
        }
        if self.deployments.contains_key(deployment.id()) {
            return Err(Error::BadRequest(format!(
                "Deployment '{}' already exists",
                deployment.id()
            )));
        }
        let superseded = self
            .pending_deployment_id
            .take()
            .and_then(|id| self.deployments.remove(&id));

        self.pending_deployment_id = Some(deployment.id().to_string());
        self.deployments
            .insert(deployment.id().to_string(), deployment);
        Ok(superseded)
    }

    /// Move the pending pointer to the in-progress pointer.
    ///
    /// The stored deployment must still be pending; callers replace it with
    /// its in-progress version afterwards.
    pub fn update_pending_deployment_to_in_progress(&mut self) -> Result<()> {
        let pending_id = self.pending_deployment_id.as_deref().ok_or_else(|| {
            Error::InvalidTransition(format!(
                "There is no pending deployment in environment '{}'",
                self.name
            ))
        })?;

        let pending = self.resolve(Some(pending_id))?.ok_or_else(|| {
            Error::NotFound(format!("Pending deployment '{}' is missing", pending_id))
        })?;
        if pending.status() != DeploymentStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "Deployment '{}' is {} and not pending",
                pending_id,
                pending.status()
            )));
        }

        self.in_progress_deployment_id = self.pending_deployment_id.take();
        Ok(())
    }

    /// Replace a stored deployment with an updated version and mirror its
    /// desired count and health onto the environment.
    pub(crate) fn replace_deployment(&mut self, deployment: Deployment) -> Result<()> {
        if !self.deployments.contains_key(deployment.id()) {
            return Err(Error::NotFound(format!(
                "Deployment with ID '{}' does not exist in environment with name '{}'",
                deployment.id(),
                self.name
            )));
        }

        self.desired_task_count = deployment.desired_task_count();
        self.health = match deployment.health() {
            DeploymentHealth::Healthy => EnvironmentHealth::Healthy,
            DeploymentHealth::Unhealthy => EnvironmentHealth::Unhealthy,
        };
        if deployment.status() == DeploymentStatus::Completed
            && self.in_progress_deployment_id.as_deref() == Some(deployment.id())
        {
            self.in_progress_deployment_id = None;
        }
        self.deployments
            .insert(deployment.id().to_string(), deployment);
        Ok(())
    }

    /// Issue a new token, invalidating the current one.
    pub(crate) fn rotate_token(&mut self) {
        self.token = Uuid::new_v4().to_string();
    }

    #[cfg(test)]
    pub(crate) fn insert_deployment_for_test(&mut self, deployment: Deployment) {
        self.deployments
            .insert(deployment.id().to_string(), deployment);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn env() -> Environment {
        Environment::new("web", "web:1", "arn:aws:ecs:us-east-1:123456789012:cluster/prod").unwrap()
    }

    #[test]
    fn test_new_environment_validates_inputs() {
        assert!(Environment::new("", "web:1", "c").unwrap_err().is_bad_request());
        assert!(Environment::new("web", "", "c").unwrap_err().is_bad_request());
        assert!(Environment::new("web", "web:1", "").unwrap_err().is_bad_request());

        let e = env();
        assert_eq!(e.health(), EnvironmentHealth::Healthy);
        assert!(!e.token().is_empty());
        assert!(e.deployments().is_empty());
        assert!(e.pending_deployment_id().is_none());
        assert!(e.in_progress_deployment_id().is_none());
    }

    #[test]
    fn test_add_pending_deployment() {
        let mut e = env();
        let d = Deployment::new("web:1", e.token()).unwrap();
        let id = d.id().to_string();

        e.add_pending_deployment(d).unwrap();
        assert_eq!(e.pending_deployment_id(), Some(id.as_str()));
        assert_eq!(e.pending_deployment().unwrap().unwrap().id(), id);
    }

    #[test]
    fn test_add_pending_deployment_rejects_non_pending() {
        let mut e = env();
        let mut d = Deployment::new("web:1", e.token()).unwrap();
        d.update_to_in_progress(1, vec![]).unwrap();

        let err = e.add_pending_deployment(d).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
        assert!(e.deployments().is_empty());
    }

    #[test]
    fn test_add_pending_deployment_supersedes_unstarted_pending() {
        let mut e = env();
        let first = Deployment::new("web:1", "t1").unwrap();
        assert!(e.add_pending_deployment(first.clone()).unwrap().is_none());

        let second = Deployment::new("web:1", "t2").unwrap();
        let superseded = e.add_pending_deployment(second.clone()).unwrap();
        assert_eq!(superseded.map(|d| d.id().to_string()), Some(first.id().to_string()));

        assert_eq!(e.pending_deployment_id(), Some(second.id()));
        assert_eq!(e.deployments().len(), 1);
        assert!(e.deployment(first.id()).is_none());
    }

    #[test]
    fn test_update_pending_deployment_to_in_progress() {
        let mut e = env();
        let d = Deployment::new("web:1", "t1").unwrap();
        let id = d.id().to_string();
        e.add_pending_deployment(d).unwrap();

        e.update_pending_deployment_to_in_progress().unwrap();
        assert!(e.pending_deployment_id().is_none());
        assert_eq!(e.in_progress_deployment_id(), Some(id.as_str()));
    }

    #[test]
    fn test_update_pending_deployment_to_in_progress_without_pending() {
        let mut e = env();
        let err = e.update_pending_deployment_to_in_progress().unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[test]
    fn test_update_pending_deployment_to_in_progress_rejects_non_pending_status() {
        let mut e = env();
        let d = Deployment::new("web:1", "t1").unwrap();
        e.add_pending_deployment(d.clone()).unwrap();

        let mut started = d;
        started.update_to_in_progress(1, vec![]).unwrap();
        e.insert_deployment_for_test(started);

        let err = e.update_pending_deployment_to_in_progress().unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
        assert!(e.pending_deployment_id().is_some());
    }

    #[test]
    fn test_pending_pointer_to_missing_deployment_is_an_error() {
        let mut e = env();
        e.pending_deployment_id = Some("gone".to_string());
        assert!(e.pending_deployment().unwrap_err().is_not_found());
        assert!(e.update_pending_deployment_to_in_progress().unwrap_err().is_not_found());
    }

    #[test]
    fn test_sorted_deployments_latest_first_with_id_tie_break() {
        let mut e = env();
        let now = Utc::now();
        let old = Deployment::new("web:1", "t")
            .unwrap()
            .with_id("a-old")
            .with_start_time(now - Duration::minutes(5));
        let tie_b = Deployment::new("web:1", "t")
            .unwrap()
            .with_id("b")
            .with_start_time(now);
        let tie_a = Deployment::new("web:1", "t")
            .unwrap()
            .with_id("a")
            .with_start_time(now);
        e.insert_deployment_for_test(old);
        e.insert_deployment_for_test(tie_b);
        e.insert_deployment_for_test(tie_a);

        let ids: Vec<&str> = e.sorted_deployments().iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["a", "b", "a-old"]);
    }

    #[test]
    fn test_current_deployment_prefers_in_progress() {
        let mut e = env();
        let now = Utc::now();

        let mut completed = Deployment::new("web:1", "t0")
            .unwrap()
            .with_start_time(now - Duration::minutes(10));
        completed.update_to_in_progress(1, vec![]).unwrap();
        completed.update_to_completed(vec![]).unwrap();
        let completed_id = completed.id().to_string();
        e.insert_deployment_for_test(completed);

        assert_eq!(e.current_deployment().unwrap().unwrap().id(), completed_id);

        let d = Deployment::new("web:2", "t1").unwrap();
        let id = d.id().to_string();
        e.add_pending_deployment(d).unwrap();
        // Pending deployments are never current.
        assert_eq!(e.current_deployment().unwrap().unwrap().id(), completed_id);

        e.update_pending_deployment_to_in_progress().unwrap();
        assert_eq!(e.current_deployment().unwrap().unwrap().id(), id);
    }

    #[test]
    fn test_current_deployment_none_without_started_deployments() {
        let mut e = env();
        assert!(e.current_deployment().unwrap().is_none());
        e.add_pending_deployment(Deployment::new("web:1", "t").unwrap())
            .unwrap();
        assert!(e.current_deployment().unwrap().is_none());
    }

    #[test]
    fn test_replace_deployment_mirrors_health_and_count() {
        let mut e = env();
        let d = Deployment::new("web:1", "t").unwrap();
        e.add_pending_deployment(d.clone()).unwrap();
        e.update_pending_deployment_to_in_progress().unwrap();

        let mut updated = d.clone();
        updated
            .update_to_in_progress(4, vec![crate::types::Failure::new("i-1", "RESOURCE:CPU")])
            .unwrap();
        e.replace_deployment(updated.clone()).unwrap();
        assert_eq!(e.health(), EnvironmentHealth::Unhealthy);
        assert_eq!(e.desired_task_count(), 4);

        updated.update_to_completed(vec![]).unwrap();
        e.replace_deployment(updated).unwrap();
        assert_eq!(e.health(), EnvironmentHealth::Healthy);
        assert!(e.in_progress_deployment_id().is_none());
        assert_eq!(
            e.deployment(d.id()).unwrap().status(),
            DeploymentStatus::Completed
        );
    }

    #[test]
    fn test_replace_unknown_deployment_fails() {
        let mut e = env();
        let d = Deployment::new("web:1", "t").unwrap();
        assert!(e.replace_deployment(d).unwrap_err().is_not_found());
    }

    #[test]
    fn test_rotate_token() {
        let mut e = env();
        let before = e.token().to_string();
        e.rotate_token();
        assert_ne!(e.token(), before);
    }

    #[test]
    fn test_environment_json_roundtrip() {
        let mut e = env();
        e.add_pending_deployment(Deployment::new("web:1", "t").unwrap())
            .unwrap();

        let json = serde_json::to_vec(&e).unwrap();
        let decoded: Environment = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, e);
    }
}
