// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment operations and the cluster-state lookups environments need.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::info;

use crate::error::{Error, Result};
use crate::facade::{ClusterState, FacadeError, INSTANCE_INACTIVE, Orchestrator};
use crate::store::{EnvironmentMutation, EnvironmentStore};
use crate::types::Environment;

/// The only supported filter key.
pub const CLUSTER_FILTER: &str = "cluster";

static CLUSTER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_-]{1,255}$").expect("cluster name pattern is valid")
});

static CLUSTER_ARN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^arn:aws:ecs:[a-z0-9-]+:[0-9]{12}:cluster/[a-zA-Z0-9_-]{1,255}$")
        .expect("cluster ARN pattern is valid")
});

/// Whether `value` is a plain cluster name.
pub fn is_cluster_name(value: &str) -> bool {
    CLUSTER_NAME.is_match(value)
}

/// Whether `value` is a cluster ARN.
pub fn is_cluster_arn(value: &str) -> bool {
    CLUSTER_ARN.is_match(value)
}

/// Create, read, delete and filter environments.
#[derive(Clone)]
pub struct EnvironmentService {
    store: EnvironmentStore,
    orchestrator: Arc<dyn Orchestrator>,
}

impl EnvironmentService {
    /// Create a service over a store and an orchestrator.
    pub fn new(store: EnvironmentStore, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Store a new environment. Fails if one with the same name exists.
    pub async fn create_environment(
        &self,
        name: &str,
        task_definition: &str,
        cluster: &str,
    ) -> Result<Environment> {
        if name.is_empty() {
            return Err(Error::BadRequest("Environment name is missing".to_string()));
        }

        let env = self
            .store
            .put_environment(
                name,
                &ValidateAndCreateEnvironment::new(name, task_definition, cluster),
            )
            .await?;

        info!(environment = %name, cluster = %cluster, "Created environment");
        Ok(env)
    }

    /// Resolve the cluster and task definition with the orchestrator, then
    /// create the environment with their ARNs.
    pub async fn register_environment(
        &self,
        name: &str,
        task_definition: &str,
        cluster: &str,
    ) -> Result<Environment> {
        if name.is_empty() || task_definition.is_empty() || cluster.is_empty() {
            return Err(Error::BadRequest(
                "Environment name, task definition and cluster are required".to_string(),
            ));
        }

        let cluster = self
            .orchestrator
            .describe_cluster(cluster)
            .await
            .map_err(not_found_or_facade)?;
        let task_definition = self
            .orchestrator
            .describe_task_definition(task_definition)
            .await
            .map_err(not_found_or_facade)?;

        self.create_environment(name, &task_definition.arn, &cluster.arn)
            .await
    }

    /// Read an environment.
    pub async fn get_environment(&self, name: &str) -> Result<Option<Environment>> {
        self.store.get_environment(name).await
    }

    /// Delete an environment. Deleting a missing environment does nothing.
    pub async fn delete_environment(&self, name: &str) -> Result<()> {
        if self.store.get_environment(name).await?.is_none() {
            info!(environment = %name, "Environment does not exist, nothing to delete");
            return Ok(());
        }

        self.store.delete_environment(name).await?;
        info!(environment = %name, "Deleted environment");
        Ok(())
    }

    /// All environments, ordered by name.
    pub async fn list_environments(&self) -> Result<Vec<Environment>> {
        self.store.list_environments().await
    }

    /// Environments matching a filter.
    ///
    /// Only [`CLUSTER_FILTER`] is supported. A cluster ARN matches exactly; a
    /// cluster name matches environments whose cluster ARN ends in `/<name>`.
    pub async fn filter_environments(&self, key: &str, value: &str) -> Result<Vec<Environment>> {
        if key.is_empty() {
            return Err(Error::BadRequest("Filter key is missing".to_string()));
        }
        if value.is_empty() {
            return Err(Error::BadRequest("Filter value is missing".to_string()));
        }
        if key != CLUSTER_FILTER {
            return Err(Error::BadRequest(format!(
                "Unsupported filter key '{}'. Supported filters are '[{}]'",
                key, CLUSTER_FILTER
            )));
        }

        let matches: Box<dyn Fn(&Environment) -> bool + Send> = if is_cluster_arn(value) {
            let arn = value.to_string();
            Box::new(move |env| env.cluster() == arn)
        } else if is_cluster_name(value) {
            let suffix = format!("/{}", value);
            Box::new(move |env| env.cluster().ends_with(&suffix))
        } else {
            return Err(Error::BadRequest(format!(
                "'{}' is neither a cluster name nor a cluster ARN",
                value
            )));
        };

        Ok(self
            .store
            .list_environments()
            .await?
            .into_iter()
            .filter(|env| matches(env))
            .collect())
    }
}

/// Creates an environment if none with that name exists.
pub struct ValidateAndCreateEnvironment {
    name: String,
    task_definition: String,
    cluster: String,
}

impl ValidateAndCreateEnvironment {
    /// Create the mutation.
    pub fn new(name: &str, task_definition: &str, cluster: &str) -> Self {
        Self {
            name: name.to_string(),
            task_definition: task_definition.to_string(),
            cluster: cluster.to_string(),
        }
    }
}

#[async_trait]
impl EnvironmentMutation for ValidateAndCreateEnvironment {
    type Output = Environment;

    async fn apply(&self, existing: Option<Environment>) -> Result<(Environment, Environment)> {
        if existing.is_some() {
            return Err(Error::BadRequest(format!(
                "An environment with name {} already exists",
                self.name
            )));
        }

        let env = Environment::new(&self.name, &self.task_definition, &self.cluster)?;
        Ok((env.clone(), env))
    }
}

/// Cluster-state lookups on behalf of an environment.
#[derive(Clone)]
pub struct EnvironmentFacade {
    cluster_state: Arc<dyn ClusterState>,
}

impl EnvironmentFacade {
    /// Create a facade over a cluster-state source.
    pub fn new(cluster_state: Arc<dyn ClusterState>) -> Self {
        Self { cluster_state }
    }

    /// ARNs of the usable instances in the environment's cluster.
    pub async fn instance_arns(&self, environment: &Environment) -> Result<Vec<String>> {
        let instances = self
            .cluster_state
            .list_instances(environment.cluster())
            .await?;

        Ok(instances
            .into_iter()
            .filter(|i| i.status != INSTANCE_INACTIVE)
            .map(|i| i.arn)
            .collect())
    }
}

fn not_found_or_facade(err: FacadeError) -> Error {
    match err {
        FacadeError::ClusterNotFound(_) | FacadeError::TaskDefinitionNotFound(_) => {
            Error::NotFound(err.to_string())
        }
        other => Error::Facade(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{EcsOrchestrator, InMemoryCluster};
    use crate::store::MemoryKeyValueStore;

    const PROD_ARN: &str = "arn:aws:ecs:us-east-1:123456789012:cluster/prod";
    const PROD2_ARN: &str = "arn:aws:ecs:us-east-1:123456789012:cluster/prod2";

    fn service_with(sim: Arc<InMemoryCluster>) -> EnvironmentService {
        EnvironmentService::new(
            EnvironmentStore::new(Arc::new(MemoryKeyValueStore::new())),
            Arc::new(EcsOrchestrator::new(sim)),
        )
    }

    fn service() -> EnvironmentService {
        service_with(Arc::new(InMemoryCluster::new()))
    }

    #[test]
    fn test_cluster_name_and_arn_patterns() {
        assert!(is_cluster_name("prod"));
        assert!(is_cluster_name("my_cluster-1"));
        assert!(!is_cluster_name("prod/1"));
        assert!(!is_cluster_name(""));
        assert!(!is_cluster_name(&"a".repeat(256)));

        assert!(is_cluster_arn(PROD_ARN));
        assert!(!is_cluster_arn("arn:aws:ecs:us-east-1:1234:cluster/prod"));
        assert!(!is_cluster_arn("arn:aws:ecs:us-east-1:123456789012:task/prod"));
        assert!(!is_cluster_arn("prod"));
    }

    #[tokio::test]
    async fn test_create_environment() {
        let service = service();
        let env = service
            .create_environment("web", "web:1", PROD_ARN)
            .await
            .unwrap();
        assert_eq!(env.name(), "web");
        assert_eq!(service.get_environment("web").await.unwrap(), Some(env));
    }

    #[tokio::test]
    async fn test_create_environment_rejects_duplicates_and_missing_fields() {
        let service = service();
        service
            .create_environment("web", "web:1", PROD_ARN)
            .await
            .unwrap();

        let cases = vec![
            ("web", "web:1", PROD_ARN),
            ("", "web:1", PROD_ARN),
            ("api", "", PROD_ARN),
            ("api", "api:1", ""),
        ];
        for (name, td, cluster) in cases {
            let err = service.create_environment(name, td, cluster).await.unwrap_err();
            assert!(err.is_bad_request(), "expected bad request for {:?}", (name, td, cluster));
        }
    }

    #[tokio::test]
    async fn test_register_environment_resolves_arns() {
        let sim = Arc::new(InMemoryCluster::new());
        let cluster_arn = sim.add_cluster("prod").await;
        let td_arn = sim.register_task_definition("web").await;
        let service = service_with(sim);

        let env = service
            .register_environment("web", "web", "prod")
            .await
            .unwrap();
        assert_eq!(env.cluster(), cluster_arn);
        assert_eq!(env.desired_task_definition(), td_arn);
    }

    #[tokio::test]
    async fn test_register_environment_unknown_cluster_or_task_definition() {
        let sim = Arc::new(InMemoryCluster::new());
        sim.add_cluster("prod").await;
        sim.register_task_definition("web").await;
        let service = service_with(sim);

        assert!(
            service
                .register_environment("web", "web", "staging")
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            service
                .register_environment("web", "api", "prod")
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(service.get_environment("web").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_environment() {
        let service = service();
        service
            .create_environment("web", "web:1", PROD_ARN)
            .await
            .unwrap();

        service.delete_environment("web").await.unwrap();
        assert!(service.get_environment("web").await.unwrap().is_none());

        service.delete_environment("web").await.unwrap();
        assert!(service.delete_environment("").await.unwrap_err().is_bad_request());
    }

    #[tokio::test]
    async fn test_filter_environments_by_cluster() {
        let service = service();
        service.create_environment("a", "td:1", PROD_ARN).await.unwrap();
        service.create_environment("b", "td:1", PROD2_ARN).await.unwrap();
        service.create_environment("c", "td:1", PROD_ARN).await.unwrap();

        let names = |envs: Vec<Environment>| -> Vec<String> {
            envs.iter().map(|e| e.name().to_string()).collect()
        };

        let by_arn = service.filter_environments("cluster", PROD_ARN).await.unwrap();
        assert_eq!(names(by_arn), vec!["a", "c"]);

        // Name matching is a suffix match on "/<name>", so "prod" does not match "prod2".
        let by_name = service.filter_environments("cluster", "prod").await.unwrap();
        assert_eq!(names(by_name), vec!["a", "c"]);

        let by_name = service.filter_environments("cluster", "prod2").await.unwrap();
        assert_eq!(names(by_name), vec!["b"]);

        assert!(service.filter_environments("cluster", "none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filter_environments_rejects_bad_filters() {
        let service = service();
        let cases = vec![
            ("", "prod"),
            ("cluster", ""),
            ("status", "prod"),
            ("cluster", "not a cluster/"),
        ];
        for (key, value) in cases {
            let err = service.filter_environments(key, value).await.unwrap_err();
            assert!(err.is_bad_request(), "expected bad request for {:?}", (key, value));
        }
    }

    #[tokio::test]
    async fn test_instance_arns_skips_inactive_instances() {
        let sim = Arc::new(InMemoryCluster::new());
        let cluster = sim.add_cluster("prod").await;
        let active = sim.add_instance(&cluster).await.unwrap();
        let inactive = sim.add_instance(&cluster).await.unwrap();
        sim.set_instance_status(&inactive, INSTANCE_INACTIVE).await;

        let env = Environment::new("web", "web:1", &cluster).unwrap();
        let facade = EnvironmentFacade::new(sim);
        assert_eq!(facade.instance_arns(&env).await.unwrap(), vec![active]);
    }
}
