// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages exchanged between the scheduler, the monitor and the dispatcher.

use crate::error::Error;
use crate::types::{Deployment, Environment};

/// Everything that flows through the dispatcher's channels.
///
/// The first three variants are requests the dispatcher acts on. The rest
/// are reports: the dispatcher emits the result variants on its output
/// channel and only logs reports that reach its input.
#[derive(Debug)]
pub enum Event {
    /// Start the environment's current deployment on the given instances.
    StartDeployment {
        environment: Environment,
        instances: Vec<String>,
    },
    /// Stop the given tasks of the cluster.
    StopTasks {
        cluster: String,
        tasks: Vec<String>,
        environment: Environment,
    },
    /// Advance the environment's in-progress deployment.
    UpdateInProgressDeployment { environment: Environment },
    /// A reconciliation pass failed, for one environment or as a whole.
    SchedulerError {
        error: Error,
        environment: Option<Environment>,
    },
    /// Reconciliation of one environment finished.
    SchedulerEnvironment {
        environment: Environment,
        message: String,
    },
    /// Handling a request failed.
    Error { error: Error },
    /// Tasks confirmed stopped by a [`Event::StopTasks`] request.
    StopTasksResult { stopped_tasks: Vec<String> },
    /// Deployment produced by a [`Event::StartDeployment`] request.
    StartDeploymentResult { deployment: Deployment },
    /// The monitor could not enumerate environments.
    MonitorError { error: Error },
}

impl Event {
    /// Stable name of the event kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartDeployment { .. } => "StartDeploymentEvent",
            Self::StopTasks { .. } => "StopTasksEvent",
            Self::UpdateInProgressDeployment { .. } => "UpdateInProgressDeploymentEvent",
            Self::SchedulerError { .. } => "SchedulerErrorEvent",
            Self::SchedulerEnvironment { .. } => "SchedulerEnvironmentEvent",
            Self::Error { .. } => "ErrorEvent",
            Self::StopTasksResult { .. } => "StopTasksResult",
            Self::StartDeploymentResult { .. } => "StartDeploymentResult",
            Self::MonitorError { .. } => "MonitorErrorEvent",
        }
    }

    /// Whether this event reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::SchedulerError { .. } | Self::Error { .. } | Self::MonitorError { .. }
        )
    }

    /// Name of the environment the event concerns, if any.
    pub fn environment_name(&self) -> Option<&str> {
        match self {
            Self::StartDeployment { environment, .. }
            | Self::StopTasks { environment, .. }
            | Self::UpdateInProgressDeployment { environment }
            | Self::SchedulerEnvironment { environment, .. } => Some(environment.name()),
            Self::SchedulerError { environment, .. } => environment.as_ref().map(|e| e.name()),
            Self::Error { .. }
            | Self::StopTasksResult { .. }
            | Self::StartDeploymentResult { .. }
            | Self::MonitorError { .. } => None,
        }
    }
}
