// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Business operations on environments and deployments.

mod deployment;
mod environment;

pub use deployment::{
    DeploymentService, ValidateAndCreateDeployment, ValidateAndCreateSubDeployment,
    ValidateAndStartDeployment, ValidateAndUpdateInProgressDeployment,
};
pub use environment::{
    CLUSTER_FILTER, EnvironmentFacade, EnvironmentService, ValidateAndCreateEnvironment,
    is_cluster_arn, is_cluster_name,
};
