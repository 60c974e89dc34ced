// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types: deployments and the environment aggregate that owns them.

mod deployment;
mod environment;

pub use deployment::{Deployment, DeploymentHealth, DeploymentStatus, Failure};
pub use environment::{Environment, EnvironmentHealth};
