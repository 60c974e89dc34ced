// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Daemon Scheduler - one task per instance, on every instance
//!
//! This crate keeps the desired task definition of each *environment*
//! running exactly once on every usable instance of the environment's
//! cluster, and rolls out new task definitions as *deployments*.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   StartDeployment / StopTasks   ┌──────────────┐
//!  │  Scheduler   │ ──────────────────────────────► │              │
//!  │ (reconcile)  │                                 │  Dispatcher  │──► results
//!  └──────────────┘                                 │              │
//!  ┌──────────────┐   UpdateInProgressDeployment    │              │
//!  │   Monitor    │ ──────────────────────────────► │              │
//!  └──────────────┘                                 └──────┬───────┘
//!         │                                                │
//!         ▼                                                ▼
//!  ┌──────────────────────────────────┐   ┌──────────────────────────────┐
//!  │ EnvironmentService /             │   │ Orchestrator (authoritative) │
//!  │ DeploymentService                │──►│ ClusterState (may lag)       │
//!  └──────────────────────────────────┘   └──────────────────────────────┘
//!         │
//!         ▼
//!  ┌──────────────────────────────────┐
//!  │ EnvironmentStore (optimistic,    │
//!  │ retried compare-and-put)         │
//!  └──────────────────────────────────┘
//! ```
//!
//! # Deployments
//!
//! A deployment moves `pending -> in_progress -> completed` and never back.
//! An environment holds at most one pending and one in-progress deployment.
//! Creating a deployment consumes the environment's token, so retrying a
//! request with the same token is rejected instead of deploying twice.
//!
//! # Persistence
//!
//! Each environment, with all of its deployments, is one JSON document in a
//! [`store::KeyValueStore`]. Every change runs as a read-validate-write
//! transaction that retries when another writer got there first.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`store::SqliteKeyValueStore`] | The binary; file or in-memory SQLite |
//! | [`store::MemoryKeyValueStore`] | Tests and simulations |
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables read by
//! the binary.

pub mod config;
pub mod deployment_worker;
pub mod engine;
pub mod error;
pub mod facade;
pub mod runtime;
pub mod service;
pub mod store;
pub mod types;

pub use config::Config;
pub use deployment_worker::DeploymentWorker;
pub use engine::{Dispatcher, Event, Monitor, Scheduler};
pub use error::{Error, Result};
pub use runtime::SchedulerRuntime;
pub use service::{DeploymentService, EnvironmentFacade, EnvironmentService};
pub use store::EnvironmentStore;
pub use types::{Deployment, DeploymentStatus, Environment};
