// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-progress deployment monitor.
//!
//! Runs on its own ticker and asks the dispatcher to advance the in-progress
//! deployment of every environment. Environments without one are cheap
//! no-ops for the deployment worker.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::events::Event;
use crate::error::Result;
use crate::service::EnvironmentService;

/// Configuration for the monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between monitor passes.
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Periodically requests in-progress deployment updates.
pub struct Monitor {
    environments: EnvironmentService,
    events: mpsc::Sender<Event>,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(
        environments: EnvironmentService,
        events: mpsc::Sender<Event>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            environments,
            events,
            config,
        }
    }

    /// Run the monitor loop until `cancel` fires. The first pass runs one
    /// interval after start.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "In-progress monitor started"
        );

        let start = tokio::time::Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("In-progress monitor received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("In-progress monitor stopped");
    }

    /// Run one pass, reporting a listing failure as [`Event::MonitorError`].
    pub async fn tick(&self) {
        match self.run_once().await {
            Ok(count) => debug!(environments = count, "Requested in-progress deployment updates"),
            Err(e) => {
                error!(error = %e, "Could not retrieve environments");
                if self.events.send(Event::MonitorError { error: e }).await.is_err() {
                    debug!("Event channel closed, dropping monitor error");
                }
            }
        }
    }

    /// Send one [`Event::UpdateInProgressDeployment`] per environment.
    /// Returns how many were sent.
    pub async fn run_once(&self) -> Result<usize> {
        let environments = self.environments.list_environments().await?;
        let mut sent = 0;
        for environment in environments {
            if self
                .events
                .send(Event::UpdateInProgressDeployment { environment })
                .await
                .is_err()
            {
                debug!("Event channel closed, stopping monitor pass");
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }
}
