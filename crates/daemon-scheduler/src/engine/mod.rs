// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background machinery: the reconciliation scheduler, the in-progress
//! monitor and the dispatcher that carries out their requests.

pub mod dispatcher;
pub mod events;
pub mod monitor;
pub mod scheduler;
pub mod tracking;

pub use dispatcher::Dispatcher;
pub use events::Event;
pub use monitor::{Monitor, MonitorConfig};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use tracking::TrackingInfo;
