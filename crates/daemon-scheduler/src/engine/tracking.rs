// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local record of instances the scheduler asked to deploy to.
//!
//! The cluster-state view lags behind the orchestrator, so a start that was
//! just dispatched is invisible for a while. The scheduler records when it
//! asked for each instance and trusts that request until the entry is older
//! than the tracking TTL. Nothing here is persisted: after a restart every
//! instance falls back to the authoritative orchestrator check.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

/// Instance ARN to the time a deployment was last dispatched to it.
#[derive(Debug, Default)]
pub struct TrackingInfo {
    entries: HashMap<String, Instant>,
}

impl TrackingInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatch to `instance_arn` at `now`.
    pub fn track(&mut self, instance_arn: &str, now: Instant) {
        self.entries.insert(instance_arn.to_string(), now);
    }

    /// Forget an instance. Returns whether it was tracked.
    pub fn untrack(&mut self, instance_arn: &str) -> bool {
        self.entries.remove(instance_arn).is_some()
    }

    pub fn tracked_at(&self, instance_arn: &str) -> Option<Instant> {
        self.entries.get(instance_arn).copied()
    }

    /// Whether the entry for `instance_arn` is older than `ttl`.
    /// Untracked instances are never expired.
    pub fn is_expired(&self, instance_arn: &str, ttl: Duration, now: Instant) -> bool {
        self.tracked_at(instance_arn)
            .is_some_and(|at| now.saturating_duration_since(at) > ttl)
    }

    /// Tracked instance ARNs, in no particular order.
    pub fn instances(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Drop entries whose instance is not in `usable`. Returns how many were dropped.
    pub fn retain_instances(&mut self, usable: &HashSet<&str>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|arn, _| usable.contains(arn.as_str()));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let ttl = Duration::from_secs(60);
        let mut tracking = TrackingInfo::new();
        tracking.track("i-1", Instant::now());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!tracking.is_expired("i-1", ttl, Instant::now()));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(tracking.is_expired("i-1", ttl, Instant::now()));

        // Re-tracking restarts the clock.
        tracking.track("i-1", Instant::now());
        assert!(!tracking.is_expired("i-1", ttl, Instant::now()));

        assert!(!tracking.is_expired("i-unknown", ttl, Instant::now()));
    }

    #[test]
    fn test_retain_and_untrack() {
        let now = Instant::now();
        let mut tracking = TrackingInfo::new();
        tracking.track("i-1", now);
        tracking.track("i-2", now);
        tracking.track("i-3", now);

        let usable: HashSet<&str> = ["i-1", "i-3"].into_iter().collect();
        assert_eq!(tracking.retain_instances(&usable), 1);
        assert!(tracking.tracked_at("i-2").is_none());

        assert!(tracking.untrack("i-1"));
        assert!(!tracking.untrack("i-1"));
        assert_eq!(tracking.instances().collect::<Vec<_>>(), vec!["i-3"]);
        assert_eq!(tracking.len(), 1);
        assert!(!tracking.is_empty());
    }
}
