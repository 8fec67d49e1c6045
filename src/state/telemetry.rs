use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use crate::state::daemon_phase::{DaemonPhase, WakeSource};

/// Per-kind delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct KindCounters {
    /// Rows dispatched and committed.
    pub dispatched: u64,
    /// Dispatch or commit failures; the row stays pending.
    pub failed: u64,
    /// Rows committed without dispatch (stale status transitions).
    pub skipped: u64,
}

/// Outcome recorded for one claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Dispatched,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default)]
struct CycleClock {
    phase: Option<DaemonPhase>,
    cycles: u64,
    last_wake: Option<WakeSource>,
    last_started_at: Option<OffsetDateTime>,
    last_finished_at: Option<OffsetDateTime>,
    last_due: usize,
}

/// Read-only copy of the telemetry for the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Lifecycle phase.
    pub phase: DaemonPhase,
    /// Cycles started.
    pub cycles: u64,
    /// What woke the last cycle.
    pub last_wake: Option<WakeSource>,
    /// Start of the last cycle.
    pub last_cycle_started_at: Option<OffsetDateTime>,
    /// End of the last cycle.
    pub last_cycle_finished_at: Option<OffsetDateTime>,
    /// Rows returned by the last due-query.
    pub last_cycle_due: usize,
    /// Per-kind delivery counters.
    pub counters: BTreeMap<String, KindCounters>,
}

/// Counters written by the daemon and read by the HTTP API.
#[derive(Default)]
pub struct DaemonTelemetry {
    counters: DashMap<&'static str, KindCounters>,
    clock: RwLock<CycleClock>,
}

impl DaemonTelemetry {
    /// Zeroed counters, daemon idle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one row outcome under its kind label.
    pub fn record(&self, kind: &'static str, outcome: DeliveryOutcome) {
        let mut counters = self.counters.entry(kind).or_default();
        match outcome {
            DeliveryOutcome::Dispatched => counters.dispatched += 1,
            DeliveryOutcome::Failed => counters.failed += 1,
            DeliveryOutcome::Skipped => counters.skipped += 1,
        }
    }

    /// Record the daemon's phase.
    pub async fn set_phase(&self, phase: DaemonPhase) {
        self.clock.write().await.phase = Some(phase);
    }

    /// Record the start of a cycle.
    pub async fn cycle_started(&self, at: OffsetDateTime, cycles: u64, wake: WakeSource) {
        let mut clock = self.clock.write().await;
        clock.cycles = cycles;
        clock.last_wake = Some(wake);
        clock.last_started_at = Some(at);
    }

    /// Record the end of a cycle and its due count.
    pub async fn cycle_finished(&self, at: OffsetDateTime, due: usize) {
        let mut clock = self.clock.write().await;
        clock.last_finished_at = Some(at);
        clock.last_due = due;
    }

    /// Copy of everything, for the status endpoint.
    pub async fn snapshot(&self) -> TelemetrySnapshot {
        let clock = self.clock.read().await.clone();
        let counters = self
            .counters
            .iter()
            .map(|entry| ((*entry.key()).to_owned(), *entry.value()))
            .collect();

        TelemetrySnapshot {
            // No daemon task reported yet.
            phase: clock.phase.unwrap_or(DaemonPhase::Stopped),
            cycles: clock.cycles,
            last_wake: clock.last_wake,
            last_cycle_started_at: clock.last_started_at,
            last_cycle_finished_at: clock.last_finished_at,
            last_cycle_due: clock.last_due,
            counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[tokio::test]
    async fn counters_are_split_per_kind() {
        let telemetry = DaemonTelemetry::new();
        telemetry.record("reminder", DeliveryOutcome::Dispatched);
        telemetry.record("reminder", DeliveryOutcome::Dispatched);
        telemetry.record("reminder", DeliveryOutcome::Failed);
        telemetry.record("status_transition", DeliveryOutcome::Skipped);

        let snapshot = telemetry.snapshot().await;
        assert_eq!(
            snapshot.counters["reminder"],
            KindCounters {
                dispatched: 2,
                failed: 1,
                skipped: 0
            }
        );
        assert_eq!(snapshot.counters["status_transition"].skipped, 1);
    }

    #[tokio::test]
    async fn snapshot_reports_stopped_until_the_daemon_checks_in() {
        let telemetry = DaemonTelemetry::new();
        assert_eq!(telemetry.snapshot().await.phase, DaemonPhase::Stopped);

        telemetry.set_phase(DaemonPhase::Polling).await;
        telemetry
            .cycle_started(datetime!(2026-10-19 12:00 UTC), 1, WakeSource::Startup)
            .await;
        telemetry
            .cycle_finished(datetime!(2026-10-19 12:00:01 UTC), 3)
            .await;

        let snapshot = telemetry.snapshot().await;
        assert_eq!(snapshot.phase, DaemonPhase::Polling);
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.last_wake, Some(WakeSource::Startup));
        assert_eq!(snapshot.last_cycle_due, 3);
    }
}
