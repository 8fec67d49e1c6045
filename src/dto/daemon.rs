use std::collections::BTreeMap;

use serde::Serialize;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::{
    dao::models::PendingCounts,
    state::{DaemonPhase, KindCounters, TelemetrySnapshot, WakeSource},
};

/// Snapshot of the polling daemon and of the pending backlog.
#[derive(Debug, Serialize, ToSchema)]
pub struct DaemonStatusResponse {
    /// Lifecycle phase.
    pub phase: DaemonPhase,
    /// No usable store.
    pub degraded: bool,
    /// Cycles started since the process booted.
    pub cycles: u64,
    /// What woke the last cycle.
    pub last_wake: Option<WakeSource>,
    /// Start of the last cycle.
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub last_cycle_started_at: Option<OffsetDateTime>,
    /// End of the last cycle.
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub last_cycle_finished_at: Option<OffsetDateTime>,
    /// Rows returned by the last due-query.
    pub last_cycle_due: usize,
    /// Pending rows; absent while the store is unreachable.
    pub pending: Option<u64>,
    /// Pending rows already past their due time.
    pub overdue: Option<u64>,
    /// Delivery counters keyed by event kind.
    pub counters: BTreeMap<String, KindCounters>,
}

impl DaemonStatusResponse {
    /// Combine telemetry with the backlog counts.
    pub fn new(snapshot: TelemetrySnapshot, degraded: bool, counts: Option<PendingCounts>) -> Self {
        Self {
            phase: snapshot.phase,
            degraded,
            cycles: snapshot.cycles,
            last_wake: snapshot.last_wake,
            last_cycle_started_at: snapshot.last_cycle_started_at,
            last_cycle_finished_at: snapshot.last_cycle_finished_at,
            last_cycle_due: snapshot.last_cycle_due,
            pending: counts.map(|counts| counts.pending),
            overdue: counts.map(|counts| counts.overdue),
            counters: snapshot.counters,
        }
    }
}
