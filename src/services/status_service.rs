use time::OffsetDateTime;
use tracing::warn;

use crate::{dto::daemon::DaemonStatusResponse, state::SharedState};

/// Daemon telemetry plus backlog counts, when the store answers.
pub async fn daemon_status(state: &SharedState) -> DaemonStatusResponse {
    let snapshot = state.telemetry().snapshot().await;

    let counts = match state.require_schedule_store().await {
        Ok(store) => match store.pending_counts(OffsetDateTime::now_utc()).await {
            Ok(counts) => Some(counts),
            Err(err) => {
                warn!(error = %err, "failed to count pending rows");
                None
            }
        },
        Err(_) => None,
    };

    DaemonStatusResponse::new(snapshot, state.is_degraded(), counts)
}
