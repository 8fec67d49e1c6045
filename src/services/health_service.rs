use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Ping the store when one is installed and report the degraded flag.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.schedule_store().await {
        Some(store) => {
            if let Err(err) = store.health_check().await {
                warn!(error = %err, "storage health check failed");
            }
        }
        None => warn!("storage unavailable (degraded mode)"),
    }

    let daemon = state.telemetry().snapshot().await.phase;
    if state.is_degraded() {
        HealthResponse::degraded(daemon)
    } else {
        HealthResponse::ok(daemon)
    }
}
