use serde::Serialize;
use utoipa::ToSchema;

use crate::state::DaemonPhase;

/// Simple health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Current phase of the polling daemon.
    pub daemon: DaemonPhase,
}

impl HealthResponse {
    /// Create a health response indicating the system is operational.
    pub fn ok(daemon: DaemonPhase) -> Self {
        Self {
            status: "ok".to_string(),
            daemon,
        }
    }

    /// Create a health response indicating the system is in degraded mode.
    pub fn degraded(daemon: DaemonPhase) -> Self {
        Self {
            status: "degraded".to_string(),
            daemon,
        }
    }
}
