use axum::{Json, Router, extract::State, routing::get};

use crate::{dto::daemon::DaemonStatusResponse, services::status_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/daemon/status",
    tag = "daemon",
    responses((status = 200, description = "Daemon phase, counters and backlog", body = DaemonStatusResponse))
)]
/// Report the polling daemon's phase and delivery counters.
pub async fn daemon_status(State(state): State<SharedState>) -> Json<DaemonStatusResponse> {
    Json(status_service::daemon_status(&state).await)
}

/// Daemon introspection routes.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/daemon/status", get(daemon_status))
}
