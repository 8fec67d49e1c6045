use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post, put},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::schedule::{
        GameScheduleView, JoinNotificationRequest, ScheduleGameRequest, ScheduleSummary,
        ScheduledEventView,
    },
    error::AppError,
    services::schedule_service,
    state::SharedState,
};

/// Schedule hooks for the game CRUD layer.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/games/{id}/schedule", put(put_schedule).get(get_schedule))
        .route("/games/{id}", delete(delete_game))
        .route("/games/{id}/join-notifications", post(join_game))
        .route(
            "/games/{id}/join-notifications/{participant_id}",
            delete(cancel_join),
        )
}

/// Create or update a game's scheduling fields and recompute its schedule.
#[utoipa::path(
    put,
    path = "/games/{id}/schedule",
    tag = "schedule",
    params(("id" = String, Path, description = "Identifier of the game")),
    request_body = ScheduleGameRequest,
    responses(
        (status = 200, description = "Schedule recomputed", body = ScheduleSummary),
        (status = 400, description = "Invalid scheduling fields"),
        (status = 503, description = "Storage unavailable")
    )
)]
/// Create or recalculate a game's schedule.
pub async fn put_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<ScheduleGameRequest>>,
) -> Result<Json<ScheduleSummary>, AppError> {
    let summary = schedule_service::upsert_game_schedule(&state, id, payload).await?;
    Ok(Json(summary))
}

/// List every scheduled row of a game, pending and applied.
#[utoipa::path(
    get,
    path = "/games/{id}/schedule",
    tag = "schedule",
    params(("id" = String, Path, description = "Identifier of the game")),
    responses(
        (status = 200, description = "Game schedule", body = GameScheduleView),
        (status = 404, description = "Unknown game")
    )
)]
/// List a game's rows.
pub async fn get_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<GameScheduleView>, AppError> {
    Ok(Json(schedule_service::list_schedule(&state, id).await?))
}

/// Forget a game together with all of its scheduled rows.
#[utoipa::path(
    delete,
    path = "/games/{id}",
    tag = "schedule",
    params(("id" = String, Path, description = "Identifier of the game to delete")),
    responses(
        (status = 204, description = "Game deleted"),
        (status = 404, description = "Unknown game")
    )
)]
/// Delete a game and its rows.
pub async fn delete_game(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    schedule_service::on_game_deleted(&state, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Record a participant join and schedule the host notification.
#[utoipa::path(
    post,
    path = "/games/{id}/join-notifications",
    tag = "schedule",
    params(("id" = String, Path, description = "Identifier of the game")),
    request_body = JoinNotificationRequest,
    responses(
        (status = 201, description = "Notification scheduled", body = ScheduledEventView),
        (status = 404, description = "Unknown game"),
        (status = 409, description = "Participant already has a notification")
    )
)]
/// Schedule a join notification.
pub async fn join_game(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<JoinNotificationRequest>>,
) -> Result<(StatusCode, Json<ScheduledEventView>), AppError> {
    let view =
        schedule_service::schedule_join_notification(&state, id, payload.participant_id).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// Drop a participant's pending join notification.
#[utoipa::path(
    delete,
    path = "/games/{id}/join-notifications/{participant_id}",
    tag = "schedule",
    params(
        ("id" = String, Path, description = "Identifier of the game"),
        ("participant_id" = String, Path, description = "Participant whose notification is dropped")
    ),
    responses(
        (status = 204, description = "Notification cancelled"),
        (status = 404, description = "No pending notification")
    )
)]
/// Cancel a pending join notification.
pub async fn cancel_join(
    State(state): State<SharedState>,
    Path((id, participant_id)): Path<(Uuid, String)>,
) -> Result<StatusCode, AppError> {
    schedule_service::cancel_join_notification(&state, id, participant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
