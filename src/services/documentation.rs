use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the game scheduler.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::schedule::put_schedule,
        crate::routes::schedule::get_schedule,
        crate::routes::schedule::delete_game,
        crate::routes::schedule::join_game,
        crate::routes::schedule::cancel_join,
        crate::routes::daemon::daemon_status,
        crate::routes::sse::deliveries_stream,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::schedule::ScheduleGameRequest,
            crate::dto::schedule::JoinNotificationRequest,
            crate::dto::schedule::ScheduledEventView,
            crate::dto::schedule::ScheduleSummary,
            crate::dto::schedule::GameScheduleView,
            crate::dto::daemon::DaemonStatusResponse,
            crate::dto::delivery::Delivery,
            crate::dto::sse::Handshake,
            crate::dao::models::GameStatus,
            crate::dao::models::EventKind,
            crate::state::DaemonPhase,
            crate::state::WakeSource,
            crate::state::KindCounters,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "schedule", description = "Schedule hooks called by the game CRUD layer"),
        (name = "daemon", description = "Polling daemon introspection"),
        (name = "sse", description = "Server-sent events streams"),
    )
)]
/// OpenAPI document of the HTTP surface.
pub struct ApiDoc;
