/// Polling daemon delivering due scheduled events.
pub mod daemon;
/// Delivery transports for due events.
pub mod dispatcher;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Schedule computation from a game's scheduling fields.
pub mod recalculator;
/// Lifecycle hooks keeping the schedule in sync with games.
pub mod schedule_service;
/// Server-Sent Events streaming of deliveries.
pub mod sse_service;
/// Daemon status reporting.
pub mod status_service;
/// Storage connection supervisor toggling degraded mode.
pub mod storage_supervisor;
/// Bridge from the database wake channel to the in-process hub.
pub mod wake_listener;
