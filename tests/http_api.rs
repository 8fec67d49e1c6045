mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use game_scheduler::{config::AppConfig, routes, state::AppState};
use serde_json::{Value, json};
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use tower::ServiceExt;
use uuid::Uuid;

use common::harness;

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn rfc3339(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap()
}

#[tokio::test]
async fn schedule_round_trip_over_http() {
    let h = harness().await;
    let app = routes::app(h.state.clone());
    let game_id = Uuid::new_v4();
    let start = OffsetDateTime::now_utc() + Duration::hours(2);
    let uri = format!("/games/{game_id}/schedule");

    let (status, summary) = call(
        &app,
        Method::PUT,
        &uri,
        Some(json!({
            "scheduled_at": rfc3339(start),
            "expected_duration_minutes": 90,
            "reminder_minutes": [60, 15]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["status"], "SCHEDULED");
    assert_eq!(summary["inserted"], 4);

    let (status, schedule) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let events = schedule["events"].as_array().unwrap();
    assert_eq!(events.len(), 4);
    assert!(events.iter().any(|event| event["kind"]
        == json!({"type": "reminder", "offset_minutes": 60})));

    let (status, _) = call(&app, Method::DELETE, &format!("/games/{game_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn invalid_scheduling_fields_are_rejected() {
    let h = harness().await;
    let app = routes::app(h.state.clone());
    let uri = format!("/games/{}/schedule", Uuid::new_v4());
    let start = rfc3339(OffsetDateTime::now_utc() + Duration::hours(1));

    let (status, _) = call(
        &app,
        Method::PUT,
        &uri,
        Some(json!({"scheduled_at": start, "reminder_minutes": [0]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::PUT,
        &uri,
        Some(json!({"scheduled_at": start, "expected_duration_minutes": 2000})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &app,
        Method::PUT,
        &uri,
        Some(json!({
            "scheduled_at": "9999-12-31T23:00:00Z",
            "expected_duration_minutes": 120
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("scheduled time"));

    let (status, _) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn join_notifications_over_http() {
    let h = harness().await;
    let app = routes::app(h.state.clone());
    let game_id = Uuid::new_v4();
    let start = rfc3339(OffsetDateTime::now_utc() + Duration::hours(1));
    call(
        &app,
        Method::PUT,
        &format!("/games/{game_id}/schedule"),
        Some(json!({"scheduled_at": start})),
    )
    .await;
    let joins = format!("/games/{game_id}/join-notifications");

    let (status, view) = call(
        &app,
        Method::POST,
        &joins,
        Some(json!({"participant_id": "discord:7"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(view["kind"]["type"], "join_notification");
    assert_eq!(view["applied"], false);

    let (status, _) = call(
        &app,
        Method::POST,
        &joins,
        Some(json!({"participant_id": "discord:7"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&app, Method::POST, &joins, Some(json!({"participant_id": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::DELETE, &format!("{joins}/discord:7"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::DELETE, &format!("{joins}/discord:7"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/games/{}/join-notifications", Uuid::new_v4()),
        Some(json!({"participant_id": "discord:7"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn degraded_mode_answers_service_unavailable() {
    let state = AppState::new(AppConfig::default());
    let app = routes::app(state);
    let start = rfc3339(OffsetDateTime::now_utc() + Duration::hours(1));

    let (status, body) = call(
        &app,
        Method::PUT,
        &format!("/games/{}/schedule", Uuid::new_v4()),
        Some(json!({"scheduled_at": start})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["message"].as_str().unwrap().contains("degraded"));

    let (status, health) = call(&app, Method::GET, "/healthcheck", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");

    let (status, daemon) = call(&app, Method::GET, "/daemon/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(daemon["degraded"], true);
    assert_eq!(daemon["pending"], Value::Null);
}

#[tokio::test]
async fn daemon_status_reports_the_backlog() {
    let h = harness().await;
    let app = routes::app(h.state.clone());
    let start = rfc3339(OffsetDateTime::now_utc() + Duration::minutes(10));
    call(
        &app,
        Method::PUT,
        &format!("/games/{}/schedule", Uuid::new_v4()),
        Some(json!({"scheduled_at": start, "reminder_minutes": [30]})),
    )
    .await;

    let (status, before) = call(&app, Method::GET, "/daemon/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(before["pending"], 2);
    assert_eq!(before["overdue"], 1);

    h.daemon.run_cycle(OffsetDateTime::now_utc()).await;

    let (_, after) = call(&app, Method::GET, "/daemon/status", None).await;
    assert_eq!(after["pending"], 1);
    assert_eq!(after["overdue"], 0);
    assert_eq!(after["counters"]["reminder"]["dispatched"], 1);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let h = harness().await;
    let app = routes::app(h.state.clone());

    let (status, doc) = call(&app, Method::GET, "/api-doc/openapi.json", None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/games/{id}/schedule"]["put"].is_object());
    assert!(doc["paths"]["/daemon/status"]["get"].is_object());
}
