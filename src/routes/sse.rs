use std::convert::Infallible;

use axum::{Router, extract::State, response::sse::Sse, routing::get};
use futures::Stream;
use tracing::info;

use crate::{services::sse_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/deliveries/stream",
    tag = "sse",
    responses((status = 200, description = "Delivered events, one SSE event per delivery", content_type = "text/event-stream", body = String))
)]
/// Stream deliveries to connected bots when the broadcast transport is used.
pub async fn deliveries_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    let (receiver, handshake) = sse_service::subscribe_deliveries(&state);
    info!("new deliveries SSE connection");
    sse_service::to_sse_stream(receiver, handshake)
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/deliveries/stream", get(deliveries_stream))
}
