use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use tracing::trace;

use crate::services::transport::{ChannelId, TransportEvent};
use crate::state::app::AppState;

/// Callbacks from the change-feed service, one path per channel.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/:channel", post(handle_feed_event))
        .with_state(state)
}

//
// ─────────────────────────────────────────────────────────────
// POST /feed/{channel}
// Lifecycle signal or row change for one channel. Always accepted;
// events for channels that are gone are ignored.
// ─────────────────────────────────────────────────────────────
//
async fn handle_feed_event(
    Path(channel): Path<ChannelId>,
    State(state): State<AppState>,
    Json(event): Json<TransportEvent>,
) -> StatusCode {
    trace!("Feed event on channel {}: {:?}", channel, event);
    state.realtime.handle_transport_event(channel, event);
    StatusCode::ACCEPTED
}
