use axum::Router;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::routes::{feed_routes, realtime_routes, system_routes};
use crate::state::app::AppState;

/// Build the complete Axum application:
/// - /realtime (webhook subscribers: subscribe, unsubscribe, status, retry)
/// - /feed     (channel callbacks from the change-feed service)
/// - /system   (alive, version, aggregated status, manual reconnect)
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .nest("/realtime", realtime_routes::routes(state.clone()))
        .nest("/feed", feed_routes::routes(state.clone()))
        .nest("/system", system_routes::routes(state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
