pub mod connection;
pub mod rooms;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};

pub use rooms::{DEFAULT_ROOM_CAPACITY, JoinError, RoomRegistry};

/// Relay routes: `/ws` for participants, `/health` for liveness checks.
pub fn router(registry: RoomRegistry) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(registry)
}

async fn ws_upgrade(
    State(registry): State<RoomRegistry>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, registry))
}

async fn health() -> &'static str {
    "ok"
}
