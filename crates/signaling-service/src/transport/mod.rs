//! Client-facing transport.
//!
//! Clients speak JSON over a WebSocket at `/call`.

pub mod websocket;

use crate::handler::SignalingService;

use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use websocket::TransportState;

/// Build the signaling router.
///
/// Cancelling `shutdown` closes every open client connection.
pub fn signaling_router(service: Arc<SignalingService>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/call", get(websocket::signaling_handler))
        .with_state(TransportState { service, shutdown })
}
