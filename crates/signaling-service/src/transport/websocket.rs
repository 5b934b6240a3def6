//! WebSocket signaling endpoint.
//!
//! One task per socket reads inbound frames and dispatches them; the write
//! half is owned by the socket's `ConnectionActor`.

use crate::actors::{ConnectionActor, ConnectionHandle, SignalSink};
use crate::errors::SignalingError;
use crate::handler::SignalingService;
use crate::protocol::{ClientMessage, ServerMessage};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Shared state of the signaling route.
#[derive(Clone)]
pub struct TransportState {
    pub service: Arc<SignalingService>,
    /// Parent of every connection actor's token.
    pub shutdown: CancellationToken,
}

/// Write half of an upgraded socket.
struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl SignalSink for WsSink {
    async fn deliver(&mut self, message: &ServerMessage) -> Result<(), SignalingError> {
        let json = serde_json::to_string(message)
            .map_err(|e| SignalingError::Internal(format!("serialize {}: {e}", message.kind())))?;
        self.inner
            .send(Message::Text(json))
            .await
            .map_err(|e| SignalingError::ConnectionClosed(e.to_string()))
    }

    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: reason.to_string().into(),
        };
        let _ = self.inner.send(Message::Close(Some(frame))).await;
    }
}

/// `GET /call` upgrade handler.
pub async fn signaling_handler(
    ws: WebSocketUpgrade,
    State(state): State<TransportState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[instrument(
    skip_all,
    name = "signaling.transport.socket",
    fields(connection_id = tracing::field::Empty)
)]
async fn handle_socket(socket: WebSocket, state: TransportState) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let (writer, mut reader) = socket.split();
    let (connection, actor_task) = ConnectionActor::spawn(
        connection_id.clone(),
        WsSink { inner: writer },
        state.shutdown.child_token(),
    );

    info!(
        target: "signaling.transport",
        connection_id = %connection_id,
        "Client connected"
    );

    loop {
        let frame = tokio::select! {
            () = state.shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                dispatch_text(&state.service, &connection, &text).await;
            }
            Some(Ok(Message::Binary(_))) => {
                debug!(
                    target: "signaling.transport",
                    connection_id = %connection_id,
                    "Ignoring binary frame"
                );
            }
            Some(Ok(Message::Close(_))) | None => break,
            // Pings are answered by the socket itself.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(e)) => {
                warn!(
                    target: "signaling.transport",
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket read error"
                );
                break;
            }
        }
    }

    state.service.handle_disconnect(&connection_id).await;
    connection.cancel();
    let _ = actor_task.await;

    info!(
        target: "signaling.transport",
        connection_id = %connection_id,
        "Client disconnected"
    );
}

async fn dispatch_text(service: &SignalingService, connection: &ConnectionHandle, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => service.handle_message(connection, message).await,
        Err(e) => {
            // Frame contents may carry SDP; only the parse error is logged.
            warn!(
                target: "signaling.transport",
                connection_id = %connection.connection_id(),
                error = %e,
                "Discarding unparsable frame"
            );
        }
    }
}
