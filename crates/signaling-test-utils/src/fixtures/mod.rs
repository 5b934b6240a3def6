//! Test fixtures for signaling tests.
//!
//! Provides:
//! - [`TestClient`]: a connection backed by an in-memory channel, driven
//!   through a real `ConnectionActor`
//! - Service construction over a [`MockMediaEngine`]
//! - Sample offers and candidates

use crate::mock_engine::MockMediaEngine;

use signaling_service::actors::{ConnectionActor, ConnectionHandle};
use signaling_service::handler::{ServiceSettings, SignalingService};
use signaling_service::pairing::PairingStrategy;
use signaling_service::protocol::{
    CallDecision, ClientMessage, IceCandidate, ResponseStatus, ServerMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long `expect_message` waits before failing the test.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Service in explicit-call mode over `engine`.
#[must_use]
pub fn call_service(engine: &Arc<MockMediaEngine>) -> Arc<SignalingService> {
    service_with(engine, ServiceSettings::default())
}

/// Service in room auto-pair mode over `engine`.
#[must_use]
pub fn room_service(engine: &Arc<MockMediaEngine>, settle_window: Duration) -> Arc<SignalingService> {
    service_with(
        engine,
        ServiceSettings {
            pairing_strategy: PairingStrategy::RoomAutoPair,
            room_settle_window: settle_window,
            ..ServiceSettings::default()
        },
    )
}

/// Service over `engine` with explicit settings.
#[must_use]
pub fn service_with(engine: &Arc<MockMediaEngine>, settings: ServiceSettings) -> Arc<SignalingService> {
    SignalingService::new(engine.clone(), settings, CancellationToken::new())
}

/// Deterministic offer for a named client.
#[must_use]
pub fn sample_offer(name: &str) -> String {
    format!("v=0 offer-from-{name}")
}

/// Deterministic candidate; `n` distinguishes candidates of one client.
#[must_use]
pub fn sample_candidate(n: u32) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{n} 1 UDP 2122252543 192.0.2.{n} 5000{n} typ host"),
        "0",
        0,
    )
}

/// Drive a full explicit call from `caller` to `callee`, both already registered.
///
/// Asserts that the caller receives `callResponse{accepted}` and the callee
/// `startCommunication`, each with the mock engine's answer for its offer.
pub async fn establish_call(
    service: &SignalingService,
    caller: &mut TestClient,
    caller_name: &str,
    callee: &mut TestClient,
    callee_name: &str,
) {
    caller
        .send(
            service,
            ClientMessage::Call {
                to: callee_name.to_string(),
                from: None,
                sdp_offer: sample_offer(caller_name),
            },
        )
        .await;
    assert_eq!(
        callee.expect_message().await,
        ServerMessage::IncomingCall {
            from: caller_name.to_string()
        }
    );

    callee
        .send(
            service,
            ClientMessage::IncomingCallResponse {
                from: caller_name.to_string(),
                call_response: CallDecision::Accept,
                sdp_offer: Some(sample_offer(callee_name)),
            },
        )
        .await;

    assert_eq!(
        caller.expect_signal().await,
        ServerMessage::call_accepted(MockMediaEngine::answer_for(&sample_offer(caller_name)))
    );
    assert_eq!(
        callee.expect_signal().await,
        ServerMessage::StartCommunication {
            sdp_answer: MockMediaEngine::answer_for(&sample_offer(callee_name)),
        }
    );
}

/// A client connection whose outbound messages land in a channel.
pub struct TestClient {
    connection: ConnectionHandle,
    outbound: mpsc::UnboundedReceiver<ServerMessage>,
    actor_task: JoinHandle<()>,
}

impl TestClient {
    /// Open a connection with the given id.
    #[must_use]
    pub fn connect(connection_id: impl Into<String>) -> Self {
        let (tx, outbound) = mpsc::unbounded_channel();
        let (connection, actor_task) =
            ConnectionActor::spawn(connection_id.into(), tx, CancellationToken::new());
        Self {
            connection,
            outbound,
            actor_task,
        }
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    /// Deliver an inbound message to the service as this client.
    pub async fn send(&self, service: &SignalingService, message: ClientMessage) {
        service.handle_message(&self.connection, message).await;
    }

    /// Register `name` and assert it was accepted.
    pub async fn register(&mut self, service: &SignalingService, name: &str) {
        self.register_with(service, name, None, None).await;
    }

    /// Register `name` in `room` with a staged offer and assert it was accepted.
    pub async fn register_in_room(&mut self, service: &SignalingService, name: &str, room: &str) {
        self.register_with(service, name, Some(room), Some(sample_offer(name)))
            .await;
    }

    async fn register_with(
        &mut self,
        service: &SignalingService,
        name: &str,
        room: Option<&str>,
        sdp_offer: Option<String>,
    ) {
        self.send(
            service,
            ClientMessage::Register {
                name: name.to_string(),
                room: room.map(str::to_string),
                sdp_offer,
            },
        )
        .await;
        match self.expect_message().await {
            ServerMessage::RegisterResponse {
                response: ResponseStatus::Accepted,
                ..
            } => {}
            other => panic!("registration of {name} not accepted: {other:?}"),
        }
    }

    /// Close the transport as the transport layer would.
    pub async fn disconnect(self, service: &SignalingService) {
        service.handle_disconnect(self.connection.connection_id()).await;
        self.connection.cancel();
        let _ = self.actor_task.await;
    }

    /// Next outbound message, or `None` after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ServerMessage> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next outbound message; fails the test if none arrives.
    pub async fn expect_message(&mut self) -> ServerMessage {
        self.expect_message_within(DEFAULT_RECV_TIMEOUT).await
    }

    /// Next outbound message; fails the test if none arrives within `timeout`.
    pub async fn expect_message_within(&mut self, timeout: Duration) -> ServerMessage {
        match self.recv_timeout(timeout).await {
            Some(message) => message,
            None => panic!("{}: no message within {timeout:?}", self.connection_id()),
        }
    }

    /// Skip `iceCandidate` messages and return the next other message.
    pub async fn expect_signal(&mut self) -> ServerMessage {
        self.expect_signal_within(DEFAULT_RECV_TIMEOUT).await
    }

    /// Like [`Self::expect_signal`] with an explicit deadline per message.
    pub async fn expect_signal_within(&mut self, timeout: Duration) -> ServerMessage {
        loop {
            match self.expect_message_within(timeout).await {
                ServerMessage::IceCandidate { .. } => {}
                other => return other,
            }
        }
    }

    /// Fail the test if any non-candidate message arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv_timeout(remaining).await {
                None => return,
                Some(ServerMessage::IceCandidate { .. }) => {}
                Some(other) => panic!("{}: unexpected message {other:?}", self.connection_id()),
            }
        }
    }
}
