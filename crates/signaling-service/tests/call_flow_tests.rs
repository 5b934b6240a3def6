//! Explicit-call signaling flows against a mock media engine.
//!
//! Covers:
//! - Call validation (unknown target, self call, busy, unregistered)
//! - Accept and decline
//! - Candidate buffering before endpoint binding
//! - Stop and transport disconnect teardown
//! - Chat relay

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use signaling_service::handler::ServiceSettings;
use signaling_service::protocol::{CallDecision, ClientMessage, ResponseStatus, ServerMessage};
use signaling_service::session::PeerLink;
use signaling_test_utils::*;

const QUIET: Duration = Duration::from_millis(100);

fn call(to: &str, from_name: &str) -> ClientMessage {
    ClientMessage::Call {
        to: to.to_string(),
        from: None,
        sdp_offer: sample_offer(from_name),
    }
}

fn rejected(reason: &str) -> ServerMessage {
    ServerMessage::call_rejected(reason)
}

// ============================================================================
// Call validation
// ============================================================================

#[tokio::test]
async fn test_call_to_unknown_target_is_rejected() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    alice.register(&service, "alice").await;

    alice.send(&service, call("carol", "alice")).await;

    assert_eq!(
        alice.expect_message().await,
        rejected("user 'carol' is not registered")
    );
    assert_eq!(engine.pipelines_created(), 0);
}

#[tokio::test]
async fn test_self_call_is_rejected() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    alice.register(&service, "alice").await;

    alice.send(&service, call("alice", "alice")).await;

    assert_eq!(alice.expect_message().await, rejected("cannot call yourself"));
}

#[tokio::test]
async fn test_call_from_unregistered_connection_is_rejected() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut bob = TestClient::connect("conn-bob");
    bob.register(&service, "bob").await;
    let mut stranger = TestClient::connect("conn-stranger");

    stranger.send(&service, call("bob", "stranger")).await;

    assert_eq!(
        stranger.expect_message().await,
        rejected("connection is not registered")
    );
    bob.expect_silence(QUIET).await;
}

#[tokio::test]
async fn test_call_to_ringing_peer_is_busy() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    let mut carol = TestClient::connect("conn-carol");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;
    carol.register(&service, "carol").await;

    alice.send(&service, call("bob", "alice")).await;
    assert!(matches!(bob.expect_message().await, ServerMessage::IncomingCall { .. }));

    carol.send(&service, call("bob", "carol")).await;

    assert_eq!(carol.expect_message().await, rejected("user 'bob' is busy"));
    bob.expect_silence(QUIET).await;
}

#[tokio::test]
async fn test_response_without_pending_call_is_rejected() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;

    bob.send(
        &service,
        ClientMessage::IncomingCallResponse {
            from: "alice".to_string(),
            call_response: CallDecision::Accept,
            sdp_offer: Some(sample_offer("bob")),
        },
    )
    .await;

    assert_eq!(
        bob.expect_message().await,
        rejected("no pending call from 'alice'")
    );
    alice.expect_silence(QUIET).await;
    assert_eq!(engine.pipelines_created(), 0);
}

// ============================================================================
// Accept / decline
// ============================================================================

#[tokio::test]
async fn test_accepted_call_establishes_pair() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;

    establish_call(&service, &mut alice, "alice", &mut bob, "bob").await;

    let alice_record = service.pipelines().get("conn-alice").await.unwrap();
    let bob_record = service.pipelines().get("conn-bob").await.unwrap();
    assert_eq!(alice_record.pipeline, bob_record.pipeline);
    assert_eq!(engine.pipelines_created(), 1);
    assert!(engine.is_subscribed(alice_record.pipeline.caller.id()));
    assert!(engine.is_subscribed(alice_record.pipeline.callee.id()));
}

#[tokio::test]
async fn test_declined_call_creates_no_pipeline() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;

    alice.send(&service, call("bob", "alice")).await;
    assert_eq!(
        bob.expect_message().await,
        ServerMessage::IncomingCall {
            from: "alice".to_string()
        }
    );

    bob.send(
        &service,
        ClientMessage::IncomingCallResponse {
            from: "alice".to_string(),
            call_response: CallDecision::Decline,
            sdp_offer: None,
        },
    )
    .await;

    assert_eq!(
        alice.expect_message().await,
        rejected("user 'bob' declined the call")
    );
    assert_eq!(engine.pipelines_created(), 0);
    assert!(service.pipelines().is_empty().await);

    // Both are free again.
    let alice_session = service.registry().lookup_by_name("alice").await.unwrap();
    let bob_session = service.registry().lookup_by_name("bob").await.unwrap();
    assert!(alice_session.is_unmatched().await);
    assert!(bob_session.is_unmatched().await);
}

#[tokio::test]
async fn test_accept_after_caller_left_stops_callee() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;

    alice.send(&service, call("bob", "alice")).await;
    assert!(matches!(bob.expect_message().await, ServerMessage::IncomingCall { .. }));

    alice.disconnect(&service).await;
    assert_eq!(bob.expect_message().await, ServerMessage::StopCommunication);

    // The ringing call is gone, so the late answer has nothing to accept.
    bob.send(
        &service,
        ClientMessage::IncomingCallResponse {
            from: "alice".to_string(),
            call_response: CallDecision::Accept,
            sdp_offer: Some(sample_offer("bob")),
        },
    )
    .await;
    assert!(matches!(
        bob.expect_message().await,
        ServerMessage::CallResponse {
            response: ResponseStatus::Rejected,
            ..
        }
    ));
    assert_eq!(engine.pipelines_created(), 0);
}

fn answer(from: &str, decision: CallDecision, name: &str) -> ClientMessage {
    ClientMessage::IncomingCallResponse {
        from: from.to_string(),
        call_response: decision,
        sdp_offer: Some(sample_offer(name)),
    }
}

/// The established alice/bob pair is still mapped, bound and forwarding.
async fn assert_pair_intact(service: &signaling_service::handler::SignalingService, engine: &MockMediaEngine) {
    assert_eq!(service.pipelines().len().await, 2);
    let alice = service.registry().lookup_by_name("alice").await.unwrap();
    let bob = service.registry().lookup_by_name("bob").await.unwrap();
    assert_eq!(alice.peer().await, Some(PeerLink::CallingTo("bob".to_string())));
    assert_eq!(bob.peer().await, Some(PeerLink::CallingFrom("alice".to_string())));
    assert_eq!(alice.endpoint().await.unwrap().id(), "pipeline-1/caller");
    assert_eq!(bob.endpoint().await.unwrap().id(), "pipeline-1/callee");
    assert_eq!(engine.pipelines_created(), 1);
    assert!(engine.released().is_empty());
}

#[tokio::test]
async fn test_repeated_accept_leaves_established_pair_intact() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;
    establish_call(&service, &mut alice, "alice", &mut bob, "bob").await;

    bob.send(&service, answer("alice", CallDecision::Accept, "bob")).await;

    assert_eq!(bob.expect_signal().await, rejected("no pending call from 'alice'"));
    alice.expect_silence(QUIET).await;
    assert_pair_intact(&service, &engine).await;

    // Candidates still go straight to the bound endpoint.
    alice
        .send(
            &service,
            ClientMessage::OnIceCandidate {
                candidate: sample_candidate(1),
            },
        )
        .await;
    assert_eq!(engine.candidates_for("pipeline-1/caller"), vec![sample_candidate(1)]);
}

#[tokio::test]
async fn test_decline_after_accept_is_rejected() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;
    establish_call(&service, &mut alice, "alice", &mut bob, "bob").await;

    bob.send(&service, answer("alice", CallDecision::Decline, "bob")).await;

    assert_eq!(bob.expect_signal().await, rejected("no pending call from 'alice'"));
    alice.expect_silence(QUIET).await;
    assert_pair_intact(&service, &engine).await;
}

// ============================================================================
// Candidate buffering
// ============================================================================

#[tokio::test]
async fn test_candidates_before_binding_are_flushed_in_order() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;

    alice.send(&service, call("bob", "alice")).await;
    assert!(matches!(bob.expect_message().await, ServerMessage::IncomingCall { .. }));

    for n in 1..=3 {
        alice
            .send(
                &service,
                ClientMessage::OnIceCandidate {
                    candidate: sample_candidate(n),
                },
            )
            .await;
    }
    let alice_session = service.registry().lookup_by_name("alice").await.unwrap();
    assert_eq!(alice_session.buffered_candidates().await, 3);

    bob.send(
        &service,
        ClientMessage::IncomingCallResponse {
            from: "alice".to_string(),
            call_response: CallDecision::Accept,
            sdp_offer: Some(sample_offer("bob")),
        },
    )
    .await;
    assert!(matches!(
        alice.expect_signal().await,
        ServerMessage::CallResponse {
            response: ResponseStatus::Accepted,
            ..
        }
    ));

    // Arrives after binding: forwarded directly, after the buffered ones.
    alice
        .send(
            &service,
            ClientMessage::OnIceCandidate {
                candidate: sample_candidate(4),
            },
        )
        .await;

    let record = service.pipelines().get("conn-alice").await.unwrap();
    let forwarded = engine.candidates_for(record.pipeline.caller.id());
    assert_eq!(
        forwarded,
        (1..=4).map(sample_candidate).collect::<Vec<_>>()
    );
    assert_eq!(alice_session.buffered_candidates().await, 0);
    assert!(engine.candidates_for(record.pipeline.callee.id()).is_empty());
}

#[tokio::test]
async fn test_engine_candidates_go_to_owning_session() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;
    establish_call(&service, &mut alice, "alice", &mut bob, "bob").await;

    let record = service.pipelines().get("conn-bob").await.unwrap();
    assert!(engine.emit_local_candidate(record.pipeline.callee.id(), sample_candidate(9)));

    assert_eq!(
        bob.expect_message().await,
        ServerMessage::IceCandidate {
            candidate: sample_candidate(9)
        }
    );
    alice.expect_silence(QUIET).await;
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_stop_tears_down_both_sides_once() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;
    establish_call(&service, &mut alice, "alice", &mut bob, "bob").await;

    alice.send(&service, ClientMessage::Stop).await;
    assert_eq!(bob.expect_signal().await, ServerMessage::StopCommunication);

    // Second stop from either side is a no-op.
    alice.send(&service, ClientMessage::Stop).await;
    bob.send(&service, ClientMessage::Stop).await;

    assert_eq!(engine.released().len(), 1);
    assert!(service.pipelines().is_empty().await);
    alice.expect_silence(QUIET).await;
    bob.expect_silence(QUIET).await;

    // Both are registered and can call again.
    assert_eq!(service.registry().len().await, 2);
    establish_call(&service, &mut bob, "bob", &mut alice, "alice").await;
    assert_eq!(engine.pipelines_created(), 2);
}

#[tokio::test]
async fn test_stop_without_pair_is_noop() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    alice.register(&service, "alice").await;

    alice.send(&service, ClientMessage::Stop).await;

    alice.expect_silence(QUIET).await;
    assert!(engine.released().is_empty());
}

#[tokio::test]
async fn test_disconnect_mid_call_stops_peer_and_unregisters() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;
    establish_call(&service, &mut alice, "alice", &mut bob, "bob").await;

    alice.disconnect(&service).await;

    assert_eq!(bob.expect_signal().await, ServerMessage::StopCommunication);
    assert!(service.registry().lookup_by_name("alice").await.is_none());
    assert!(service.registry().lookup_by_connection("conn-alice").await.is_none());
    assert!(!service.pipelines().contains("conn-alice").await);
    assert!(!service.pipelines().contains("conn-bob").await);
    assert_eq!(engine.released().len(), 1);

    // Stop after the disconnect already tore the pair down.
    bob.send(&service, ClientMessage::Stop).await;
    bob.expect_silence(QUIET).await;
    assert_eq!(engine.released().len(), 1);
}

#[tokio::test]
async fn test_disconnect_frees_name() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice-1");
    alice.register(&service, "alice").await;

    alice.disconnect(&service).await;

    let mut again = TestClient::connect("conn-alice-2");
    again.register(&service, "alice").await;
    assert_eq!(service.registry().len().await, 1);
}

// ============================================================================
// Chat
// ============================================================================

#[tokio::test]
async fn test_chat_relayed_to_peer_unmodified() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;
    establish_call(&service, &mut alice, "alice", &mut bob, "bob").await;

    let chat = ClientMessage::ChatMessage {
        body: "  hi <b>bob</b>  ".to_string(),
        display_name: Some("Alice".to_string()),
    };
    alice.send(&service, chat).await;

    assert_eq!(
        bob.expect_signal().await,
        ServerMessage::ChatMessage {
            body: "  hi <b>bob</b>  ".to_string(),
            display_name: Some("Alice".to_string()),
        }
    );
}

#[tokio::test]
async fn test_chat_dropped_when_disabled() {
    let engine = MockMediaEngine::healthy();
    let service = service_with(
        &engine,
        ServiceSettings {
            chat_enabled: false,
            ..ServiceSettings::default()
        },
    );
    let mut alice = TestClient::connect("conn-alice");
    let mut bob = TestClient::connect("conn-bob");
    alice.register(&service, "alice").await;
    bob.register(&service, "bob").await;
    establish_call(&service, &mut alice, "alice", &mut bob, "bob").await;

    alice
        .send(
            &service,
            ClientMessage::ChatMessage {
                body: "hello".to_string(),
                display_name: None,
            },
        )
        .await;

    bob.expect_silence(QUIET).await;
}

#[tokio::test]
async fn test_unknown_message_kind_is_ignored() {
    let engine = MockMediaEngine::healthy();
    let service = call_service(&engine);
    let mut alice = TestClient::connect("conn-alice");
    alice.register(&service, "alice").await;

    let message: ClientMessage =
        serde_json::from_str(r#"{"id":"screenShare","enabled":true}"#).unwrap();
    alice.send(&service, message).await;

    alice.expect_silence(QUIET).await;
    assert_eq!(service.registry().len().await, 1);
}
