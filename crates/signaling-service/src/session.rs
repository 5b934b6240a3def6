//! Per-connection session state.
//!
//! A [`Session`] is created by the registry on successful registration and
//! shared as a [`SessionRef`] between the registry, the orchestrator and the
//! engine candidate forwarders. Mutable call state lives behind one async
//! mutex per session; candidate forwarding and endpoint binding both run under
//! that lock, which keeps buffered candidates in arrival order.

use crate::actors::ConnectionHandle;
use crate::candidates::CandidateBuffer;
use crate::engine::{EndpointHandle, EngineResult, MediaEngine};
use crate::errors::SignalingError;
use crate::protocol::{IceCandidate, ServerMessage};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Transport connection identifier.
pub type ConnectionId = String;

/// Shared reference to a live session.
pub type SessionRef = Arc<Session>;

/// Linkage to the counterpart of a pending or established call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLink {
    /// This session initiated the call.
    CallingTo(String),
    /// This session was called.
    CallingFrom(String),
}

impl PeerLink {
    #[must_use]
    pub fn peer_name(&self) -> &str {
        match self {
            PeerLink::CallingTo(name) | PeerLink::CallingFrom(name) => name,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    pending_offer: Option<String>,
    peer: Option<PeerLink>,
    /// The ringing call behind `CallingFrom` has been answered.
    answered: bool,
    endpoint: Option<EndpointHandle>,
    candidates: CandidateBuffer,
    last_active: DateTime<Utc>,
}

/// A registered participant.
#[derive(Debug)]
pub struct Session {
    name: String,
    room: Option<String>,
    seq: u64,
    connection: ConnectionHandle,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(
        name: String,
        room: Option<String>,
        seq: u64,
        connection: ConnectionHandle,
    ) -> Self {
        Self {
            name,
            room,
            seq,
            connection,
            state: Mutex::new(SessionState {
                pending_offer: None,
                peer: None,
                answered: false,
                endpoint: None,
                candidates: CandidateBuffer::new(),
                last_active: Utc::now(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    /// Registration order; lower values registered earlier.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Send a message to this session's client.
    pub async fn send(&self, message: ServerMessage) -> Result<(), SignalingError> {
        self.state.lock().await.last_active = Utc::now();
        self.connection.send(message).await
    }

    /// Send a message, logging and suppressing delivery failures.
    ///
    /// Waits while the client's mailbox is full; control messages are never dropped.
    pub async fn notify(&self, message: ServerMessage) {
        let kind = message.kind();
        if let Err(e) = self.send(message).await {
            debug!(
                target: "signaling.session",
                name = %self.name,
                connection_id = %self.connection_id(),
                kind = kind,
                error = %e,
                "Dropped outbound message for departed client"
            );
        }
    }

    /// Send a message only if the client's mailbox has room.
    ///
    /// Used for engine-discovered candidates, which are dropped rather than
    /// letting one stalled client hold up its forwarder.
    pub async fn try_notify(&self, message: ServerMessage) {
        self.state.lock().await.last_active = Utc::now();
        let kind = message.kind();
        match self.connection.try_send(message) {
            Ok(()) => {}
            Err(SignalingError::MailboxFull(_)) => {
                warn!(
                    target: "signaling.session",
                    name = %self.name,
                    connection_id = %self.connection_id(),
                    kind = kind,
                    "Client mailbox full, dropped outbound message"
                );
            }
            Err(e) => {
                debug!(
                    target: "signaling.session",
                    name = %self.name,
                    connection_id = %self.connection_id(),
                    kind = kind,
                    error = %e,
                    "Dropped outbound message for departed client"
                );
            }
        }
    }

    pub async fn last_active(&self) -> DateTime<Utc> {
        self.state.lock().await.last_active
    }

    pub async fn set_pending_offer(&self, offer: Option<String>) {
        self.state.lock().await.pending_offer = offer;
    }

    pub async fn pending_offer(&self) -> Option<String> {
        self.state.lock().await.pending_offer.clone()
    }

    pub async fn peer(&self) -> Option<PeerLink> {
        self.state.lock().await.peer.clone()
    }

    pub async fn endpoint(&self) -> Option<EndpointHandle> {
        self.state.lock().await.endpoint.clone()
    }

    pub async fn buffered_candidates(&self) -> usize {
        self.state.lock().await.candidates.len()
    }

    /// Whether this session is free to be paired.
    pub async fn is_unmatched(&self) -> bool {
        self.state.lock().await.peer.is_none()
    }

    /// Whether this session is free to be paired and has an offer staged.
    pub async fn is_ready_to_pair(&self) -> bool {
        let state = self.state.lock().await;
        state.peer.is_none() && state.pending_offer.is_some()
    }

    /// Claim the call ringing from `caller` so it can be answered once.
    ///
    /// Returns false if no call from `caller` is ringing or it was already answered.
    pub async fn claim_incoming(&self, caller: &str) -> bool {
        let mut state = self.state.lock().await;
        let ringing = !state.answered
            && matches!(&state.peer, Some(PeerLink::CallingFrom(name)) if name == caller);
        if ringing {
            state.answered = true;
        }
        ringing
    }

    /// Accept a candidate that describes this session's own endpoint.
    ///
    /// Forwarded immediately once an endpoint is bound, buffered otherwise.
    pub async fn add_candidate(
        &self,
        engine: &dyn MediaEngine,
        candidate: IceCandidate,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        match state.endpoint.clone() {
            Some(endpoint) => engine.add_candidate(&endpoint, &candidate).await,
            None => {
                state.candidates.push(candidate);
                Ok(())
            }
        }
    }

    /// Bind the negotiated endpoint and flush buffered candidates into it in arrival order.
    pub async fn bind_endpoint(
        &self,
        engine: &dyn MediaEngine,
        endpoint: EndpointHandle,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.endpoint = Some(endpoint.clone());
        let buffered = state.candidates.drain();
        let count = buffered.len();
        for candidate in &buffered {
            engine.add_candidate(&endpoint, candidate).await?;
        }
        if count > 0 {
            debug!(
                target: "signaling.session",
                name = %self.name,
                endpoint = %endpoint,
                count = count,
                "Flushed buffered candidates"
            );
        }
        Ok(())
    }

    /// Clear the offer once negotiation has consumed it.
    pub async fn clear_pending_offer(&self) {
        self.state.lock().await.pending_offer = None;
    }

    /// Drop all call state: peer link, offer, endpoint and buffered candidates.
    pub async fn reset_call_state(&self) {
        let mut state = self.state.lock().await;
        state.peer = None;
        state.answered = false;
        state.pending_offer = None;
        state.endpoint = None;
        state.candidates.clear();
    }

    /// Forget `endpoint` if it is still the bound one.
    pub async fn detach_endpoint(&self, endpoint: &EndpointHandle) {
        let mut state = self.state.lock().await;
        if state.endpoint.as_ref() == Some(endpoint) {
            state.endpoint = None;
        }
    }

    /// Clear the peer link only if it still names `peer`.
    ///
    /// Returns true if the link was cleared.
    pub async fn clear_link_to(&self, peer: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.peer.as_ref().is_some_and(|link| link.peer_name() == peer) {
            state.peer = None;
            state.answered = false;
            state.pending_offer = None;
            state.endpoint = None;
            state.candidates.clear();
            true
        } else {
            false
        }
    }
}

/// Atomically link `caller` and `callee` if both are unmatched.
///
/// When `caller_offer` is given it is staged on the caller in the same step.
/// Both state locks are taken in registration order so concurrent links over
/// overlapping sessions cannot deadlock. Returns false if either side is
/// already linked or both are the same session.
pub async fn try_link(caller: &Session, callee: &Session, caller_offer: Option<String>) -> bool {
    if caller.seq == callee.seq {
        return false;
    }

    let (mut caller_state, mut callee_state) = if caller.seq < callee.seq {
        let a = caller.state.lock().await;
        let b = callee.state.lock().await;
        (a, b)
    } else {
        let b = callee.state.lock().await;
        let a = caller.state.lock().await;
        (a, b)
    };

    if caller_state.peer.is_some() || callee_state.peer.is_some() {
        warn!(
            target: "signaling.session",
            caller = %caller.name,
            callee = %callee.name,
            "Link refused, a participant is already engaged"
        );
        return false;
    }

    caller_state.peer = Some(PeerLink::CallingTo(callee.name.clone()));
    callee_state.peer = Some(PeerLink::CallingFrom(caller.name.clone()));
    caller_state.answered = false;
    callee_state.answered = false;
    if caller_offer.is_some() {
        caller_state.pending_offer = caller_offer;
    }
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::ConnectionActor;
    use crate::engine::{CandidateStream, PipelineHandle};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingEngine {
        forwarded: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MediaEngine for RecordingEngine {
        async fn create_pipeline(&self) -> EngineResult<PipelineHandle> {
            unreachable!("not used")
        }
        async fn generate_answer(&self, _: &EndpointHandle, _: &str) -> EngineResult<String> {
            unreachable!("not used")
        }
        async fn add_candidate(
            &self,
            endpoint: &EndpointHandle,
            candidate: &IceCandidate,
        ) -> EngineResult<()> {
            self.forwarded
                .lock()
                .unwrap()
                .push((endpoint.id().to_string(), candidate.candidate.clone()));
            Ok(())
        }
        async fn gather_candidates(&self, _: &EndpointHandle) -> EngineResult<()> {
            Ok(())
        }
        async fn subscribe_local_candidates(&self, _: &EndpointHandle) -> EngineResult<CandidateStream> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }
        async fn release(&self, _: &PipelineHandle) {}
    }

    fn session(name: &str, seq: u64) -> (Session, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, _task) =
            ConnectionActor::spawn(format!("conn-{name}"), tx, CancellationToken::new());
        (Session::new(name.to_string(), None, seq, handle), rx)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n}"), "0", 0)
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_bound_then_forward() {
        let engine = RecordingEngine::default();
        let (alice, _rx) = session("alice", 1);

        alice.add_candidate(&engine, candidate(1)).await.unwrap();
        alice.add_candidate(&engine, candidate(2)).await.unwrap();
        assert!(engine.forwarded.lock().unwrap().is_empty());
        assert_eq!(alice.buffered_candidates().await, 2);

        alice
            .bind_endpoint(&engine, EndpointHandle("ep-a".to_string()))
            .await
            .unwrap();
        alice.add_candidate(&engine, candidate(3)).await.unwrap();

        let forwarded = engine.forwarded.lock().unwrap().clone();
        assert_eq!(
            forwarded,
            vec![
                ("ep-a".to_string(), "candidate:1".to_string()),
                ("ep-a".to_string(), "candidate:2".to_string()),
                ("ep-a".to_string(), "candidate:3".to_string()),
            ]
        );
        assert_eq!(alice.buffered_candidates().await, 0);
    }

    #[tokio::test]
    async fn test_try_link_is_exclusive() {
        let (alice, _a) = session("alice", 1);
        let (bob, _b) = session("bob", 2);
        let (carol, _c) = session("carol", 3);

        assert!(try_link(&alice, &bob, Some("offer-a".to_string())).await);
        assert!(!try_link(&carol, &bob, Some("offer-c".to_string())).await);
        assert!(!try_link(&alice, &alice, None).await);

        assert_eq!(alice.peer().await, Some(PeerLink::CallingTo("bob".to_string())));
        assert_eq!(bob.peer().await, Some(PeerLink::CallingFrom("alice".to_string())));
        assert!(carol.is_unmatched().await);
        assert_eq!(alice.pending_offer().await.as_deref(), Some("offer-a"));
        assert_eq!(carol.pending_offer().await, None);
    }

    #[tokio::test]
    async fn test_clear_link_to_only_matching_peer() {
        let (alice, _a) = session("alice", 1);
        let (bob, _b) = session("bob", 2);
        assert!(try_link(&alice, &bob, None).await);

        assert!(!bob.clear_link_to("carol").await);
        assert!(bob.clear_link_to("alice").await);
        assert!(bob.is_unmatched().await);
    }

    #[tokio::test]
    async fn test_claim_incoming_succeeds_once() {
        let (alice, _a) = session("alice", 1);
        let (bob, _b) = session("bob", 2);
        assert!(!bob.claim_incoming("alice").await);

        assert!(try_link(&alice, &bob, None).await);
        assert!(!alice.claim_incoming("bob").await);
        assert!(!bob.claim_incoming("carol").await);
        assert!(bob.claim_incoming("alice").await);
        assert!(!bob.claim_incoming("alice").await);

        // A new call rings again after the old one is gone.
        bob.reset_call_state().await;
        alice.reset_call_state().await;
        assert!(try_link(&alice, &bob, None).await);
        assert!(bob.claim_incoming("alice").await);
    }

    #[tokio::test]
    async fn test_send_updates_last_active() {
        let (alice, mut rx) = session("alice", 1);
        let before = alice.last_active().await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        alice.send(ServerMessage::StopCommunication).await.unwrap();

        assert!(alice.last_active().await > before);
        assert_eq!(rx.recv().await.unwrap(), ServerMessage::StopCommunication);
    }
}
