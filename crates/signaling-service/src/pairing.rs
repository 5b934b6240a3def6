//! Pairing strategies.
//!
//! [`PairingStrategy::ExplicitCall`] is driven by the dispatcher
//! (`call` / `incomingCallResponse`). [`PairingStrategy::RoomAutoPair`] is
//! driven by [`RoomScheduler`]: once a room holds two sessions that are
//! unmatched and have an offer staged, a settle timer is armed; when it fires
//! the two earliest registered of them are paired.

use crate::orchestrator::{PairOrigin, PairRequest, SessionOrchestrator};
use crate::registry::IdentityRegistry;
use crate::session::{self, SessionRef};

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// How candidate pairs are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingStrategy {
    /// The caller names a callee, who accepts or declines.
    #[default]
    ExplicitCall,
    /// Sessions sharing a room are paired automatically.
    RoomAutoPair,
}

impl PairingStrategy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PairingStrategy::ExplicitCall => "call",
            PairingStrategy::RoomAutoPair => "room",
        }
    }
}

impl FromStr for PairingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "call" => Ok(PairingStrategy::ExplicitCall),
            "room" => Ok(PairingStrategy::RoomAutoPair),
            other => Err(format!("unknown pairing strategy '{other}', expected 'call' or 'room'")),
        }
    }
}

/// Room-quorum auto-pairing with one cancellable settle timer per room.
pub struct RoomScheduler {
    settle_window: Duration,
    registry: Arc<IdentityRegistry>,
    orchestrator: Arc<SessionOrchestrator>,
    /// Armed timers by lowercased room name.
    pending: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl RoomScheduler {
    #[must_use]
    pub fn new(
        settle_window: Duration,
        registry: Arc<IdentityRegistry>,
        orchestrator: Arc<SessionOrchestrator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settle_window,
            registry,
            orchestrator,
            pending: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Arm the settle timer of the session's room if it now has a quorum.
    pub async fn on_registered(self: &Arc<Self>, session: &SessionRef) {
        let Some(room) = session.room() else {
            return;
        };
        let key = room.to_lowercase();

        let mut pending = self.pending.lock().await;
        if pending.contains_key(&key) {
            // One pairing attempt per room per settle cycle.
            return;
        }
        if self.ready_sessions(&key).await.len() < 2 {
            return;
        }

        let token = self.shutdown.child_token();
        pending.insert(key.clone(), token.clone());
        drop(pending);

        debug!(
            target: "signaling.pairing",
            room = %key,
            settle_ms = self.settle_window.as_millis(),
            "Room quorum reached, settle timer armed"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move { this.settle_loop(key, token).await });
    }

    /// Disarm the room's timer if the departure broke the quorum.
    pub async fn on_unregistered(&self, session: &SessionRef) {
        let Some(room) = session.room() else {
            return;
        };
        let key = room.to_lowercase();

        let mut pending = self.pending.lock().await;
        if !pending.contains_key(&key) {
            return;
        }
        if self.ready_sessions(&key).await.len() < 2 {
            if let Some(token) = pending.remove(&key) {
                token.cancel();
                debug!(
                    target: "signaling.pairing",
                    room = %key,
                    "Room quorum lost, settle timer cancelled"
                );
            }
        }
    }

    #[instrument(skip_all, name = "signaling.pairing.settle", fields(room = %key))]
    async fn settle_loop(self: Arc<Self>, key: String, token: CancellationToken) {
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(self.settle_window) => {}
            }

            self.pair_earliest(&key).await;

            // Quorum check and disarm happen under the same lock as arming.
            let mut pending = self.pending.lock().await;
            if token.is_cancelled() {
                return;
            }
            if self.ready_sessions(&key).await.len() < 2 {
                pending.remove(&key);
                return;
            }
            debug!(
                target: "signaling.pairing",
                room = %key,
                "Room still has a quorum, starting another settle cycle"
            );
        }
    }

    async fn pair_earliest(&self, key: &str) {
        let ready = self.ready_sessions(key).await;
        let [first, second, ..] = ready.as_slice() else {
            return;
        };

        if !session::try_link(first, second, None).await {
            debug!(
                target: "signaling.pairing",
                room = %key,
                "Selected sessions were claimed concurrently"
            );
            return;
        }

        info!(
            target: "signaling.pairing",
            room = %key,
            caller = %first.name(),
            callee = %second.name(),
            "Auto-pairing room participants"
        );

        // The establishment task reports its own outcome.
        drop(self.orchestrator.establish(PairRequest {
            caller: Arc::clone(first),
            callee: Arc::clone(second),
            origin: PairOrigin::RoomAutoPair,
        }));
    }

    /// Sessions of the room that are unmatched with an offer staged, earliest first.
    async fn ready_sessions(&self, key: &str) -> Vec<SessionRef> {
        let mut ready = Vec::new();
        for session in self.registry.sessions_in_room(key).await {
            if session.is_ready_to_pair().await {
                ready.push(session);
            }
        }
        ready
    }
}
