//! Inbound message dispatch.
//!
//! Every inbound message is resolved against the identity registry and
//! dispatched by kind. Validation failures are answered to the originating
//! connection only; establishment runs on its own task.

use crate::actors::ConnectionHandle;
use crate::config::Config;
use crate::engine::MediaEngine;
use crate::errors::SignalingError;
use crate::observability::metrics;
use crate::orchestrator::{PairOrigin, PairRequest, PipelineMap, SessionOrchestrator};
use crate::pairing::{PairingStrategy, RoomScheduler};
use crate::protocol::{CallDecision, ClientMessage, IceCandidate, ServerMessage};
use crate::registry::IdentityRegistry;
use crate::session::{self, PeerLink, SessionRef};
use crate::teardown::TeardownCoordinator;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Behavioral settings of the signaling core.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub pairing_strategy: PairingStrategy,
    pub room_settle_window: Duration,
    pub establishment_timeout: Duration,
    pub chat_enabled: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            pairing_strategy: PairingStrategy::ExplicitCall,
            room_settle_window: Duration::from_millis(crate::config::DEFAULT_ROOM_SETTLE_WINDOW_MS),
            establishment_timeout: Duration::from_secs(
                crate::config::DEFAULT_ESTABLISHMENT_TIMEOUT_SECONDS,
            ),
            chat_enabled: true,
        }
    }
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            pairing_strategy: config.pairing_strategy,
            room_settle_window: config.room_settle_window,
            establishment_timeout: config.establishment_timeout,
            chat_enabled: config.chat_enabled,
        }
    }
}

/// The signaling core: registry, pairing, establishment and teardown.
pub struct SignalingService {
    registry: Arc<IdentityRegistry>,
    pipelines: Arc<PipelineMap>,
    engine: Arc<dyn MediaEngine>,
    orchestrator: Arc<SessionOrchestrator>,
    scheduler: Option<Arc<RoomScheduler>>,
    teardown: TeardownCoordinator,
    settings: ServiceSettings,
}

impl SignalingService {
    /// Wire the core around `engine`. Background work stops when `shutdown` is cancelled.
    #[must_use]
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        settings: ServiceSettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(IdentityRegistry::new());
        let pipelines = Arc::new(PipelineMap::new());
        let orchestrator = Arc::new(SessionOrchestrator::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            Arc::clone(&pipelines),
            settings.establishment_timeout,
            shutdown.clone(),
        ));

        let scheduler = match settings.pairing_strategy {
            PairingStrategy::RoomAutoPair => Some(Arc::new(RoomScheduler::new(
                settings.room_settle_window,
                Arc::clone(&registry),
                Arc::clone(&orchestrator),
                shutdown,
            ))),
            PairingStrategy::ExplicitCall => None,
        };

        let teardown = TeardownCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            Arc::clone(&pipelines),
            scheduler.clone(),
        );

        Arc::new(Self {
            registry,
            pipelines,
            engine,
            orchestrator,
            scheduler,
            teardown,
            settings,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn pipelines(&self) -> &Arc<PipelineMap> {
        &self.pipelines
    }

    #[must_use]
    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Dispatch one inbound message from `connection`.
    #[instrument(
        skip_all,
        name = "signaling.handle_message",
        fields(connection_id = %connection.connection_id(), kind = message.kind())
    )]
    pub async fn handle_message(&self, connection: &ConnectionHandle, message: ClientMessage) {
        metrics::record_message(message.kind());
        let connection_id = connection.connection_id();

        match message {
            ClientMessage::Register {
                name,
                room,
                sdp_offer,
            } => self.register(connection, &name, room.as_deref(), sdp_offer).await,

            ClientMessage::Call { to, sdp_offer, .. } => {
                if let Err(e) = self.call(connection_id, &to, sdp_offer).await {
                    info!(
                        target: "signaling.handler",
                        connection_id = %connection_id,
                        to = %to,
                        error = %e,
                        "Call rejected"
                    );
                    reply(connection, ServerMessage::call_rejected(e.client_message())).await;
                }
            }

            ClientMessage::IncomingCallResponse {
                from,
                call_response,
                sdp_offer,
            } => {
                if let Err(e) = self
                    .incoming_call_response(connection_id, &from, call_response, sdp_offer)
                    .await
                {
                    info!(
                        target: "signaling.handler",
                        connection_id = %connection_id,
                        from = %from,
                        error = %e,
                        "Call response rejected"
                    );
                    reply(connection, ServerMessage::call_rejected(e.client_message())).await;
                }
            }

            ClientMessage::OnIceCandidate { candidate } => {
                self.on_ice_candidate(connection_id, candidate).await;
            }

            ClientMessage::Stop => {
                self.teardown.stop(connection_id).await;
            }

            ClientMessage::ChatMessage { body, display_name } => {
                self.chat(connection_id, body, display_name).await;
            }

            ClientMessage::Unknown => {
                // Tolerated for protocol version skew.
                debug!(
                    target: "signaling.handler",
                    connection_id = %connection_id,
                    "Ignoring unknown message kind"
                );
            }
        }
    }

    /// Transport closed: full teardown plus unregistration.
    pub async fn handle_disconnect(&self, connection_id: &str) {
        self.teardown.disconnect(connection_id).await;
    }

    async fn register(
        &self,
        connection: &ConnectionHandle,
        name: &str,
        room: Option<&str>,
        sdp_offer: Option<String>,
    ) {
        let session = match self.registry.register(name, room, connection.clone()).await {
            Ok(session) => session,
            Err(e) => {
                metrics::record_registration("rejected");
                info!(
                    target: "signaling.registry",
                    connection_id = %connection.connection_id(),
                    error = %e,
                    "Registration rejected"
                );
                let reason = SignalingError::from(e).client_message();
                reply(connection, ServerMessage::register_rejected(reason)).await;
                return;
            }
        };

        metrics::record_registration("accepted");
        if sdp_offer.is_some() {
            session.set_pending_offer(sdp_offer).await;
        }
        session.notify(ServerMessage::register_accepted()).await;

        if let Some(scheduler) = &self.scheduler {
            scheduler.on_registered(&session).await;
        }
    }

    async fn call(
        &self,
        connection_id: &str,
        to: &str,
        sdp_offer: String,
    ) -> Result<(), SignalingError> {
        if self.settings.pairing_strategy != PairingStrategy::ExplicitCall {
            return Err(SignalingError::StrategyDisabled);
        }

        let caller = self.registered(connection_id).await?;
        if caller.name() == to {
            return Err(SignalingError::SelfCall);
        }
        let callee = self
            .registry
            .lookup_by_name(to)
            .await
            .ok_or_else(|| SignalingError::UnknownTarget(to.to_string()))?;

        if !session::try_link(&caller, &callee, Some(sdp_offer)).await {
            let busy = if callee.is_unmatched().await {
                caller.name()
            } else {
                callee.name()
            };
            return Err(SignalingError::PeerBusy(busy.to_string()));
        }

        info!(
            target: "signaling.handler",
            caller = %caller.name(),
            callee = %callee.name(),
            "Ringing callee"
        );
        callee
            .notify(ServerMessage::IncomingCall {
                from: caller.name().to_string(),
            })
            .await;
        Ok(())
    }

    async fn incoming_call_response(
        &self,
        connection_id: &str,
        from: &str,
        decision: CallDecision,
        sdp_offer: Option<String>,
    ) -> Result<(), SignalingError> {
        let callee = self.registered(connection_id).await?;
        // Only the first answer to a ringing call counts; later ones find nothing pending.
        if !callee.claim_incoming(from).await {
            return Err(SignalingError::NoPendingCall(from.to_string()));
        }

        let caller = match self.registry.lookup_by_name(from).await {
            Some(caller)
                if caller.peer().await
                    == Some(PeerLink::CallingTo(callee.name().to_string())) =>
            {
                caller
            }
            _ => {
                // Caller gave up or left while ringing.
                if callee.clear_link_to(from).await {
                    callee.notify(ServerMessage::StopCommunication).await;
                }
                return Ok(());
            }
        };

        match decision {
            CallDecision::Accept => {
                callee.set_pending_offer(sdp_offer).await;
                drop(self.orchestrator.establish(PairRequest {
                    caller,
                    callee,
                    origin: PairOrigin::ExplicitCall,
                }));
            }
            CallDecision::Decline => {
                caller.clear_link_to(callee.name()).await;
                callee.clear_link_to(caller.name()).await;
                info!(
                    target: "signaling.handler",
                    caller = %caller.name(),
                    callee = %callee.name(),
                    "Call declined"
                );
                let reason = SignalingError::CallDeclined(callee.name().to_string()).client_message();
                caller.notify(ServerMessage::call_rejected(reason)).await;
            }
        }
        Ok(())
    }

    async fn on_ice_candidate(&self, connection_id: &str, candidate: IceCandidate) {
        let Some(session) = self.registry.lookup_by_connection(connection_id).await else {
            debug!(
                target: "signaling.handler",
                connection_id = %connection_id,
                "Candidate from unregistered connection dropped"
            );
            return;
        };

        if let Err(e) = session.add_candidate(self.engine.as_ref(), candidate).await {
            warn!(
                target: "signaling.handler",
                name = %session.name(),
                error = %e,
                "Failed to forward candidate to media engine"
            );
        }
    }

    async fn chat(&self, connection_id: &str, body: String, display_name: Option<String>) {
        if !self.settings.chat_enabled {
            return;
        }
        let Some(session) = self.registry.lookup_by_connection(connection_id).await else {
            return;
        };
        let Some(link) = session.peer().await else {
            return;
        };
        if let Some(peer) = self.registry.lookup_by_name(link.peer_name()).await {
            peer.notify(ServerMessage::ChatMessage { body, display_name })
                .await;
        }
    }

    async fn registered(&self, connection_id: &str) -> Result<SessionRef, SignalingError> {
        self.registry
            .lookup_by_connection(connection_id)
            .await
            .ok_or(SignalingError::NotRegistered)
    }
}

/// Answer the originating connection, logging and suppressing delivery failures.
async fn reply(connection: &ConnectionHandle, message: ServerMessage) {
    let kind = message.kind();
    if let Err(e) = connection.send(message).await {
        debug!(
            target: "signaling.handler",
            connection_id = %connection.connection_id(),
            kind = kind,
            error = %e,
            "Dropped reply for departed client"
        );
    }
}
