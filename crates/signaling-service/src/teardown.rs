//! Symmetric teardown of pairs on `stop` and on transport close.

use crate::engine::MediaEngine;
use crate::observability::metrics;
use crate::orchestrator::PipelineMap;
use crate::pairing::RoomScheduler;
use crate::protocol::ServerMessage;
use crate::registry::IdentityRegistry;
use crate::session::SessionRef;

use std::sync::Arc;
use tracing::{debug, info};

/// Releases pairs and notifies counterparts.
pub struct TeardownCoordinator {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<IdentityRegistry>,
    pipelines: Arc<PipelineMap>,
    scheduler: Option<Arc<RoomScheduler>>,
}

impl TeardownCoordinator {
    #[must_use]
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        registry: Arc<IdentityRegistry>,
        pipelines: Arc<PipelineMap>,
        scheduler: Option<Arc<RoomScheduler>>,
    ) -> Self {
        Self {
            engine,
            registry,
            pipelines,
            scheduler,
        }
    }

    /// Tear down the pair `connection_id` belongs to.
    ///
    /// No-op if the connection has no pipeline mapping. Returns true if a
    /// pair was torn down by this call.
    pub async fn stop(&self, connection_id: &str) -> bool {
        let me = self.registry.lookup_by_connection(connection_id).await;
        self.teardown_pair(connection_id, me.as_ref(), "stop").await
    }

    /// Transport close: unregister, tear down the pair, and cancel any
    /// pending (ringing or settling) pairing the session was part of.
    pub async fn disconnect(&self, connection_id: &str) {
        // Unregister first so no new pairing can pick this session.
        let me = self.registry.unregister(connection_id).await;
        self.teardown_pair(connection_id, me.as_ref(), "disconnect")
            .await;

        let Some(me) = me else {
            return;
        };

        if let Some(link) = me.peer().await {
            if let Some(peer) = self.registry.lookup_by_name(link.peer_name()).await {
                if peer.clear_link_to(me.name()).await {
                    info!(
                        target: "signaling.teardown",
                        name = %me.name(),
                        peer = %peer.name(),
                        "Pending call cancelled by disconnect"
                    );
                    peer.notify(ServerMessage::StopCommunication).await;
                }
            }
        }
        me.reset_call_state().await;

        if let Some(scheduler) = &self.scheduler {
            scheduler.on_unregistered(&me).await;
        }

        debug!(
            target: "signaling.teardown",
            name = %me.name(),
            connection_id = %connection_id,
            "Disconnected session cleaned up"
        );
    }

    async fn teardown_pair(
        &self,
        connection_id: &str,
        me: Option<&SessionRef>,
        reason: &'static str,
    ) -> bool {
        let Some(record) = self.pipelines.remove_pair(connection_id).await else {
            return false;
        };

        record.cancel();
        self.engine.release(&record.pipeline).await;
        metrics::record_teardown(reason);

        let expected = record.counterpart_of(connection_id);
        let by_link = match me {
            Some(me) => match me.peer().await {
                Some(link) => self.registry.lookup_by_name(link.peer_name()).await,
                None => None,
            },
            None => None,
        };
        let counterpart = match by_link {
            Some(peer) if peer.connection_id() == expected.connection_id => Some(peer),
            _ => self.registry.lookup_by_connection(&expected.connection_id).await,
        };

        if let Some(me) = me {
            me.reset_call_state().await;
        }
        if let Some(peer) = &counterpart {
            peer.reset_call_state().await;
            peer.notify(ServerMessage::StopCommunication).await;
        }

        info!(
            target: "signaling.teardown",
            connection_id = %connection_id,
            pipeline_id = %record.pipeline.id,
            counterpart = %expected.name,
            reason = reason,
            "Pair torn down"
        );
        true
    }
}
