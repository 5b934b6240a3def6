//! Pair establishment against the media engine.
//!
//! # State machine
//!
//! ```text
//! Pairing ──► Negotiating ──► Established
//!    │             │
//!    └─────────────┴────────► RolledBack
//! ```
//!
//! `Pairing` covers pipeline creation and registration of the pair record
//! under both connection ids. `Negotiating` covers endpoint binding, candidate
//! subscription, answer generation, the establishment notifications and
//! candidate gathering. Any failure, the establishment deadline, or a
//! concurrent teardown ends in `RolledBack`.
//!
//! Each attempt runs as its own task so engine I/O never blocks the dispatch
//! path of unrelated connections.

use crate::engine::{EngineError, MediaEngine, PipelineHandle, Side};
use crate::errors::SignalingError;
use crate::observability::metrics;
use crate::protocol::ServerMessage;
use crate::registry::IdentityRegistry;
use crate::session::{ConnectionId, SessionRef};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Which pairing strategy produced a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOrigin {
    /// Caller named the callee and the callee accepted.
    ExplicitCall,
    /// Two unmatched sessions of a room were paired after the settle window.
    RoomAutoPair,
}

/// Establishment progress of one pair attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishmentState {
    Pairing,
    Negotiating,
    Established,
    RolledBack,
}

/// One side of a pair record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub name: String,
    pub connection_id: ConnectionId,
}

impl Participant {
    fn of(session: &SessionRef) -> Self {
        Self {
            name: session.name().to_string(),
            connection_id: session.connection_id().to_string(),
        }
    }
}

/// A pipeline shared by two connections.
#[derive(Debug)]
pub struct PairRecord {
    pub pipeline: PipelineHandle,
    pub caller: Participant,
    pub callee: Participant,
    cancel_token: CancellationToken,
}

impl PairRecord {
    /// The participant on the other side of `connection_id`.
    #[must_use]
    pub fn counterpart_of(&self, connection_id: &str) -> &Participant {
        if self.caller.connection_id == connection_id {
            &self.callee
        } else {
            &self.caller
        }
    }

    /// Stop the attempt and its candidate forwarders.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// Connection id to pair record, both sides under one lock.
///
/// Either both connection ids of a record map to it or neither does.
#[derive(Debug, Default)]
pub struct PipelineMap {
    entries: Mutex<HashMap<ConnectionId, Arc<PairRecord>>>,
}

impl PipelineMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map both participants to `record`. Fails if either is already mapped.
    pub async fn insert_pair(&self, record: &Arc<PairRecord>) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&record.caller.connection_id)
            || entries.contains_key(&record.callee.connection_id)
        {
            return false;
        }
        entries.insert(record.caller.connection_id.clone(), Arc::clone(record));
        entries.insert(record.callee.connection_id.clone(), Arc::clone(record));
        true
    }

    /// Remove the pair `connection_id` belongs to, returning it.
    ///
    /// Exactly one caller observes `Some` for a given record.
    pub async fn remove_pair(&self, connection_id: &str) -> Option<Arc<PairRecord>> {
        let mut entries = self.entries.lock().await;
        let record = entries.get(connection_id).cloned()?;
        remove_entries(&mut entries, &record);
        Some(record)
    }

    /// Remove `record` if it is still mapped. Returns true if this call removed it.
    pub async fn remove_record(&self, record: &Arc<PairRecord>) -> bool {
        let mut entries = self.entries.lock().await;
        let mapped = entries
            .get(&record.caller.connection_id)
            .is_some_and(|r| Arc::ptr_eq(r, record));
        if mapped {
            remove_entries(&mut entries, record);
        }
        mapped
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<PairRecord>> {
        self.entries.lock().await.get(connection_id).cloned()
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.entries.lock().await.contains_key(connection_id)
    }

    /// Number of mapped connection ids (twice the number of pairs).
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

fn remove_entries(entries: &mut HashMap<ConnectionId, Arc<PairRecord>>, record: &Arc<PairRecord>) {
    for id in [&record.caller.connection_id, &record.callee.connection_id] {
        if entries.get(id).is_some_and(|r| Arc::ptr_eq(r, record)) {
            entries.remove(id);
        }
    }
}

/// Request to establish a pair whose sessions are already linked.
#[derive(Debug, Clone)]
pub struct PairRequest {
    pub caller: SessionRef,
    pub callee: SessionRef,
    pub origin: PairOrigin,
}

/// Final result of one establishment attempt.
#[derive(Debug)]
pub enum EstablishmentOutcome {
    Established { pipeline_id: String },
    RolledBack(SignalingError),
}

impl EstablishmentOutcome {
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self, EstablishmentOutcome::Established { .. })
    }
}

struct Progress {
    state: EstablishmentState,
    pipeline: Option<PipelineHandle>,
    record: Option<Arc<PairRecord>>,
    /// Another pair already owns one of the connections.
    mapping_conflict: bool,
    notified: bool,
}

/// Drives pair establishment and rollback.
pub struct SessionOrchestrator {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<IdentityRegistry>,
    pipelines: Arc<PipelineMap>,
    establishment_timeout: Duration,
    shutdown: CancellationToken,
}

impl SessionOrchestrator {
    #[must_use]
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        registry: Arc<IdentityRegistry>,
        pipelines: Arc<PipelineMap>,
        establishment_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            registry,
            pipelines,
            establishment_timeout,
            shutdown,
        }
    }

    /// Start establishing `request` as an independent task.
    pub fn establish(self: &Arc<Self>, request: PairRequest) -> JoinHandle<EstablishmentOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(request).await })
    }

    #[instrument(
        skip_all,
        name = "signaling.orchestrator.establish",
        fields(caller = %request.caller.name(), callee = %request.callee.name(), origin = ?request.origin)
    )]
    async fn run(&self, request: PairRequest) -> EstablishmentOutcome {
        let started = Instant::now();
        let token = self.shutdown.child_token();
        let mut progress = Progress {
            state: EstablishmentState::Pairing,
            pipeline: None,
            record: None,
            mapping_conflict: false,
            notified: false,
        };

        let result = match tokio::time::timeout(
            self.establishment_timeout,
            self.drive(&request, &token, &mut progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SignalingError::EstablishmentTimeout),
        };

        match result {
            Ok(pipeline_id) => {
                progress.state = EstablishmentState::Established;
                metrics::record_establishment("established", started.elapsed());
                info!(
                    target: "signaling.orchestrator",
                    caller = %request.caller.name(),
                    callee = %request.callee.name(),
                    pipeline_id = %pipeline_id,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Pair established"
                );
                EstablishmentOutcome::Established { pipeline_id }
            }
            Err(error) => {
                let outcome = match error {
                    SignalingError::EstablishmentTimeout => "timeout",
                    SignalingError::Cancelled => "cancelled",
                    _ => "rolled_back",
                };
                warn!(
                    target: "signaling.orchestrator",
                    caller = %request.caller.name(),
                    callee = %request.callee.name(),
                    state = ?progress.state,
                    error = %error,
                    "Establishment failed, rolling back"
                );
                self.rollback(&request, &token, &mut progress, &error).await;
                metrics::record_establishment(outcome, started.elapsed());
                EstablishmentOutcome::RolledBack(error)
            }
        }
    }

    async fn drive(
        &self,
        request: &PairRequest,
        token: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<String, SignalingError> {
        let PairRequest { caller, callee, origin } = request;
        let engine = self.engine.as_ref();

        // Pairing: pipeline plus symmetric mapping
        let pipeline = guarded(token, engine.create_pipeline()).await?;
        progress.pipeline = Some(pipeline.clone());

        let record = Arc::new(PairRecord {
            pipeline: pipeline.clone(),
            caller: Participant::of(caller),
            callee: Participant::of(callee),
            cancel_token: token.clone(),
        });
        if !self.pipelines.insert_pair(&record).await {
            progress.mapping_conflict = true;
            return Err(SignalingError::Internal(
                "participant already owns a pipeline".to_string(),
            ));
        }
        progress.record = Some(Arc::clone(&record));

        for session in [caller, callee] {
            self.ensure_registered(session).await?;
        }

        debug!(
            target: "signaling.orchestrator",
            pipeline_id = %pipeline.id,
            "Pipeline mapped for both participants"
        );

        // Negotiating
        progress.state = EstablishmentState::Negotiating;
        let sides = [(caller, Side::Caller), (callee, Side::Callee)];

        for (session, side) in sides {
            let endpoint = engine.endpoint(&pipeline, side);
            guarded(token, session.bind_endpoint(engine, endpoint)).await?;
        }

        for (session, side) in sides {
            let endpoint = engine.endpoint(&pipeline, side);
            let stream = guarded(token, engine.subscribe_local_candidates(&endpoint)).await?;
            tokio::spawn(forward_local_candidates(
                Arc::clone(&self.registry),
                session.connection_id().to_string(),
                stream,
                token.clone(),
            ));
        }

        let mut answers = Vec::with_capacity(2);
        for (session, side) in sides {
            let offer = session
                .pending_offer()
                .await
                .ok_or_else(|| EngineError::MalformedOffer(format!("no offer from {}", session.name())))?;
            let endpoint = engine.endpoint(&pipeline, side);
            answers.push(guarded(token, engine.generate_answer(&endpoint, &offer)).await?);
        }
        let [caller_answer, callee_answer]: [String; 2] = answers
            .try_into()
            .map_err(|_| SignalingError::Internal("answer count mismatch".to_string()))?;

        if token.is_cancelled() {
            return Err(SignalingError::Cancelled);
        }

        match origin {
            PairOrigin::ExplicitCall => {
                caller.notify(ServerMessage::call_accepted(caller_answer)).await;
            }
            PairOrigin::RoomAutoPair => {
                caller
                    .notify(ServerMessage::StartCommunication {
                        sdp_answer: caller_answer,
                    })
                    .await;
            }
        }
        callee
            .notify(ServerMessage::StartCommunication {
                sdp_answer: callee_answer,
            })
            .await;
        progress.notified = true;

        for (_, side) in sides {
            let endpoint = engine.endpoint(&pipeline, side);
            guarded(token, engine.gather_candidates(&endpoint)).await?;
        }

        caller.clear_pending_offer().await;
        callee.clear_pending_offer().await;

        Ok(pipeline.id)
    }

    async fn ensure_registered(&self, session: &SessionRef) -> Result<(), SignalingError> {
        match self.registry.lookup_by_connection(session.connection_id()).await {
            Some(current) if Arc::ptr_eq(&current, session) => Ok(()),
            _ => Err(SignalingError::ConnectionClosed(
                session.connection_id().to_string(),
            )),
        }
    }

    async fn rollback(
        &self,
        request: &PairRequest,
        token: &CancellationToken,
        progress: &mut Progress,
        error: &SignalingError,
    ) {
        progress.state = EstablishmentState::RolledBack;
        token.cancel();

        if progress.mapping_conflict {
            // The links and mappings belong to the pair that already exists.
            if let Some(pipeline) = &progress.pipeline {
                self.engine.release(pipeline).await;
            }
            return;
        }

        let owned = match &progress.record {
            Some(record) => self.pipelines.remove_record(record).await,
            None => true,
        };
        if !owned {
            // A teardown already removed the pair, released it and notified the counterpart.
            debug!(
                target: "signaling.orchestrator",
                caller = %request.caller.name(),
                callee = %request.callee.name(),
                "Pair already torn down"
            );
            return;
        }

        if let Some(pipeline) = &progress.pipeline {
            self.engine.release(pipeline).await;
        }
        metrics::record_teardown("rollback");

        let PairRequest { caller, callee, .. } = request;
        let caller_linked = caller.clear_link_to(callee.name()).await;
        let callee_linked = callee.clear_link_to(caller.name()).await;
        if let Some(pipeline) = &progress.pipeline {
            caller.detach_endpoint(&pipeline.caller).await;
            callee.detach_endpoint(&pipeline.callee).await;
        }

        // Only sessions still linked to this attempt hear about it.
        if caller_linked {
            let message = if progress.notified {
                ServerMessage::StopCommunication
            } else {
                ServerMessage::call_rejected(error.client_message())
            };
            caller.notify(message).await;
        }
        if callee_linked {
            callee.notify(ServerMessage::StopCommunication).await;
        }
    }
}

/// Race an engine step against cancellation of the attempt.
async fn guarded<T, E>(
    token: &CancellationToken,
    step: impl Future<Output = Result<T, E>>,
) -> Result<T, SignalingError>
where
    SignalingError: From<E>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(SignalingError::Cancelled),
        result = step => result.map_err(SignalingError::from),
    }
}

/// Deliver engine-discovered candidates to the session owning the endpoint.
///
/// The session is resolved by connection id on every candidate, so a
/// forwarder never keeps a departed session alive.
async fn forward_local_candidates(
    registry: Arc<IdentityRegistry>,
    connection_id: ConnectionId,
    mut stream: crate::engine::CandidateStream,
    token: CancellationToken,
) {
    loop {
        let candidate = tokio::select! {
            () = token.cancelled() => break,
            candidate = stream.recv() => candidate,
        };
        let Some(candidate) = candidate else { break };

        let Some(session) = registry.lookup_by_connection(&connection_id).await else {
            break;
        };
        session.try_notify(ServerMessage::IceCandidate { candidate }).await;
    }
    debug!(
        target: "signaling.orchestrator",
        connection_id = %connection_id,
        "Candidate forwarder stopped"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::EndpointHandle;

    fn record(caller: &str, callee: &str) -> Arc<PairRecord> {
        Arc::new(PairRecord {
            pipeline: PipelineHandle {
                id: format!("p-{caller}-{callee}"),
                caller: EndpointHandle(format!("ep-{caller}")),
                callee: EndpointHandle(format!("ep-{callee}")),
            },
            caller: Participant {
                name: caller.to_string(),
                connection_id: format!("c-{caller}"),
            },
            callee: Participant {
                name: callee.to_string(),
                connection_id: format!("c-{callee}"),
            },
            cancel_token: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn test_insert_pair_is_symmetric_and_exclusive() {
        let map = PipelineMap::new();
        let ab = record("a", "b");
        assert!(map.insert_pair(&ab).await);
        assert!(map.contains("c-a").await);
        assert!(map.contains("c-b").await);

        // b is already mapped, so nothing of b-c is inserted
        let bc = record("b", "c");
        assert!(!map.insert_pair(&bc).await);
        assert!(!map.contains("c-c").await);
        assert_eq!(map.len().await, 2);
    }

    #[tokio::test]
    async fn test_remove_pair_removes_both_sides_once() {
        let map = PipelineMap::new();
        let ab = record("a", "b");
        map.insert_pair(&ab).await;

        let removed = map.remove_pair("c-b").await.unwrap();
        assert!(Arc::ptr_eq(&removed, &ab));
        assert!(map.is_empty().await);

        assert!(map.remove_pair("c-a").await.is_none());
        assert!(!map.remove_record(&ab).await);
    }

    #[tokio::test]
    async fn test_remove_record_ignores_replaced_record() {
        let map = PipelineMap::new();
        let first = record("a", "b");
        map.insert_pair(&first).await;
        map.remove_pair("c-a").await;

        let second = record("a", "b");
        map.insert_pair(&second).await;

        assert!(!map.remove_record(&first).await);
        assert_eq!(map.len().await, 2);
        assert!(map.remove_record(&second).await);
    }

    #[test]
    fn test_counterpart_of() {
        let ab = record("a", "b");
        assert_eq!(ab.counterpart_of("c-a").name, "b");
        assert_eq!(ab.counterpart_of("c-b").name, "a");
    }
}
