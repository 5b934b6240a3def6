//! Mock media engine for signaling tests.
//!
//! Provides a scripted [`MediaEngine`] that can be configured to:
//! - Fail any step with a chosen [`EngineError`]
//! - Hang any step forever (for timeout and cancellation tests)
//! - Record every call, candidate and release it sees
//! - Emit local candidates to subscribed endpoints on demand
//!
//! # Example
//!
//! ```rust,ignore
//! use signaling_test_utils::{EngineStep, MockMediaEngine};
//!
//! let engine = MockMediaEngine::builder()
//!     .fail(EngineStep::GenerateAnswer, EngineError::MalformedOffer("bad sdp".into()))
//!     .build();
//!
//! // Hand `engine.clone()` to the service and assert on `engine.released()`.
//! ```

use async_trait::async_trait;
use signaling_service::engine::{
    CandidateStream, EndpointHandle, EngineError, EngineResult, MediaEngine, PipelineHandle,
};
use signaling_service::protocol::IceCandidate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Engine operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStep {
    CreatePipeline,
    GenerateAnswer,
    AddCandidate,
    GatherCandidates,
    Subscribe,
}

#[derive(Debug, Clone)]
enum Fault {
    Fail(EngineError),
    Hang,
}

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreatePipeline { pipeline_id: String },
    GenerateAnswer { endpoint: String, offer: String },
    AddCandidate { endpoint: String, candidate: String },
    GatherCandidates { endpoint: String },
    Subscribe { endpoint: String },
    Release { pipeline_id: String },
}

#[derive(Default)]
struct MockState {
    calls: Vec<EngineCall>,
    candidates: HashMap<String, Vec<IceCandidate>>,
    subscribers: HashMap<String, mpsc::UnboundedSender<IceCandidate>>,
    released: Vec<String>,
}

/// Scripted [`MediaEngine`].
pub struct MockMediaEngine {
    faults: HashMap<EngineStep, Fault>,
    next_pipeline: AtomicU64,
    state: Mutex<MockState>,
}

impl MockMediaEngine {
    /// Create a new `MockMediaEngine` builder.
    #[must_use]
    pub fn builder() -> MockMediaEngineBuilder {
        MockMediaEngineBuilder::default()
    }

    /// An engine where every step succeeds.
    #[must_use]
    pub fn healthy() -> Arc<Self> {
        Self::builder().build()
    }

    /// Answer the mock produces for `offer`.
    #[must_use]
    pub fn answer_for(offer: &str) -> String {
        format!("answer:{offer}")
    }

    /// All calls in the order they were made.
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.clone()
    }

    /// Candidates fed into `endpoint`, in the order they arrived.
    #[must_use]
    pub fn candidates_for(&self, endpoint: &str) -> Vec<IceCandidate> {
        self.state()
            .candidates
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    /// Ids of released pipelines, one entry per `release` call.
    #[must_use]
    pub fn released(&self) -> Vec<String> {
        self.state().released.clone()
    }

    /// Number of pipelines created so far.
    #[must_use]
    pub fn pipelines_created(&self) -> u64 {
        self.next_pipeline.load(Ordering::SeqCst)
    }

    /// Whether `endpoint` has a live local candidate subscription.
    #[must_use]
    pub fn is_subscribed(&self, endpoint: &str) -> bool {
        self.state().subscribers.contains_key(endpoint)
    }

    /// Simulate the engine discovering a local candidate on `endpoint`.
    ///
    /// Returns false if nobody is subscribed to that endpoint.
    pub fn emit_local_candidate(&self, endpoint: &str, candidate: IceCandidate) -> bool {
        self.state()
            .subscribers
            .get(endpoint)
            .is_some_and(|tx| tx.send(candidate).is_ok())
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: EngineCall) {
        self.state().calls.push(call);
    }

    async fn apply_fault(&self, step: EngineStep) -> EngineResult<()> {
        match self.faults.get(&step) {
            None => Ok(()),
            Some(Fault::Fail(error)) => Err(error.clone()),
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_pipeline(&self) -> EngineResult<PipelineHandle> {
        self.apply_fault(EngineStep::CreatePipeline).await?;

        let n = self.next_pipeline.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("pipeline-{n}");
        self.record(EngineCall::CreatePipeline {
            pipeline_id: id.clone(),
        });
        Ok(PipelineHandle {
            caller: EndpointHandle(format!("{id}/caller")),
            callee: EndpointHandle(format!("{id}/callee")),
            id,
        })
    }

    async fn generate_answer(&self, endpoint: &EndpointHandle, offer: &str) -> EngineResult<String> {
        self.record(EngineCall::GenerateAnswer {
            endpoint: endpoint.id().to_string(),
            offer: offer.to_string(),
        });
        self.apply_fault(EngineStep::GenerateAnswer).await?;
        Ok(Self::answer_for(offer))
    }

    async fn add_candidate(&self, endpoint: &EndpointHandle, candidate: &IceCandidate) -> EngineResult<()> {
        self.apply_fault(EngineStep::AddCandidate).await?;
        let mut state = self.state();
        state.calls.push(EngineCall::AddCandidate {
            endpoint: endpoint.id().to_string(),
            candidate: candidate.candidate.clone(),
        });
        state
            .candidates
            .entry(endpoint.id().to_string())
            .or_default()
            .push(candidate.clone());
        Ok(())
    }

    async fn gather_candidates(&self, endpoint: &EndpointHandle) -> EngineResult<()> {
        self.record(EngineCall::GatherCandidates {
            endpoint: endpoint.id().to_string(),
        });
        self.apply_fault(EngineStep::GatherCandidates).await
    }

    async fn subscribe_local_candidates(&self, endpoint: &EndpointHandle) -> EngineResult<CandidateStream> {
        self.apply_fault(EngineStep::Subscribe).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.calls.push(EngineCall::Subscribe {
            endpoint: endpoint.id().to_string(),
        });
        state.subscribers.insert(endpoint.id().to_string(), tx);
        Ok(rx)
    }

    async fn release(&self, pipeline: &PipelineHandle) {
        let mut state = self.state();
        state.calls.push(EngineCall::Release {
            pipeline_id: pipeline.id.clone(),
        });
        state.released.push(pipeline.id.clone());
        state.subscribers.remove(pipeline.caller.id());
        state.subscribers.remove(pipeline.callee.id());
    }
}

/// Builder for [`MockMediaEngine`].
#[derive(Debug, Default)]
pub struct MockMediaEngineBuilder {
    faults: HashMap<EngineStep, Fault>,
}

impl MockMediaEngineBuilder {
    /// Make every call of `step` fail with `error`.
    #[must_use]
    pub fn fail(mut self, step: EngineStep, error: EngineError) -> Self {
        self.faults.insert(step, Fault::Fail(error));
        self
    }

    /// Make every call of `step` never complete.
    #[must_use]
    pub fn hang(mut self, step: EngineStep) -> Self {
        self.faults.insert(step, Fault::Hang);
        self
    }

    /// Build the `MockMediaEngine`.
    #[must_use]
    pub fn build(self) -> Arc<MockMediaEngine> {
        Arc::new(MockMediaEngine {
            faults: self.faults,
            next_pipeline: AtomicU64::new(0),
            state: Mutex::new(MockState::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_candidates_per_endpoint_in_order() {
        let engine = MockMediaEngine::healthy();
        let pipeline = engine.create_pipeline().await.unwrap();

        for n in 0..3 {
            engine
                .add_candidate(&pipeline.caller, &IceCandidate::new(format!("c{n}"), "0", 0))
                .await
                .unwrap();
        }

        let got: Vec<_> = engine
            .candidates_for(pipeline.caller.id())
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(got, vec!["c0", "c1", "c2"]);
        assert!(engine.candidates_for(pipeline.callee.id()).is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let engine = MockMediaEngine::builder()
            .fail(EngineStep::CreatePipeline, EngineError::ResourceExhausted("full".into()))
            .build();

        let result = engine.create_pipeline().await;
        assert!(matches!(result, Err(EngineError::ResourceExhausted(_))));
        assert_eq!(engine.pipelines_created(), 0);
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber_until_release() {
        let engine = MockMediaEngine::healthy();
        let pipeline = engine.create_pipeline().await.unwrap();
        let mut stream = engine
            .subscribe_local_candidates(&pipeline.callee)
            .await
            .unwrap();

        assert!(engine.emit_local_candidate(pipeline.callee.id(), IceCandidate::new("x", "0", 0)));
        assert_eq!(stream.recv().await.unwrap().candidate, "x");

        engine.release(&pipeline).await;
        assert!(!engine.emit_local_candidate(pipeline.callee.id(), IceCandidate::new("y", "0", 0)));
        assert_eq!(engine.released(), vec![pipeline.id]);
    }
}
