//! Media negotiation engine abstraction.
//!
//! The signaling core never talks to a media server directly. It drives a
//! [`MediaEngine`], which owns one pipeline per pair with one endpoint per
//! side. [`kurento::KurentoClient`] is the production implementation; tests
//! substitute a scripted mock.

pub mod kurento;

use crate::protocol::IceCandidate;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a media engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine could not be reached or dropped the connection.
    #[error("Media engine unreachable: {0}")]
    Unreachable(String),

    /// The engine refused an offer it could not parse.
    #[error("Malformed offer: {0}")]
    MalformedOffer(String),

    /// The engine ran out of capacity for new media objects.
    #[error("Media engine resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other request failure.
    #[error("Media engine request failed: {0}")]
    Request(String),
}

/// Convenience alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Which side of a pair an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Caller,
    Callee,
}

impl Side {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Side::Caller => "caller",
            Side::Callee => "callee",
        }
    }
}

/// Opaque reference to an engine-side endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointHandle(pub String);

impl EndpointHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A media pipeline holding two interconnected endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineHandle {
    pub id: String,
    pub caller: EndpointHandle,
    pub callee: EndpointHandle,
}

impl PipelineHandle {
    /// Endpoint for the given side.
    #[must_use]
    pub fn endpoint(&self, side: Side) -> &EndpointHandle {
        match side {
            Side::Caller => &self.caller,
            Side::Callee => &self.callee,
        }
    }
}

/// Stream of candidates the engine discovers for one endpoint.
///
/// The stream ends when the endpoint is released or the engine goes away.
pub type CandidateStream = mpsc::UnboundedReceiver<IceCandidate>;

/// Media engine operations used by the orchestrator.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a pipeline with one endpoint per side, connected both ways.
    async fn create_pipeline(&self) -> EngineResult<PipelineHandle>;

    /// Endpoint for one side of an existing pipeline.
    fn endpoint(&self, pipeline: &PipelineHandle, side: Side) -> EndpointHandle {
        pipeline.endpoint(side).clone()
    }

    /// Process a client offer on an endpoint and return the answer.
    async fn generate_answer(&self, endpoint: &EndpointHandle, offer: &str) -> EngineResult<String>;

    /// Feed a remote candidate to an endpoint.
    async fn add_candidate(&self, endpoint: &EndpointHandle, candidate: &IceCandidate) -> EngineResult<()>;

    /// Start local candidate discovery on an endpoint.
    async fn gather_candidates(&self, endpoint: &EndpointHandle) -> EngineResult<()>;

    /// Subscribe to local candidates discovered on an endpoint.
    async fn subscribe_local_candidates(&self, endpoint: &EndpointHandle) -> EngineResult<CandidateStream>;

    /// Release a pipeline and everything attached to it.
    ///
    /// Releasing an already released pipeline is a no-op. Failures are
    /// logged by the implementation.
    async fn release(&self, pipeline: &PipelineHandle);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_endpoint_by_side() {
        let pipeline = PipelineHandle {
            id: "p1".to_string(),
            caller: EndpointHandle("ep-a".to_string()),
            callee: EndpointHandle("ep-b".to_string()),
        };
        assert_eq!(pipeline.endpoint(Side::Caller).id(), "ep-a");
        assert_eq!(pipeline.endpoint(Side::Callee).id(), "ep-b");
    }

    #[test]
    fn test_engine_error_display() {
        assert_eq!(
            EngineError::Unreachable("connection refused".to_string()).to_string(),
            "Media engine unreachable: connection refused"
        );
        assert_eq!(Side::Callee.as_str(), "callee");
    }
}
