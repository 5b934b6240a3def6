//! Kurento Media Server client (JSON-RPC 2.0 over WebSocket).
//!
//! One WebSocket carries every request. A writer task owns the sink, a reader
//! task owns the stream and completes pending requests by JSON-RPC id. Engine
//! events (`onEvent`) are routed to the candidate subscriber of the endpoint
//! that emitted them.

use super::{CandidateStream, EndpointHandle, EngineError, EngineResult, MediaEngine, PipelineHandle};
use crate::protocol::IceCandidate;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Interval between keepalive pings. Kurento drops sessions it has not heard from.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Error payload of a JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<RpcErrorData>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcErrorData {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl RpcError {
    fn into_engine_error(self, method: &str, operation: Option<&str>) -> EngineError {
        let detail = format!("{} (code {})", self.message, self.code);
        if self
            .data
            .as_ref()
            .and_then(|d| d.kind.as_deref())
            .is_some_and(|k| k == "NOT_ENOUGH_RESOURCES")
        {
            return EngineError::ResourceExhausted(detail);
        }
        if operation == Some("processOffer") {
            return EngineError::MalformedOffer(detail);
        }
        EngineError::Request(format!("{method}: {detail}"))
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>;

struct Shared {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<PendingMap>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<IceCandidate>>>,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    connection_lost: CancellationToken,
    request_timeout: Duration,
}

/// `MediaEngine` backed by a Kurento Media Server.
#[derive(Clone)]
pub struct KurentoClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for KurentoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KurentoClient")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl KurentoClient {
    /// Connect to the engine at `uri` and start the I/O tasks.
    ///
    /// The tasks stop when `cancel_token` is cancelled or the socket closes.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Unreachable` if the WebSocket handshake fails.
    pub async fn connect(
        uri: &str,
        request_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> EngineResult<Self> {
        let (ws_stream, _) = connect_async(uri)
            .await
            .map_err(|e| EngineError::Unreachable(format!("connect failed: {e}")))?;

        let (write, read) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            outbound,
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            connection_lost: CancellationToken::new(),
            request_timeout,
        });

        tokio::spawn(writer_task(write, outbound_rx, cancel_token.clone()));
        tokio::spawn(reader_task(read, Arc::clone(&shared), cancel_token.clone()));

        let client = Self { shared };
        tokio::spawn(client.clone().keepalive_task(cancel_token));

        info!(target: "signaling.engine.kurento", "Connected to media engine");
        Ok(client)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Token cancelled once the engine socket is gone.
    #[must_use]
    pub fn connection_lost(&self) -> CancellationToken {
        self.shared.connection_lost.clone()
    }

    async fn keepalive_task(self, cancel_token: CancellationToken) {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let interval_ms = u64::try_from(KEEPALIVE_INTERVAL.as_millis()).unwrap_or(u64::MAX);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                () = self.shared.connection_lost.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.request("ping", json!({ "interval": interval_ms })).await {
                        warn!(target: "signaling.engine.kurento", error = %e, "Keepalive ping failed");
                    }
                }
            }
        }
    }

    /// Send one request and wait for its response.
    async fn request(&self, method: &str, mut params: Value) -> EngineResult<Value> {
        if let (Some(session_id), Value::Object(map)) =
            (self.shared.session_id.read().await.clone(), &mut params)
        {
            map.insert("sessionId".to_string(), Value::String(session_id));
        }

        let operation = params
            .get("operation")
            .and_then(Value::as_str)
            .map(str::to_string);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        if self.shared.outbound.send(Message::Text(frame)).is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(EngineError::Unreachable("connection closed".to_string()));
        }

        let response = match tokio::time::timeout(self.shared.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(EngineError::Unreachable("connection closed".to_string())),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                return Err(EngineError::Unreachable(format!("{method} timed out")));
            }
        };

        let result = response.map_err(|e| e.into_engine_error(method, operation.as_deref()))?;
        if let Some(session_id) = result.get("sessionId").and_then(Value::as_str) {
            let mut current = self.shared.session_id.write().await;
            if current.as_deref() != Some(session_id) {
                *current = Some(session_id.to_string());
            }
        }
        Ok(result)
    }

    async fn create(&self, kind: &str, constructor_params: Value) -> EngineResult<String> {
        let result = self
            .request(
                "create",
                json!({
                    "type": kind,
                    "constructorParams": constructor_params,
                    "properties": {},
                }),
            )
            .await?;
        value_str(&result, "create")
    }

    async fn invoke(&self, object: &str, operation: &str, operation_params: Value) -> EngineResult<Value> {
        self.request(
            "invoke",
            json!({
                "object": object,
                "operation": operation,
                "operationParams": operation_params,
            }),
        )
        .await
    }

    async fn build_pipeline(&self, pipeline_id: &str) -> EngineResult<PipelineHandle> {
        let caller = self
            .create("WebRtcEndpoint", json!({ "mediaPipeline": pipeline_id }))
            .await?;
        let callee = self
            .create("WebRtcEndpoint", json!({ "mediaPipeline": pipeline_id }))
            .await?;

        self.invoke(&caller, "connect", json!({ "sink": callee })).await?;
        self.invoke(&callee, "connect", json!({ "sink": caller })).await?;

        Ok(PipelineHandle {
            id: pipeline_id.to_string(),
            caller: EndpointHandle(caller),
            callee: EndpointHandle(callee),
        })
    }
}

#[async_trait]
impl MediaEngine for KurentoClient {
    #[instrument(skip_all, name = "signaling.engine.create_pipeline")]
    async fn create_pipeline(&self) -> EngineResult<PipelineHandle> {
        let pipeline_id = self.create("MediaPipeline", json!({})).await?;

        match self.build_pipeline(&pipeline_id).await {
            Ok(handle) => {
                debug!(
                    target: "signaling.engine.kurento",
                    pipeline_id = %handle.id,
                    "Pipeline created"
                );
                Ok(handle)
            }
            Err(e) => {
                // Releasing the pipeline releases any endpoint already created in it.
                if let Err(release_err) = self.request("release", json!({ "object": pipeline_id })).await {
                    warn!(
                        target: "signaling.engine.kurento",
                        pipeline_id = %pipeline_id,
                        error = %release_err,
                        "Failed to release partially built pipeline"
                    );
                }
                Err(e)
            }
        }
    }

    async fn generate_answer(&self, endpoint: &EndpointHandle, offer: &str) -> EngineResult<String> {
        let result = self
            .invoke(endpoint.id(), "processOffer", json!({ "offer": offer }))
            .await?;
        value_str(&result, "processOffer")
    }

    async fn add_candidate(&self, endpoint: &EndpointHandle, candidate: &IceCandidate) -> EngineResult<()> {
        self.invoke(
            endpoint.id(),
            "addIceCandidate",
            json!({
                "candidate": {
                    "__module__": "kurento",
                    "__type__": "IceCandidate",
                    "candidate": candidate.candidate,
                    "sdpMid": candidate.sdp_mid,
                    "sdpMLineIndex": candidate.sdp_m_line_index,
                }
            }),
        )
        .await
        .map(|_| ())
    }

    async fn gather_candidates(&self, endpoint: &EndpointHandle) -> EngineResult<()> {
        self.invoke(endpoint.id(), "gatherCandidates", json!({}))
            .await
            .map(|_| ())
    }

    async fn subscribe_local_candidates(&self, endpoint: &EndpointHandle) -> EngineResult<CandidateStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscriptions
            .lock()
            .await
            .insert(endpoint.id().to_string(), tx);

        let subscribed = self
            .request(
                "subscribe",
                json!({ "type": "IceCandidateFound", "object": endpoint.id() }),
            )
            .await;

        if let Err(e) = subscribed {
            self.shared.subscriptions.lock().await.remove(endpoint.id());
            return Err(e);
        }
        Ok(rx)
    }

    async fn release(&self, pipeline: &PipelineHandle) {
        {
            let mut subscriptions = self.shared.subscriptions.lock().await;
            subscriptions.remove(pipeline.caller.id());
            subscriptions.remove(pipeline.callee.id());
        }

        match self.request("release", json!({ "object": pipeline.id })).await {
            Ok(_) => debug!(
                target: "signaling.engine.kurento",
                pipeline_id = %pipeline.id,
                "Pipeline released"
            ),
            Err(e) => warn!(
                target: "signaling.engine.kurento",
                pipeline_id = %pipeline.id,
                error = %e,
                "Pipeline release failed"
            ),
        }
    }
}

fn value_str(result: &Value, method: &str) -> EngineResult<String> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::Request(format!("{method}: response without value")))
}

async fn writer_task<S>(
    mut write: S,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    cancel_token: CancellationToken,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write.send(msg).await {
                    warn!(target: "signaling.engine.kurento", error = %e, "Engine socket write failed");
                    break;
                }
            }
        }
    }
    debug!(target: "signaling.engine.kurento", "Engine writer stopped");
}

async fn reader_task<S, E>(mut read: S, shared: Arc<Shared>, cancel_token: CancellationToken)
where
    S: futures_util::Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => break,
            frame = read.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_frame(&shared, &text).await,
            Some(Ok(Message::Close(_))) | None => {
                info!(target: "signaling.engine.kurento", "Engine socket closed");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(target: "signaling.engine.kurento", error = %e, "Engine socket read failed");
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.connection_lost.cancel();
    // Dropping the senders fails every in-flight request and ends every candidate stream.
    shared.pending.lock().await.clear();
    shared.subscriptions.lock().await.clear();
}

async fn handle_frame(shared: &Shared, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(target: "signaling.engine.kurento", error = %e, "Unparsable engine frame");
            return;
        }
    };

    if frame.get("method").and_then(Value::as_str) == Some("onEvent") {
        route_event(shared, &frame).await;
        return;
    }

    let Some(id) = frame.get("id").and_then(Value::as_u64) else {
        return;
    };
    let Some(responder) = shared.pending.lock().await.remove(&id) else {
        debug!(target: "signaling.engine.kurento", id = id, "Response for unknown request");
        return;
    };

    let outcome = match frame.get("error") {
        Some(error) => Err(serde_json::from_value::<RpcError>(error.clone()).unwrap_or(RpcError {
            code: 0,
            message: error.to_string(),
            data: None,
        })),
        None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = responder.send(outcome);
}

async fn route_event(shared: &Shared, frame: &Value) {
    let Some(value) = frame.get("params").and_then(|p| p.get("value")) else {
        return;
    };
    if value.get("type").and_then(Value::as_str) != Some("IceCandidateFound") {
        return;
    }

    let data = value.get("data");
    let source = data
        .and_then(|d| d.get("source"))
        .or_else(|| value.get("object"))
        .and_then(Value::as_str);
    let candidate = data
        .and_then(|d| d.get("candidate"))
        .and_then(|c| serde_json::from_value::<IceCandidate>(c.clone()).ok());

    let (Some(source), Some(candidate)) = (source, candidate) else {
        debug!(target: "signaling.engine.kurento", "Ignoring malformed IceCandidateFound event");
        return;
    };

    let subscriptions = shared.subscriptions.lock().await;
    if let Some(tx) = subscriptions.get(source) {
        let _ = tx.send(candidate);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_mapping() {
        let err = RpcError {
            code: 40208,
            message: "SDP parse error".to_string(),
            data: None,
        };
        assert!(matches!(
            err.into_engine_error("invoke", Some("processOffer")),
            EngineError::MalformedOffer(_)
        ));

        let err = RpcError {
            code: 40001,
            message: "no room".to_string(),
            data: Some(RpcErrorData {
                kind: Some("NOT_ENOUGH_RESOURCES".to_string()),
            }),
        };
        assert!(matches!(
            err.into_engine_error("create", None),
            EngineError::ResourceExhausted(_)
        ));

        let err = RpcError {
            code: 40101,
            message: "object not found".to_string(),
            data: None,
        };
        assert_eq!(
            err.into_engine_error("invoke", Some("gatherCandidates")),
            EngineError::Request("invoke: object not found (code 40101)".to_string())
        );
    }

    #[test]
    fn test_value_str() {
        assert_eq!(value_str(&json!({ "value": "abc" }), "create").unwrap(), "abc");
        assert!(value_str(&json!({}), "create").is_err());
    }
}
