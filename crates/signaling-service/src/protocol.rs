//! Signaling wire messages.
//!
//! Messages are JSON objects tagged by an `id` field with camelCase payload
//! fields. Unknown inbound kinds deserialize to [`ClientMessage::Unknown`] and
//! are dropped by the dispatcher so that clients speaking a newer or older
//! protocol revision do not break the connection.

use serde::{Deserialize, Serialize};

/// Connectivity candidate as exchanged with clients and the media engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute value.
    pub candidate: String,
    /// Media stream identification tag.
    pub sdp_mid: String,
    /// Index of the media description the candidate belongs to.
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: u32,
}

impl IceCandidate {
    #[must_use]
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_m_line_index: u32) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.into(),
            sdp_m_line_index,
        }
    }
}

/// Callee decision for an incoming call. Anything other than `accept` is a decline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDecision {
    Accept,
    #[serde(other)]
    Decline,
}

/// Outcome carried by `registerResponse` and `callResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Accepted,
    Rejected,
}

/// Messages sent from a client to the signaling service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Claim a display name, optionally joining a room and staging an offer.
    Register {
        name: String,
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        sdp_offer: Option<String>,
    },
    /// Ask the named session for a call.
    Call {
        to: String,
        #[serde(default)]
        from: Option<String>,
        sdp_offer: String,
    },
    /// Accept or decline a call announced by `incomingCall`.
    IncomingCallResponse {
        from: String,
        call_response: CallDecision,
        #[serde(default)]
        sdp_offer: Option<String>,
    },
    /// Connectivity candidate gathered by the client for its own endpoint.
    OnIceCandidate { candidate: IceCandidate },
    /// Tear down the current pair.
    Stop,
    /// Text relayed unmodified to the current peer.
    ChatMessage {
        #[serde(default)]
        body: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Bounded message kind label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::Call { .. } => "call",
            ClientMessage::IncomingCallResponse { .. } => "incomingCallResponse",
            ClientMessage::OnIceCandidate { .. } => "onIceCandidate",
            ClientMessage::Stop => "stop",
            ClientMessage::ChatMessage { .. } => "chatMessage",
            ClientMessage::Unknown => "unknown",
        }
    }
}

/// Messages sent from the signaling service to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RegisterResponse {
        response: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    IncomingCall {
        from: String,
    },
    CallResponse {
        response: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
    },
    StartCommunication {
        sdp_answer: String,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    StopCommunication,
    ChatMessage {
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
}

impl ServerMessage {
    pub fn register_accepted() -> Self {
        ServerMessage::RegisterResponse {
            response: ResponseStatus::Accepted,
            message: None,
        }
    }

    pub fn register_rejected(reason: impl Into<String>) -> Self {
        ServerMessage::RegisterResponse {
            response: ResponseStatus::Rejected,
            message: Some(reason.into()),
        }
    }

    pub fn call_accepted(sdp_answer: impl Into<String>) -> Self {
        ServerMessage::CallResponse {
            response: ResponseStatus::Accepted,
            message: None,
            sdp_answer: Some(sdp_answer.into()),
        }
    }

    pub fn call_rejected(reason: impl Into<String>) -> Self {
        ServerMessage::CallResponse {
            response: ResponseStatus::Rejected,
            message: Some(reason.into()),
            sdp_answer: None,
        }
    }

    /// Bounded message kind label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ServerMessage::RegisterResponse { .. } => "registerResponse",
            ServerMessage::IncomingCall { .. } => "incomingCall",
            ServerMessage::CallResponse { .. } => "callResponse",
            ServerMessage::StartCommunication { .. } => "startCommunication",
            ServerMessage::IceCandidate { .. } => "iceCandidate",
            ServerMessage::StopCommunication => "stopCommunication",
            ServerMessage::ChatMessage { .. } => "chatMessage",
        }
    }
}
