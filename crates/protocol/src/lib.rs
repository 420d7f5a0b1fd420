//! Gateway wire protocol definitions, client side.
//!
//! Protocol version 3. All traffic is JSON frames over a single WebSocket:
//!
//! - `Frame::Request`  — client → gateway RPC call
//! - `Frame::Response` — gateway → client RPC result
//! - `Frame::Event`    — gateway → client server-push

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 3;
/// Inbound message size cap. Bounds memory against a misbehaving gateway.
pub const MAX_FRAME_BYTES: usize = 25 * 1024 * 1024; // 25 MiB
/// Window in which an unsolicited `connect.challenge` may precede `connect`.
pub const CHALLENGE_WAIT_MS: u64 = 2_000;
/// How long to wait for the gateway's response to `connect`.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

// ── Well-known names ─────────────────────────────────────────────────────────

pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const CHAT_SEND: &str = "chat.send";
    pub const AGENT: &str = "agent";
    pub const SEND: &str = "send";
}

pub mod events {
    /// Streamed chat progress for a session.
    pub const CHAT: &str = "chat";
    /// Heartbeat. Carries nothing of interest.
    pub const TICK: &str = "tick";
    /// Server-initiated authentication challenge.
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    /// Wildcard registration: receive every event.
    pub const WILDCARD: &str = "*";
}

pub mod status {
    /// Intermediate acknowledgment of a request still being processed.
    pub const ACCEPTED: &str = "accepted";
    pub const ERROR: &str = "error";
}

pub mod roles {
    pub const OPERATOR: &str = "operator";
}

pub mod scopes {
    pub const ADMIN: &str = "operator.admin";
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Discriminated union of everything that crosses the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

/// Raised when a frame cannot cross the codec.
#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {0}")]
pub struct FrameError(#[from] serde_json::Error);

impl Frame {
    /// Build an outbound request frame.
    pub fn request(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Decode a single wire frame.
    pub fn decode(raw: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error body attached to a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default = "default_error_message")]
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

fn default_error_message() -> String {
    "unknown error".into()
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Parameters the client sends in the initial `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub caps: Vec<String>,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
}

/// Identity the gateway checks against its pre-registered client list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Payload of a successful `connect` response. The gateway sends more than
/// this; only the negotiated protocol matters to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "connId", default)]
    pub conn_id: Option<String>,
}

/// Payload of a `connect.challenge` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub nonce: String,
}

// ── Chat events ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Delta,
    Final,
    Error,
    Aborted,
}

/// Payload of a `chat` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEventPayload {
    pub session_key: String,
    pub state: ChatState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub content: Vec<ContentItem>,
}

impl ChatMessage {
    /// Concatenated text of all `text` content items, in order.
    /// `None` when the message carries no text items at all.
    pub fn joined_text(&self) -> Option<String> {
        let mut out = String::new();
        let mut any = false;
        for item in &self.content {
            if item.kind == "text"
                && let Some(text) = &item.text
            {
                out.push_str(text);
                any = true;
            }
        }
        any.then_some(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: Some(text.into()),
        }
    }
}

// ── Request parameters ───────────────────────────────────────────────────────

/// Parameters of a `chat.send` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub session_key: String,
    pub message: String,
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

/// Inline attachment shipped with `chat.send`. `content` is base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub mime_type: String,
    pub content: String,
}

impl Attachment {
    pub fn image(mime_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: "image".into(),
            mime_type: mime_type.into(),
            content: content.into(),
        }
    }
}

/// Parameters of an `agent` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentParams {
    pub message: String,
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

/// Parameters of a direct `send` to a delivery target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendParams {
    pub to: String,
    pub message: String,
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}
