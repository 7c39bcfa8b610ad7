//! Wire protocol
//!
//! Frames carry JSON. Inbound frames name an action, outbound frames carry a
//! message type plus whichever of snapshot, outcome and error apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::constants::net::{DEFAULT_DISPLAY_NAME, MAX_DISPLAY_NAME_CHARS};
use crate::game::error::GameError;
use crate::game::state::{Action, ParticipantId, SessionId};

pub use crate::game::state::SessionSnapshot;

/// Messages from client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Roll,
    Hold,
    /// Keepalive reply, only refreshes liveness
    Pong,
}

impl ClientMessage {
    /// The gameplay action this message submits, if any
    pub fn action(self) -> Option<Action> {
        match self {
            ClientMessage::Roll => Some(Action::Roll),
            ClientMessage::Hold => Some(Action::Hold),
            ClientMessage::Pong => None,
        }
    }
}

/// Outbound message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Joined,
    Started,
    Updated,
    Over,
    Left,
    Error,
    Ping,
}

/// What the event that produced an update did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Outcome {
    Rolled { value: u32, forfeited: bool },
    Held { banked: u32 },
    ParticipantJoined { name: String },
}

/// Error kinds surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    RuleViolation,
    NotFound,
    Busy,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&GameError> for WireError {
    fn from(err: &GameError) -> Self {
        let kind = match err {
            GameError::RuleViolation(_) => ErrorKind::RuleViolation,
            GameError::ParticipantNotFound(_) => ErrorKind::NotFound,
            GameError::InvariantBreach(_) => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<&ValidationError> for WireError {
    fn from(err: &ValidationError) -> Self {
        Self::new(ErrorKind::ValidationError, err.to_string())
    }
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    fn new(kind: MessageType) -> Self {
        Self {
            kind,
            participant_id: None,
            state: None,
            outcome: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Private acknowledgement of a join
    pub fn joined(participant_id: ParticipantId, state: SessionSnapshot) -> Self {
        Self {
            participant_id: Some(participant_id),
            state: Some(state),
            ..Self::new(MessageType::Joined)
        }
    }

    pub fn started(state: SessionSnapshot) -> Self {
        Self {
            state: Some(state),
            ..Self::new(MessageType::Started)
        }
    }

    pub fn updated(participant_id: ParticipantId, outcome: Outcome, state: SessionSnapshot) -> Self {
        Self {
            participant_id: Some(participant_id),
            outcome: Some(outcome),
            state: Some(state),
            ..Self::new(MessageType::Updated)
        }
    }

    /// Final state; `outcome` is the action that ended the game, if one did
    pub fn over(
        participant_id: ParticipantId,
        outcome: Option<Outcome>,
        state: SessionSnapshot,
    ) -> Self {
        Self {
            participant_id: Some(participant_id),
            outcome,
            state: Some(state),
            ..Self::new(MessageType::Over)
        }
    }

    pub fn left(participant_id: ParticipantId, state: SessionSnapshot) -> Self {
        Self {
            participant_id: Some(participant_id),
            state: Some(state),
            ..Self::new(MessageType::Left)
        }
    }

    pub fn error(error: WireError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(MessageType::Error)
        }
    }

    /// Keepalive probe
    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }
}

/// Body of a create or find-or-create request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRequest {
    #[serde(default)]
    pub participant_name: String,
    /// Target score; zero or absent means the server default
    #[serde(default)]
    pub target: Option<u32>,
}

/// Response to create or find-or-create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResponse {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub join_endpoint: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// One entry of the session listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub participant_count: usize,
    /// Participants with a live connection
    pub connected: usize,
    pub capacity: usize,
    pub started: bool,
    pub over: bool,
    pub created_at: DateTime<Utc>,
    pub target: u32,
}

impl SessionInfo {
    pub fn from_snapshot(snapshot: &SessionSnapshot, connected: usize) -> Self {
        Self {
            session_id: snapshot.session_id,
            participant_count: snapshot.participants.len(),
            connected,
            capacity: snapshot.capacity,
            started: snapshot.started,
            over: snapshot.over,
            created_at: snapshot.created_at,
            target: snapshot.target,
        }
    }
}

/// Malformed input at the process boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },
    #[error("invalid display name")]
    InvalidName,
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

/// Encode a message as JSON
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(message).map_err(|e| EncodeError(e.to_string()))
}

/// Decode a JSON message
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ValidationError> {
    serde_json::from_slice(data).map_err(|e| ValidationError::Malformed(e.to_string()))
}

/// Clean up a display name: trim, strip control and markup characters,
/// limit length, collapse whitespace. An empty input gets the default name.
pub fn sanitize_display_name(raw: &str) -> Result<String, ValidationError> {
    if raw.trim().is_empty() {
        return Ok(DEFAULT_DISPLAY_NAME.to_string());
    }

    let name: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .filter(|c| *c != '<' && *c != '>' && *c != '&')
        .take(MAX_DISPLAY_NAME_CHARS)
        .collect();
    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");

    if name.is_empty() {
        Err(ValidationError::InvalidName)
    } else {
        Ok(name)
    }
}

/// Parameters of a join handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub name: String,
}

impl JoinRequest {
    /// Route prefix of the join handshake path
    pub const ROUTE: &'static str = "/game/";

    /// Parse `/game/{session_id}?participantId=…&participantName=…`
    pub fn from_path(path: &str) -> Result<Self, ValidationError> {
        let (route, query) = path.split_once('?').unwrap_or((path, ""));
        let raw_session = route
            .strip_prefix(Self::ROUTE)
            .map(|s| s.trim_end_matches('/'))
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingParameter("session_id"))?;
        let session_id = parse_uuid("session_id", raw_session)?;

        let mut participant_id = None;
        let mut name = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "participantId" => participant_id = Some(parse_uuid("participantId", value)?),
                "participantName" => name = Some(percent_decode(value)?),
                _ => {}
            }
        }

        let participant_id =
            participant_id.ok_or(ValidationError::MissingParameter("participantId"))?;
        let name = sanitize_display_name(name.as_deref().unwrap_or(""))?;

        Ok(Self {
            session_id,
            participant_id,
            name,
        })
    }

    /// Render the handshake path
    pub fn to_path(&self) -> String {
        format!(
            "{}{}?participantId={}&participantName={}",
            Self::ROUTE,
            self.session_id,
            self.participant_id,
            percent_encode(&self.name)
        )
    }
}

fn parse_uuid(name: &'static str, value: &str) -> Result<Uuid, ValidationError> {
    Uuid::parse_str(value).map_err(|_| ValidationError::InvalidParameter {
        name,
        value: value.to_string(),
    })
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(value: &str) -> Result<String, ValidationError> {
    let invalid = || ValidationError::InvalidParameter {
        name: "participantName",
        value: value.to_string(),
    };

    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).ok_or_else(invalid)?;
                let hex = std::str::from_utf8(hex).map_err(|_| invalid())?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| invalid())
}
