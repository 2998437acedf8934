//! Wire types shared by the producer and consumer sides of the relay
//!
//! All types use camelCase JSON serialization for wire compatibility.
//! `Event` is the unit flowing through the Outbound Channel; its `data`
//! payload is keyed by `action`.

use serde::{Deserialize, Serialize};

/// Event action tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Token,
    FinalResponse,
    ToolAction,
    Error,
    Heartbeat,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Token => write!(f, "token"),
            Action::FinalResponse => write!(f, "final_response"),
            Action::ToolAction => write!(f, "tool_action"),
            Action::Error => write!(f, "error"),
            Action::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// Message direction relative to the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    In,
    #[default]
    #[serde(rename = "OUT")]
    Out,
}

/// One streamed token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    /// Per-invocation position, starting at 1
    pub sequence_number: u64,

    /// Token text
    pub value: String,

    /// Identifies the invocation that produced the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Terminal answer of an invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResponse {
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,

    /// Sources the agent consulted, as produced by the runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Human-readable description of a tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolActionData {
    pub tool_name: String,
    pub tool_action: String,
    pub invocation_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Error surfaced to the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Action-specific payload of an `Event`
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Token(TokenData),
    FinalResponse(FinalResponse),
    ToolAction(ToolActionData),
    Error(ErrorData),
    Heartbeat,
}

impl EventData {
    /// The action tag this payload is published under
    pub fn action(&self) -> Action {
        match self {
            EventData::Token(_) => Action::Token,
            EventData::FinalResponse(_) => Action::FinalResponse,
            EventData::ToolAction(_) => Action::ToolAction,
            EventData::Error(_) => Action::Error,
            EventData::Heartbeat => Action::Heartbeat,
        }
    }

    /// Invocation that produced this payload, when the producer stamped one
    pub fn run_id(&self) -> Option<&str> {
        match self {
            EventData::Token(token) => token.run_id.as_deref(),
            EventData::FinalResponse(response) => response.run_id.as_deref(),
            EventData::ToolAction(action) => action.run_id.as_deref(),
            EventData::Error(error) => error.run_id.as_deref(),
            EventData::Heartbeat => None,
        }
    }

    /// Stamp the producing invocation; heartbeats carry none
    pub(crate) fn set_run_id(&mut self, run_id: &str) {
        let slot = match self {
            EventData::Token(token) => &mut token.run_id,
            EventData::FinalResponse(response) => &mut response.run_id,
            EventData::ToolAction(action) => &mut action.run_id,
            EventData::Error(error) => &mut error.run_id,
            EventData::Heartbeat => return,
        };
        *slot = Some(run_id.to_string());
    }
}

/// A single unit of streamed output or annotation
///
/// Immutable once published; consumers only read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent", into = "WireEvent")]
pub struct Event {
    pub session_id: String,
    pub user_id: String,

    /// Set by the publisher; the relay defaults it to `OUT`
    pub direction: Option<Direction>,

    /// Producer wall-clock stamp in Unix milliseconds (advisory)
    pub timestamp: u64,

    pub data: EventData,
}

impl Event {
    /// Create an outbound event stamped with the current time
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, data: EventData) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            direction: Some(Direction::Out),
            timestamp: now_millis(),
            data,
        }
    }

    /// Create a token event
    pub fn token(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        sequence_number: u64,
        value: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            user_id,
            EventData::Token(TokenData {
                sequence_number,
                value: value.into(),
                run_id: None,
            }),
        )
    }

    /// Create an error event
    pub fn error(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            user_id,
            EventData::Error(ErrorData {
                message: message.into(),
                run_id: None,
            }),
        )
    }

    pub fn action(&self) -> Action {
        self.data.action()
    }

    /// Ordering key; only token events carry one
    pub fn sequence_number(&self) -> Option<u64> {
        match &self.data {
            EventData::Token(token) => Some(token.sequence_number),
            _ => None,
        }
    }

    /// Whether this event ends an invocation
    pub fn is_terminal(&self) -> bool {
        matches!(self.data, EventData::FinalResponse(_) | EventData::Error(_))
    }
}

/// Wire shape of an `Event`: `{action, sessionId, userId, direction, timestamp, data}`
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    action: Action,
    session_id: String,
    user_id: String,
    #[serde(default)]
    direction: Option<Direction>,
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    data: serde_json::Value,
}

/// Serialized form of an `Event`; `data` is written as the payload itself
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    action: Action,
    session_id: String,
    user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    direction: Option<Direction>,
    timestamp: u64,
    data: WireData,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireData {
    Token(TokenEnvelope),
    FinalResponse(FinalResponse),
    ToolAction(ToolActionData),
    Error(ErrorData),
    Heartbeat(EmptyData),
}

/// Serializes as `{}`
#[derive(Serialize)]
struct EmptyData {}

/// `data` of a token event nests the token under `token`
#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    token: TokenData,
}

impl TryFrom<RawEvent> for Event {
    type Error = serde_json::Error;

    fn try_from(raw: RawEvent) -> std::result::Result<Self, Self::Error> {
        let data = match raw.action {
            Action::Token => {
                let envelope: TokenEnvelope = serde_json::from_value(raw.data)?;
                EventData::Token(envelope.token)
            }
            Action::FinalResponse => EventData::FinalResponse(serde_json::from_value(raw.data)?),
            Action::ToolAction => EventData::ToolAction(serde_json::from_value(raw.data)?),
            Action::Error => EventData::Error(serde_json::from_value(raw.data)?),
            Action::Heartbeat => EventData::Heartbeat,
        };

        Ok(Self {
            session_id: raw.session_id,
            user_id: raw.user_id,
            direction: raw.direction,
            timestamp: raw.timestamp,
            data,
        })
    }
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        let action = event.action();
        let data = match event.data {
            EventData::Token(token) => WireData::Token(TokenEnvelope { token }),
            EventData::FinalResponse(body) => WireData::FinalResponse(body),
            EventData::ToolAction(body) => WireData::ToolAction(body),
            EventData::Error(body) => WireData::Error(body),
            EventData::Heartbeat => WireData::Heartbeat(EmptyData {}),
        };

        Self {
            action,
            session_id: event.session_id,
            user_id: event.user_id,
            direction: event.direction,
            timestamp: event.timestamp,
            data,
        }
    }
}

/// Action requested by a client on the Inbound Channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundAction {
    Run,
    Heartbeat,
    #[serde(other)]
    Unknown,
}

/// Arguments of an inbound request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallArguments {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
}

/// Message consumed from the Inbound Channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub action: InboundAction,
    #[serde(default)]
    pub direction: Direction,
    /// Client stamp; producers send either a number or a numeric string
    #[serde(default)]
    pub timestamp: serde_json::Value,
    pub user_id: String,
    pub data: CallArguments,
}

/// Routing context of a tool notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolContext {
    pub user_id: String,
    pub session_id: String,
    pub invocation_number: u32,
    /// Invocation whose agent made the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// One argument passed to a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub value: serde_json::Value,
}

/// Descriptor of the tool about to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub tool_name: String,
    #[serde(default)]
    pub tool_description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

/// Message carried by the Tool Notification Channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolNotification {
    pub context: ToolContext,
    pub data: ToolDescriptor,
}

/// Payload of one "publish to session" call on the delivery sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPush {
    pub session_id: String,
    pub user_id: String,
    /// Serialized `Event`
    pub data: String,
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
