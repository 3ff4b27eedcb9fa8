//! prepl wire protocol: JSONL over TCP.
//!
//! Each line is one JSON object tagged by `type`. Requests carry an `id`
//! that is echoed on the matching response so clients can correlate them.
//!
//! # Session flow
//!
//! 1. Client connects; the server immediately sends `welcome`.
//! 2. Client sends `eval` / `ping` / `stats` requests, one per line.
//! 3. Every request gets exactly one response line.
//!
//! Evaluation errors come back as `error` responses and never close the
//! session. Framing errors (oversized or repeatedly malformed lines) do.
//!
//! # Usage
//!
//! ```ignore
//! use prepl_protocol::{ClientMessage, EvalMessage, ServerMessage};
//!
//! let msg = ClientMessage::Eval(EvalMessage { id: "1".into(), code: "1 + 1".into() });
//! let json = serde_json::to_string(&msg)?;
//!
//! let response: ServerMessage = serde_json::from_str(&line)?;
//! ```

use serde::{Deserialize, Serialize};

/// Current protocol version. Increment for breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single line (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Capabilities advertised in `welcome`.
pub const CAPABILITIES: &[&str] = &["eval", "host", "stats"];

// =============================================================================
// Client → Server Messages
// =============================================================================

/// Messages sent from a REPL client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Eval(EvalMessage),
    Ping(PingMessage),
    Stats(StatsMessage),
}

impl ClientMessage {
    /// Request ID of this message.
    pub fn id(&self) -> &str {
        match self {
            Self::Eval(m) => &m.id,
            Self::Ping(m) => &m.id,
            Self::Stats(m) => &m.id,
        }
    }
}

/// Evaluate a chunk of code in the session's evaluation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalMessage {
    pub id: String,
    pub code: String,
}

/// Ping for keepalive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingMessage {
    pub id: String,
}

/// Request server statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsMessage {
    pub id: String,
}

// =============================================================================
// Server → Client Messages
// =============================================================================

/// Messages sent from the server to a REPL client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome(WelcomeMessage),
    EvalResult(EvalResultMessage),
    Pong(PongMessage),
    StatsResult(StatsResultMessage),
    Error(ErrorMessage),
}

/// Sent once, right after the connection is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeMessage {
    /// Per-server session number (1-based, never reused).
    pub session: u64,
    /// ID of the server process (matches the discovery file).
    pub server_id: String,
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
}

/// Successful evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResultMessage {
    pub id: String,
    /// Display form of the returned value, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Lines printed during evaluation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
    /// Fire-and-forget host actions (`set`, `remove`) queued by this
    /// evaluation. They run on the host thread at its next tick.
    #[serde(default)]
    pub deferred: usize,
    #[serde(default, skip_serializing_if = "is_false")]
    pub output_truncated: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Pong response to ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongMessage {
    pub id: String,
}

/// Server statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResultMessage {
    pub id: String,
    pub active_sessions: u64,
    pub sessions_opened: u64,
    pub sessions_refused_limit: u64,
    pub sessions_closed_parse_failures: u64,
    pub sessions_closed_oversize: u64,
    pub evals: u64,
    pub eval_errors: u64,
    /// Callbacks waiting for the next host drain.
    pub queue_depth: u64,
    /// Callbacks ever queued by this server's host.
    pub callbacks_enqueued: u64,
}

/// Error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Echoed request ID (None when the request could not be parsed).
    pub id: Option<String>,
    pub code: String,
    pub message: String,
    /// Lines printed before the error was raised.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
}

// =============================================================================
// Error Codes
// =============================================================================

/// Stable error codes returned in `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Line was not a valid client message.
    MalformedMessage,
    /// Line exceeded [`MAX_MESSAGE_SIZE`].
    MessageTooLarge,
    /// Evaluation raised an error (syntax or runtime).
    EvalError,
    /// Evaluation exceeded the wall-clock limit.
    EvalTimeout,
    /// Evaluation exceeded the instruction budget.
    InstructionLimit,
    /// Anything else.
    InternalError,
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedMessage => "malformed_message",
            Self::MessageTooLarge => "message_too_large",
            Self::EvalError => "eval_error",
            Self::EvalTimeout => "eval_timeout",
            Self::InstructionLimit => "instruction_limit",
            Self::InternalError => "internal_error",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::MalformedMessage => "Malformed JSON message",
            Self::MessageTooLarge => "Message exceeds maximum size",
            Self::EvalError => "Evaluation failed",
            Self::EvalTimeout => "Evaluation timed out",
            Self::InstructionLimit => "Evaluation exceeded instruction limit",
            Self::InternalError => "Internal server error",
        }
    }

    pub fn to_error_message(&self, id: Option<String>) -> ErrorMessage {
        ErrorMessage {
            id,
            code: self.code().to_string(),
            message: self.message().to_string(),
            output: Vec::new(),
        }
    }
}

// =============================================================================
// Discovery File Format
// =============================================================================

/// Discovery file written by a running server, read by clients to find it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryFile {
    pub server_id: String,
    pub port: u16,
    pub pid: u32,
    pub host_title: String,
    /// "edit" or "run".
    pub mode: String,
    pub created_at: String, // RFC 3339
    pub protocol_version: u32,
}
