use std::error::Error;
use std::fmt::{Display, Formatter};
use std::pin::Pin;

use futures::Stream;
use serde_json::Value;

use crate::agent::history::Turn;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub system: Option<String>,
    pub history: Vec<Turn>,
    pub tools: Vec<ToolDeclaration>,
    pub max_tokens: u32,
    pub thinking_budget: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::StopSequence => "stop_sequence",
            Self::Other(other) => other,
        }
    }
}

/// Incremental piece of an assistant turn.
///
/// Events of one tool invocation arrive as start, zero or more argument deltas, then end.
/// Different content blocks never interleave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ReasoningSignature { signature: String },
    ToolInvocationStart { id: String, name: String },
    ToolInvocationArgumentDelta { id: String, partial_json: String },
    ToolInvocationEnd { id: String },
    TurnEnd { stop_reason: StopReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    MissingApiKey,
    HttpStatus { status: u16, body: String },
    Transport(String),
    Parse(String),
    Stream(String),
}

impl Display for LlmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingApiKey => write!(f, "missing ANTHROPIC_API_KEY"),
            Self::HttpStatus { status, body } => {
                write!(f, "provider request failed with status {status}: {body}")
            }
            Self::Transport(msg) => write!(f, "provider transport error: {msg}"),
            Self::Parse(msg) => write!(f, "provider parse error: {msg}"),
            Self::Stream(msg) => write!(f, "provider stream error: {msg}"),
        }
    }
}

impl Error for LlmError {}

pub type LlmResult<T> = std::result::Result<T, LlmError>;

pub type EventStream = Pin<Box<dyn Stream<Item = LlmResult<ChannelEvent>> + Send>>;

/// One-way source of assistant events; each call opens a fresh stream for the given history.
pub trait ModelChannel {
    fn stream(
        &self,
        request: ChannelRequest,
    ) -> impl std::future::Future<Output = LlmResult<EventStream>> + Send;
}

#[cfg(test)]
mod tests {
    use super::StopReason;

    #[test]
    fn stop_reason_round_trips_known_wire_values() {
        for wire in ["end_turn", "tool_use", "max_tokens", "stop_sequence"] {
            assert_eq!(StopReason::from_wire(wire).as_str(), wire);
        }
        assert_eq!(
            StopReason::from_wire("refusal"),
            StopReason::Other("refusal".to_string())
        );
    }
}
