use std::error::Error;
use std::fmt::{Display, Formatter};

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::ToolResult => write!(f, "tool-result"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        signature: Option<String>,
    },
    ToolInvocation {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        invocation_id: String,
        output: String,
        is_error: bool,
    },
}

/// One exchange unit of the conversation. Blocks cannot be changed after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    role: Role,
    blocks: Vec<ContentBlock>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            blocks: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            blocks,
        }
    }

    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::ToolResult,
            blocks,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn invocation_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolInvocation { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn result_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { invocation_id, .. } => Some(invocation_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    WrongRole { expected: Role, found: Role },
    EmptyTurn,
    UnresolvedInvocations { ids: Vec<String> },
    MismatchedResults {
        expected: Vec<String>,
        found: Vec<String>,
    },
}

impl Display for HistoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongRole { expected, found } => {
                write!(f, "expected a {expected} turn, got {found}")
            }
            Self::EmptyTurn => write!(f, "refusing to append a turn without content"),
            Self::UnresolvedInvocations { ids } => write!(
                f,
                "assistant turn has tool invocations without results: {}",
                ids.join(", ")
            ),
            Self::MismatchedResults { expected, found } => write!(
                f,
                "tool results [{}] do not match invocations [{}]",
                found.join(", "),
                expected.join(", ")
            ),
        }
    }
}

impl Error for HistoryError {}

/// Append-only log of turns, replayed in full on every model call.
///
/// Assistant turns that request tools can only enter together with their results, so
/// between two appends there is never an invocation without a result.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::user(text));
    }

    pub fn push_assistant(&mut self, turn: Turn) -> Result<(), HistoryError> {
        expect_role(&turn, Role::Assistant)?;
        if turn.is_empty() {
            return Err(HistoryError::EmptyTurn);
        }

        let unresolved = turn.invocation_ids();
        if !unresolved.is_empty() {
            return Err(HistoryError::UnresolvedInvocations {
                ids: to_owned_ids(&unresolved),
            });
        }

        self.turns.push(turn);
        Ok(())
    }

    /// Appends an assistant turn and the tool-result turn answering it, in one step.
    ///
    /// Result ids must match the invocation ids one-to-one and in the same order.
    pub fn push_exchange(&mut self, assistant: Turn, results: Turn) -> Result<(), HistoryError> {
        expect_role(&assistant, Role::Assistant)?;
        expect_role(&results, Role::ToolResult)?;

        let expected = assistant.invocation_ids();
        let found = results.result_ids();
        if expected.is_empty() || expected != found || found.len() != results.blocks().len() {
            return Err(HistoryError::MismatchedResults {
                expected: to_owned_ids(&expected),
                found: to_owned_ids(&found),
            });
        }

        self.turns.push(assistant);
        self.turns.push(results);
        Ok(())
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Invocation ids in the last turn that no later turn answers.
    pub fn pending_tool_ids(&self) -> Vec<String> {
        match self.turns.last() {
            Some(turn) if turn.role() == Role::Assistant => to_owned_ids(&turn.invocation_ids()),
            _ => Vec::new(),
        }
    }
}

fn expect_role(turn: &Turn, expected: Role) -> Result<(), HistoryError> {
    if turn.role() == expected {
        Ok(())
    } else {
        Err(HistoryError::WrongRole {
            expected,
            found: turn.role(),
        })
    }
}

fn to_owned_ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| (*id).to_string()).collect()
}
