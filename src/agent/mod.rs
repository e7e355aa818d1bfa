pub mod dispatch;
pub mod history;
mod loop_impl;
pub mod prompt;

pub use history::{ContentBlock, ConversationHistory, Role, Turn};
pub use loop_impl::{AgentConfig, TurnEvent, TurnOutcome, run_turn};
