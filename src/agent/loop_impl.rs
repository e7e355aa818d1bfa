use futures::StreamExt;
use serde_json::{Map, Value};

use crate::agent::dispatch::{
    executor_failure, extract_code, format_outcome, parse_arguments, tool_declarations,
};
use crate::agent::history::{ContentBlock, ConversationHistory, Turn};
use crate::llm::provider::{
    ChannelEvent, ChannelRequest, EventStream, LlmError, LlmResult, ModelChannel, StopReason,
};
use crate::python::{CodeExecutor, ExecOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Model calls that may end in tool use before the turn is cut off. 0 means no limit.
    pub max_tool_rounds: usize,
    pub max_tokens: u32,
    pub thinking_budget: Option<u32>,
    pub output_char_limit: usize,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 25,
            max_tokens: 20_000,
            thinking_budget: Some(16_000),
            output_char_limit: 4_000,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    RoundStarted {
        round: usize,
    },
    TextDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    ToolRequest {
        id: String,
        name: String,
        code: String,
    },
    MalformedToolCall {
        id: String,
        message: String,
    },
    ToolExecuted {
        id: String,
        outcome: ExecOutcome,
    },
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { stop_reason: StopReason },
    Aborted { message: String },
    RoundLimitReached { rounds: usize },
}

/// Drives one user turn: streams the assistant reply, runs every requested tool call and
/// feeds the results back until the assistant stops asking for tools.
///
/// The user input is appended first. Assistant turns reach the history only when their
/// stream completed, together with the results for every invocation they contain.
pub async fn run_turn<M: ModelChannel, E: CodeExecutor, F: FnMut(TurnEvent)>(
    channel: &M,
    executor: &E,
    history: &mut ConversationHistory,
    user_input: &str,
    config: &AgentConfig,
    on_event: &mut F,
) -> TurnOutcome {
    history.push_user(user_input);
    let tools = tool_declarations();
    let mut round = 0usize;

    loop {
        round += 1;
        on_event(TurnEvent::RoundStarted { round });

        let request = ChannelRequest {
            system: config.system_prompt.clone(),
            history: history.turns().to_vec(),
            tools: tools.clone(),
            max_tokens: config.max_tokens,
            thinking_budget: config.thinking_budget,
        };

        let streamed = match stream_assistant_turn(channel, request, on_event).await {
            Ok(streamed) => streamed,
            Err(err) => {
                return TurnOutcome::Aborted {
                    message: err.to_string(),
                };
            }
        };

        let StreamedTurn {
            blocks,
            invocations,
            stop_reason,
        } = streamed;

        if invocations.is_empty() {
            if !blocks.is_empty()
                && let Err(err) = history.push_assistant(Turn::assistant(blocks))
            {
                return TurnOutcome::Aborted {
                    message: err.to_string(),
                };
            }
            return TurnOutcome::Completed { stop_reason };
        }

        // Requests are resolved whatever the stop reason, so no invocation is left unanswered.
        let results = resolve_invocations(executor, &invocations, config.output_char_limit, on_event);
        if let Err(err) = history.push_exchange(Turn::assistant(blocks), Turn::tool_results(results))
        {
            return TurnOutcome::Aborted {
                message: err.to_string(),
            };
        }

        if config.max_tool_rounds != 0 && round >= config.max_tool_rounds {
            return TurnOutcome::RoundLimitReached { rounds: round };
        }
    }
}

#[derive(Debug)]
struct StreamedTurn {
    blocks: Vec<ContentBlock>,
    invocations: Vec<Invocation>,
    stop_reason: StopReason,
}

#[derive(Debug, Clone)]
struct Invocation {
    id: String,
    name: String,
    arguments: Result<Value, String>,
}

async fn stream_assistant_turn<M: ModelChannel, F: FnMut(TurnEvent)>(
    channel: &M,
    request: ChannelRequest,
    on_event: &mut F,
) -> LlmResult<StreamedTurn> {
    let mut events: EventStream = channel.stream(request).await?;
    let mut builder = AssistantTurnBuilder::default();

    while let Some(event) = events.next().await {
        if let Some(stop_reason) = builder.apply(event?, on_event)? {
            return Ok(builder.finish(stop_reason));
        }
    }

    Err(LlmError::Stream(
        "response ended without a stop reason".to_string(),
    ))
}

#[derive(Debug)]
enum OpenBlock {
    Text(String),
    Reasoning {
        text: String,
        signature: Option<String>,
    },
    Tool {
        id: String,
        name: String,
        arguments: String,
    },
}

/// Folds channel events into content blocks, buffering tool arguments per invocation.
#[derive(Debug, Default)]
struct AssistantTurnBuilder {
    blocks: Vec<ContentBlock>,
    invocations: Vec<Invocation>,
    open: Option<OpenBlock>,
}

impl AssistantTurnBuilder {
    fn apply<F: FnMut(TurnEvent)>(
        &mut self,
        event: ChannelEvent,
        on_event: &mut F,
    ) -> LlmResult<Option<StopReason>> {
        match event {
            ChannelEvent::TextDelta { text } => {
                match &mut self.open {
                    Some(OpenBlock::Text(buffer)) => buffer.push_str(&text),
                    _ => {
                        self.close_non_tool("text")?;
                        self.open = Some(OpenBlock::Text(text.clone()));
                    }
                }
                on_event(TurnEvent::TextDelta { text });
            }
            ChannelEvent::ReasoningDelta { text } => {
                match &mut self.open {
                    Some(OpenBlock::Reasoning { text: buffer, .. }) => buffer.push_str(&text),
                    _ => {
                        self.close_non_tool("reasoning")?;
                        self.open = Some(OpenBlock::Reasoning {
                            text: text.clone(),
                            signature: None,
                        });
                    }
                }
                on_event(TurnEvent::ReasoningDelta { text });
            }
            ChannelEvent::ReasoningSignature { signature } => {
                if let Some(OpenBlock::Reasoning { signature: slot, .. }) = &mut self.open {
                    *slot = Some(signature);
                }
            }
            ChannelEvent::ToolInvocationStart { id, name } => {
                self.close_non_tool("tool invocation")?;
                self.open = Some(OpenBlock::Tool {
                    id,
                    name,
                    arguments: String::new(),
                });
            }
            ChannelEvent::ToolInvocationArgumentDelta { id, partial_json } => match &mut self.open {
                Some(OpenBlock::Tool {
                    id: open_id,
                    arguments,
                    ..
                }) if *open_id == id => arguments.push_str(&partial_json),
                _ => {
                    return Err(LlmError::Stream(format!(
                        "arguments for tool invocation {id} arrived outside its block"
                    )));
                }
            },
            ChannelEvent::ToolInvocationEnd { id } => match self.open.take() {
                Some(OpenBlock::Tool {
                    id: open_id,
                    name,
                    arguments,
                }) if open_id == id => {
                    let parsed = parse_arguments(&arguments);
                    self.push_invocation(open_id, name, parsed);
                }
                other => {
                    self.open = other;
                    return Err(LlmError::Stream(format!(
                        "end of tool invocation {id} without a matching start"
                    )));
                }
            },
            ChannelEvent::TurnEnd { stop_reason } => return Ok(Some(stop_reason)),
        }

        Ok(None)
    }

    /// Closes the open text or reasoning block. Content blocks never interleave, so an
    /// open tool invocation here is a protocol error.
    fn close_non_tool(&mut self, incoming: &str) -> LlmResult<()> {
        match self.open.take() {
            Some(OpenBlock::Tool { id, .. }) => Err(LlmError::Stream(format!(
                "{incoming} arrived while tool invocation {id} was still open"
            ))),
            Some(block) => {
                self.push_closed(block);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn push_closed(&mut self, block: OpenBlock) {
        match block {
            OpenBlock::Text(text) => {
                if !text.is_empty() {
                    self.blocks.push(ContentBlock::Text { text });
                }
            }
            OpenBlock::Reasoning { text, signature } => {
                if !text.is_empty() || signature.is_some() {
                    self.blocks
                        .push(ContentBlock::Reasoning { text, signature });
                }
            }
            OpenBlock::Tool { id, name, .. } => {
                let message = format!(
                    "Error: tool invocation {id} ended before its arguments were complete"
                );
                self.push_invocation(id, name, Err(message));
            }
        }
    }

    fn push_invocation(&mut self, id: String, name: String, arguments: Result<Value, String>) {
        let recorded = arguments
            .as_ref()
            .cloned()
            .unwrap_or_else(|_| Value::Object(Map::new()));
        self.blocks.push(ContentBlock::ToolInvocation {
            id: id.clone(),
            name: name.clone(),
            arguments: recorded,
        });
        self.invocations.push(Invocation {
            id,
            name,
            arguments,
        });
    }

    fn finish(mut self, stop_reason: StopReason) -> StreamedTurn {
        if let Some(block) = self.open.take() {
            self.push_closed(block);
        }

        StreamedTurn {
            blocks: self.blocks,
            invocations: self.invocations,
            stop_reason,
        }
    }
}

fn resolve_invocations<E: CodeExecutor, F: FnMut(TurnEvent)>(
    executor: &E,
    invocations: &[Invocation],
    char_limit: usize,
    on_event: &mut F,
) -> Vec<ContentBlock> {
    invocations
        .iter()
        .map(|invocation| {
            let (output, is_error) = resolve_one(executor, invocation, char_limit, on_event);
            on_event(TurnEvent::ToolResult {
                id: invocation.id.clone(),
                output: output.clone(),
                is_error,
            });
            ContentBlock::ToolResult {
                invocation_id: invocation.id.clone(),
                output,
                is_error,
            }
        })
        .collect()
}

fn resolve_one<E: CodeExecutor, F: FnMut(TurnEvent)>(
    executor: &E,
    invocation: &Invocation,
    char_limit: usize,
    on_event: &mut F,
) -> (String, bool) {
    let code = invocation
        .arguments
        .clone()
        .and_then(|arguments| extract_code(&invocation.name, &arguments));
    let code = match code {
        Ok(code) => code,
        Err(message) => {
            on_event(TurnEvent::MalformedToolCall {
                id: invocation.id.clone(),
                message: message.clone(),
            });
            return (message, true);
        }
    };

    on_event(TurnEvent::ToolRequest {
        id: invocation.id.clone(),
        name: invocation.name.clone(),
        code: code.clone(),
    });

    match executor.run(&code) {
        Ok(outcome) => {
            let formatted = format_outcome(&outcome, char_limit);
            on_event(TurnEvent::ToolExecuted {
                id: invocation.id.clone(),
                outcome,
            });
            formatted
        }
        Err(err) => (executor_failure(&err), true),
    }
}
