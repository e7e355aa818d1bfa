use super::commands::{Command, HELP_TEXT, is_command_line, parse_command};
use super::input::{InputCollector, InputStep};
use super::render::ConsoleRenderer;
use super::theme::Theme;
use crate::agent::{
    AgentConfig, ContentBlock, ConversationHistory, TurnEvent, TurnOutcome, run_turn,
};
use crate::llm::anthropic::AnthropicChannel;
use crate::python::{InterruptHandle, InterruptRequest, PythonSession};
use crate::trace::{SessionTrace, kind};
use anyhow::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, Write};
use std::time::Duration;

pub(crate) const MISSING_KEY_MESSAGE: &str = "Assistant unavailable: missing ANTHROPIC_API_KEY. Configure it in your shell or .env file (example: ANTHROPIC_API_KEY=your_key).";

const REPEATED_INTERRUPT_MESSAGE: &str =
    "Interrupted again while Python code was running; ending the session.";

const PREVIEW_CHARS: usize = 60;
const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

pub struct AppState {
    pub session_id: String,
    pub python: PythonSession,
    pub channel: Option<AnthropicChannel>,
    pub agent_config: AgentConfig,
    pub history: ConversationHistory,
    pub theme: Theme,
    pub startup_message: Option<String>,
    pub trace: SessionTrace,
}

pub async fn run_repl(state: &mut AppState) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    let mut renderer = ConsoleRenderer::new(io::stdout(), state.theme.clone())
        .with_output_char_limit(state.agent_config.output_char_limit);
    let mut input = InputCollector::new();

    let model = state
        .channel
        .as_ref()
        .map_or("unavailable", AnthropicChannel::model);
    renderer.info(&format!(
        "pyclaude session {} (model: {model}). Type /help for commands, exit to quit.",
        state.session_id
    ))?;
    if let Some(message) = &state.startup_message {
        renderer.info(message)?;
    }

    loop {
        match rl.readline(input.prompt()) {
            Ok(line) => {
                if !input.in_multiline() && is_exit_command(&line) {
                    break;
                }

                let was_multiline = input.in_multiline();
                let message = match input.push_line(&line) {
                    InputStep::Continue => {
                        if !was_multiline {
                            renderer.info("Multiline mode: enter ``` on its own line when done.")?;
                        }
                        continue;
                    }
                    InputStep::Submit(message) => message,
                };
                if message.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(message.as_str());

                if is_command_line(&message) {
                    handle_command(state, &mut renderer, &message)?;
                } else {
                    handle_prompt(state, &mut renderer, &message).await?;
                }
            }
            Err(ReadlineError::Interrupted) => {
                if input.cancel() {
                    renderer.info("[multiline input discarded]")?;
                    continue;
                }
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

pub(crate) fn is_exit_command(line: &str) -> bool {
    let line = line.trim();
    line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit")
}

fn handle_command<W: Write>(
    state: &mut AppState,
    renderer: &mut ConsoleRenderer<W>,
    line: &str,
) -> Result<()> {
    let command = match parse_command(line) {
        Ok(command) => command,
        Err(err) => {
            renderer.error(err.message())?;
            return Ok(());
        }
    };

    match command {
        Command::Help => renderer.info(HELP_TEXT)?,
        Command::Globals => match state.python.list_globals() {
            Ok(globals) if globals.is_empty() => renderer.info("No globals defined.")?,
            Ok(globals) => {
                let lines = globals
                    .iter()
                    .map(|entry| format!("{}: {}", entry.name, entry.type_name))
                    .collect::<Vec<_>>();
                renderer.info(&lines.join("\n"))?;
            }
            Err(err) => renderer.error(&format!("Failed to list globals: {err}"))?,
        },
        Command::History(limit) => {
            let lines = history_lines(&state.history, limit);
            if lines.is_empty() {
                renderer.info("Conversation is empty.")?;
            } else {
                renderer.info(&lines.join("\n"))?;
            }
        }
        Command::Trace => {
            renderer.info(&format!("Trace file: {}", state.trace.file_path().display()))?
        }
        Command::Reasoning(None) => {
            let status = if renderer.show_reasoning() { "on" } else { "off" };
            renderer.info(&format!("Reasoning display is {status}."))?;
        }
        Command::Reasoning(Some(show)) => {
            renderer.set_show_reasoning(show);
            let status = if show { "on" } else { "off" };
            renderer.info(&format!("Reasoning display turned {status}."))?;
        }
    }

    Ok(())
}

async fn handle_prompt<W: Write>(
    state: &mut AppState,
    renderer: &mut ConsoleRenderer<W>,
    message: &str,
) -> Result<()> {
    state.trace.log_user_input(message);

    let Some(channel) = &state.channel else {
        state.trace.log_output(kind::SYSTEM_ERROR, MISSING_KEY_MESSAGE);
        renderer.error(MISSING_KEY_MESSAGE)?;
        return Ok(());
    };

    let mut recorder = TraceRecorder::new(&state.trace);
    let mut render_error = None;
    let mut on_event = |event: TurnEvent| {
        recorder.record(&event);
        if render_error.is_none()
            && let Err(err) = renderer.render_event(&event)
        {
            render_error = Some(err);
        }
    };

    let watcher = tokio::spawn(interrupt_running_code(
        state.python.interrupt_handle(),
        state.trace.clone(),
    ));
    let turn = run_turn(
        channel,
        &state.python,
        &mut state.history,
        message,
        &state.agent_config,
        &mut on_event,
    );
    // Running code gets a KeyboardInterrupt from the watcher; the turn itself stops at
    // the next await point.
    let outcome = tokio::select! {
        outcome = turn => outcome,
        _ = tokio::signal::ctrl_c() => TurnOutcome::Aborted {
            message: "interrupted".to_string(),
        },
    };
    watcher.abort();

    recorder.finish(&outcome);
    if let Some(err) = render_error {
        return Err(err.into());
    }
    renderer.render_outcome(&outcome)?;
    Ok(())
}

/// Raises `KeyboardInterrupt` in code the assistant is running when Ctrl-C arrives.
/// A second Ctrl-C before that code stops ends the process.
async fn interrupt_running_code(handle: InterruptHandle, trace: SessionTrace) {
    while tokio::signal::ctrl_c().await.is_ok() {
        match handle.request() {
            InterruptRequest::Idle => {}
            InterruptRequest::Raise => {
                let handle = handle.clone();
                let trace = trace.clone();
                tokio::task::spawn_blocking(move || {
                    while handle.is_executing() {
                        match handle.raise_keyboard_interrupt() {
                            Ok(true) => break,
                            Ok(false) => std::thread::sleep(INTERRUPT_RETRY),
                            Err(err) => {
                                trace.log_output(
                                    kind::SYSTEM_ERROR,
                                    &format!("failed to interrupt running code: {err:#}"),
                                );
                                break;
                            }
                        }
                    }
                });
            }
            InterruptRequest::Repeated => {
                trace.log_output(kind::SYSTEM_ERROR, REPEATED_INTERRUPT_MESSAGE);
                eprintln!("\n{REPEATED_INTERRUPT_MESSAGE}");
                std::process::exit(130);
            }
        }
    }
}

/// Mirrors a turn into the session trace, one entry per content block.
struct TraceRecorder<'a> {
    trace: &'a SessionTrace,
    text: String,
    reasoning: String,
    last_resolved: Option<String>,
}

impl<'a> TraceRecorder<'a> {
    fn new(trace: &'a SessionTrace) -> Self {
        Self {
            trace,
            text: String::new(),
            reasoning: String::new(),
            last_resolved: None,
        }
    }

    fn record(&mut self, event: &TurnEvent) {
        match event {
            TurnEvent::RoundStarted { .. } => self.flush(),
            TurnEvent::TextDelta { text } => {
                self.flush_reasoning();
                self.text.push_str(text);
            }
            TurnEvent::ReasoningDelta { text } => {
                self.flush_text();
                self.reasoning.push_str(text);
            }
            TurnEvent::ToolRequest { code, .. } => {
                self.flush();
                self.trace.log_output(kind::TOOL_CODE, code);
            }
            TurnEvent::ToolExecuted { id, outcome } => {
                self.last_resolved = Some(id.clone());
                if !outcome.stdout.is_empty() {
                    self.trace.log_output(kind::TOOL_STDOUT, &outcome.stdout);
                }
                if !outcome.stderr.is_empty() {
                    self.trace.log_output(kind::TOOL_ERROR, &outcome.stderr);
                }
                if let Some(raised) = &outcome.raised {
                    self.trace.log_output(kind::TOOL_ERROR, &raised.traceback);
                }
            }
            TurnEvent::MalformedToolCall { id, message } => {
                self.flush();
                self.last_resolved = Some(id.clone());
                self.trace.log_output(kind::TOOL_ERROR, message);
            }
            TurnEvent::ToolResult {
                id,
                output,
                is_error,
            } => {
                if *is_error && self.last_resolved.as_deref() != Some(id.as_str()) {
                    self.trace.log_output(kind::TOOL_ERROR, output);
                }
            }
        }
    }

    fn finish(&mut self, outcome: &TurnOutcome) {
        self.flush();
        match outcome {
            TurnOutcome::Completed { stop_reason } => {
                self.trace.log_output(kind::TURN_END, stop_reason.as_str());
            }
            TurnOutcome::Aborted { message } => {
                self.trace.log_output(kind::SYSTEM_ERROR, message);
                self.trace.log_output(kind::TURN_END, "aborted");
            }
            TurnOutcome::RoundLimitReached { rounds } => {
                self.trace
                    .log_output(kind::TURN_END, &format!("round limit reached after {rounds}"));
            }
        }
    }

    fn flush(&mut self) {
        self.flush_text();
        self.flush_reasoning();
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            self.trace
                .log_output(kind::ASSISTANT_TEXT, &std::mem::take(&mut self.text));
        }
    }

    fn flush_reasoning(&mut self) {
        if !self.reasoning.is_empty() {
            self.trace.log_output(
                kind::ASSISTANT_REASONING,
                &std::mem::take(&mut self.reasoning),
            );
        }
    }
}

/// One line per turn, newest last. `limit` keeps only the last `limit` turns.
fn history_lines(history: &ConversationHistory, limit: Option<usize>) -> Vec<String> {
    let turns = history.turns();
    let skip = limit.map_or(0, |limit| turns.len().saturating_sub(limit));

    turns
        .iter()
        .enumerate()
        .skip(skip)
        .map(|(index, turn)| {
            let blocks = turn
                .blocks()
                .iter()
                .map(describe_block)
                .collect::<Vec<_>>()
                .join(" ");
            format!("{:>3}. {}: {blocks}", index + 1, turn.role())
        })
        .collect()
}

fn describe_block(block: &ContentBlock) -> String {
    match block {
        ContentBlock::Text { text } => preview(text),
        ContentBlock::Reasoning { .. } => "[reasoning]".to_string(),
        ContentBlock::ToolInvocation { id, name, .. } => format!("[{name} {id}]"),
        ContentBlock::ToolResult {
            invocation_id,
            is_error,
            ..
        } => {
            if *is_error {
                format!("[result {invocation_id} error]")
            } else {
                format!("[result {invocation_id}]")
            }
        }
    }
}

fn preview(text: &str) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= PREVIEW_CHARS {
        return single_line;
    }

    let cut = single_line.chars().take(PREVIEW_CHARS).collect::<String>();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::{TraceRecorder, history_lines, is_exit_command, preview};
    use crate::agent::{ContentBlock, ConversationHistory, Turn, TurnEvent, TurnOutcome};
    use crate::llm::provider::StopReason;
    use crate::python::{ExceptionInfo, ExecOutcome};
    use crate::trace::SessionTrace;
    use serde_json::json;
    use std::fs;

    #[test]
    fn exit_words_are_case_insensitive() {
        assert!(is_exit_command("exit"));
        assert!(is_exit_command("  QUIT "));
        assert!(!is_exit_command("exit now"));
        assert!(!is_exit_command("/exit"));
    }

    #[test]
    fn history_lines_describe_each_turn() {
        let mut history = ConversationHistory::new();
        history.push_user("compute   two\nplus two");
        history
            .push_exchange(
                Turn::assistant(vec![
                    ContentBlock::Reasoning {
                        text: "easy".to_string(),
                        signature: Some("sig".to_string()),
                    },
                    ContentBlock::ToolInvocation {
                        id: "t1".to_string(),
                        name: "execute".to_string(),
                        arguments: json!({"code": "2 + 2"}),
                    },
                ]),
                Turn::tool_results(vec![ContentBlock::ToolResult {
                    invocation_id: "t1".to_string(),
                    output: "No output produced.".to_string(),
                    is_error: true,
                }]),
            )
            .expect("exchange");

        assert_eq!(
            history_lines(&history, None),
            vec![
                "  1. user: compute two plus two".to_string(),
                "  2. assistant: [reasoning] [execute t1]".to_string(),
                "  3. tool-result: [result t1 error]".to_string(),
            ]
        );
        assert_eq!(
            history_lines(&history, Some(1)),
            vec!["  3. tool-result: [result t1 error]".to_string()]
        );
        assert!(history_lines(&ConversationHistory::new(), None).is_empty());
    }

    #[test]
    fn preview_cuts_long_text() {
        let long = "a".repeat(70);
        assert_eq!(preview(&long), format!("{}...", "a".repeat(60)));
    }

    #[test]
    fn trace_recorder_writes_one_entry_per_block() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let trace = SessionTrace::create_in_temp_dir("recorder", tmp.path()).expect("trace");

        let mut recorder = TraceRecorder::new(&trace);
        for event in [
            TurnEvent::RoundStarted { round: 1 },
            TurnEvent::ReasoningDelta {
                text: "think".to_string(),
            },
            TurnEvent::TextDelta {
                text: "Let me".to_string(),
            },
            TurnEvent::TextDelta {
                text: " check".to_string(),
            },
            TurnEvent::ToolRequest {
                id: "t1".to_string(),
                name: "execute".to_string(),
                code: "1 / 0".to_string(),
            },
            TurnEvent::ToolExecuted {
                id: "t1".to_string(),
                outcome: ExecOutcome {
                    stdout: "partial\n".to_string(),
                    stderr: String::new(),
                    raised: Some(ExceptionInfo {
                        exc_type: "ZeroDivisionError".to_string(),
                        message: "division by zero".to_string(),
                        traceback: "ZeroDivisionError: division by zero\n".to_string(),
                    }),
                },
            },
            TurnEvent::ToolResult {
                id: "t1".to_string(),
                output: "ignored".to_string(),
                is_error: true,
            },
        ] {
            recorder.record(&event);
        }
        recorder.finish(&TurnOutcome::Completed {
            stop_reason: StopReason::EndTurn,
        });
        drop(recorder);
        drop(trace);

        let entry = fs::read_dir(tmp.path())
            .expect("read dir")
            .next()
            .expect("trace file")
            .expect("dir entry");
        let content = fs::read_to_string(entry.path()).expect("read trace");
        let kinds = content
            .lines()
            .map(|line| {
                let start = line.find("] [").expect("kind column") + 3;
                line[start..start + 11].trim().to_string()
            })
            .collect::<Vec<_>>();

        assert_eq!(
            kinds,
            vec![
                "ai.think",
                "ai.text",
                "tool.code",
                "tool.out",
                "tool.err",
                "turn.end"
            ]
        );
        assert!(content.contains("Let me check"));
        assert!(!content.contains("ignored"));
    }
}
