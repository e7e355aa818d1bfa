use std::collections::HashSet;
use std::io::{self, Write};

use super::theme::Theme;
use crate::agent::dispatch::truncate_output;
use crate::agent::{TurnEvent, TurnOutcome};
use crate::config::ThemeToken;
use crate::llm::provider::StopReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Idle,
    Text,
    Reasoning,
}

/// Writes turn events to the console as they arrive, one style per output channel.
pub struct ConsoleRenderer<W: Write> {
    out: W,
    theme: Theme,
    show_reasoning: bool,
    output_char_limit: usize,
    stream: Stream,
    at_line_start: bool,
    shown_results: HashSet<String>,
}

impl<W: Write> ConsoleRenderer<W> {
    pub fn new(out: W, theme: Theme) -> Self {
        Self {
            out,
            theme,
            show_reasoning: true,
            output_char_limit: 0,
            stream: Stream::Idle,
            at_line_start: true,
            shown_results: HashSet::new(),
        }
    }

    /// Caps each echoed output stream; 0 shows everything.
    pub fn with_output_char_limit(mut self, limit: usize) -> Self {
        self.output_char_limit = limit;
        self
    }

    pub fn show_reasoning(&self) -> bool {
        self.show_reasoning
    }

    pub fn set_show_reasoning(&mut self, show: bool) {
        self.show_reasoning = show;
    }

    #[cfg(test)]
    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn render_event(&mut self, event: &TurnEvent) -> io::Result<()> {
        match event {
            TurnEvent::RoundStarted { .. } => {
                self.shown_results.clear();
                Ok(())
            }
            TurnEvent::TextDelta { text } => {
                self.write_stream(Stream::Text, ThemeToken::AssistantText, text)
            }
            TurnEvent::ReasoningDelta { text } => {
                if !self.show_reasoning {
                    return Ok(());
                }
                self.write_stream(Stream::Reasoning, ThemeToken::Reasoning, text)
            }
            TurnEvent::ToolRequest { code, .. } => {
                self.write_block(ThemeToken::CodeEcho, &echo_code(code))
            }
            TurnEvent::ToolExecuted { id, outcome } => {
                self.shown_results.insert(id.clone());
                let limit = self.output_char_limit;
                self.write_block(
                    ThemeToken::ToolStdout,
                    &truncate_output(&outcome.stdout, "stdout", limit),
                )?;
                self.write_block(
                    ThemeToken::ToolStderr,
                    &truncate_output(&outcome.stderr, "stderr", limit),
                )?;
                if let Some(raised) = &outcome.raised {
                    self.write_block(
                        ThemeToken::ToolTraceback,
                        &truncate_output(&raised.traceback, "traceback", limit),
                    )?;
                }
                Ok(())
            }
            TurnEvent::MalformedToolCall { id, message } => {
                self.shown_results.insert(id.clone());
                self.write_block(ThemeToken::SystemError, message)
            }
            TurnEvent::ToolResult {
                id,
                output,
                is_error,
            } => {
                // Failures of the executor itself have no other event carrying their text.
                if *is_error && !self.shown_results.contains(id) {
                    self.write_block(ThemeToken::SystemError, output)?;
                }
                Ok(())
            }
        }
    }

    pub fn render_outcome(&mut self, outcome: &TurnOutcome) -> io::Result<()> {
        match outcome {
            TurnOutcome::Completed { stop_reason } => match stop_reason {
                StopReason::EndTurn | StopReason::ToolUse => self.finish_line(),
                other => self.info(&format!("[response stopped: {}]", other.as_str())),
            },
            TurnOutcome::Aborted { message } => {
                self.error(&format!("Assistant request failed: {message}"))
            }
            TurnOutcome::RoundLimitReached { rounds } => self.info(&format!(
                "[stopped after {rounds} tool rounds; raise max_tool_rounds to allow more]"
            )),
        }
    }

    pub fn info(&mut self, text: &str) -> io::Result<()> {
        self.write_block(ThemeToken::SystemInfo, text)
    }

    pub fn error(&mut self, text: &str) -> io::Result<()> {
        self.write_block(ThemeToken::SystemError, text)
    }

    /// Ends a partially written line, e.g. when a turn is interrupted mid-stream.
    pub fn finish_line(&mut self) -> io::Result<()> {
        self.stream = Stream::Idle;
        if !self.at_line_start {
            self.out.write_all(b"\n")?;
            self.at_line_start = true;
        }
        self.out.flush()
    }

    fn write_stream(&mut self, stream: Stream, token: ThemeToken, text: &str) -> io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        if self.stream != stream {
            self.finish_line()?;
            self.stream = stream;
        }

        self.write_painted(token, text)?;
        self.out.flush()
    }

    fn write_block(&mut self, token: ThemeToken, text: &str) -> io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.finish_line()?;
        self.write_painted(token, text)?;
        self.finish_line()
    }

    fn write_painted(&mut self, token: ThemeToken, text: &str) -> io::Result<()> {
        write!(self.out, "{}", self.theme.paint(token, text))?;
        self.at_line_start = text.ends_with('\n');
        Ok(())
    }
}

fn echo_code(code: &str) -> String {
    code.lines()
        .enumerate()
        .map(|(index, line)| {
            let prefix = if index == 0 { ">>> " } else { "... " };
            format!("{prefix}{line}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
