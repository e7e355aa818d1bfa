const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InputStep {
    /// A complete message is ready.
    Submit(String),
    /// More lines are needed before the message is complete.
    Continue,
}

/// Joins lines between two ``` fences into one message. Outside a fence every line is
/// its own message.
#[derive(Debug, Default)]
pub(crate) struct InputCollector {
    buffer: Option<Vec<String>>,
}

impl InputCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn in_multiline(&self) -> bool {
        self.buffer.is_some()
    }

    pub(crate) fn prompt(&self) -> &'static str {
        if self.in_multiline() { "... " } else { ">>> " }
    }

    pub(crate) fn push_line(&mut self, line: &str) -> InputStep {
        let is_fence = line.trim() == FENCE;

        match self.buffer.take() {
            None if is_fence => {
                self.buffer = Some(Vec::new());
                InputStep::Continue
            }
            None => InputStep::Submit(line.trim().to_string()),
            Some(lines) if is_fence => InputStep::Submit(lines.join("\n").trim().to_string()),
            Some(mut lines) => {
                lines.push(line.to_string());
                self.buffer = Some(lines);
                InputStep::Continue
            }
        }
    }

    /// Drops a half-entered multiline message.
    pub(crate) fn cancel(&mut self) -> bool {
        self.buffer.take().is_some()
    }
}
