#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Help,
    Globals,
    History(Option<usize>),
    Trace,
    Reasoning(Option<bool>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParseError {
    message: String,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn message(&self) -> &str {
        &self.message
    }
}

pub(crate) const HELP_TEXT: &str = "Available commands:\n  /help                Show this command list\n  /globals             List names defined in the Python session\n  /history [n]         Summarize the conversation (or its last n turns)\n  /trace               Show path to the current trace file\n  /reasoning [on|off]  Show or hide the assistant's reasoning text\n\nType ``` on its own line to start and end a multiline message.\nType exit, quit or press Ctrl-D to leave.";

pub(crate) fn parse_command(line: &str) -> Result<Command, ParseError> {
    if !line.starts_with('/') {
        return Err(ParseError::new("not a command"));
    }

    let trimmed = line.trim();
    if trimmed == "/" {
        return Err(ParseError::new("empty command. Try /help"));
    }

    let command_text = &trimmed[1..];
    let mut parts = command_text.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("").to_ascii_lowercase();
    if name.is_empty() {
        return Err(ParseError::new("empty command. Try /help"));
    }
    let rest = parts.next().map(str::trim).unwrap_or("");

    match name.as_str() {
        "help" => expect_no_args(rest, Command::Help, "usage: /help"),
        "globals" => expect_no_args(rest, Command::Globals, "usage: /globals"),
        "history" => parse_history(rest),
        "trace" => expect_no_args(rest, Command::Trace, "usage: /trace"),
        "reasoning" => parse_reasoning(rest),
        _ => Err(ParseError::new(format!(
            "unknown command '/{name}'. Try /help"
        ))),
    }
}

pub(crate) fn is_command_line(line: &str) -> bool {
    line.starts_with('/')
}

fn expect_no_args(rest: &str, command: Command, usage: &str) -> Result<Command, ParseError> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(ParseError::new(usage))
    }
}

fn parse_history(rest: &str) -> Result<Command, ParseError> {
    if rest.is_empty() {
        return Ok(Command::History(None));
    }

    let value = rest
        .parse::<usize>()
        .map_err(|_| ParseError::new("usage: /history [n]"))?;
    if value == 0 {
        return Err(ParseError::new("usage: /history [n] (n must be >= 1)"));
    }

    Ok(Command::History(Some(value)))
}

fn parse_reasoning(rest: &str) -> Result<Command, ParseError> {
    if rest.is_empty() {
        return Ok(Command::Reasoning(None));
    }

    match rest {
        "on" => Ok(Command::Reasoning(Some(true))),
        "off" => Ok(Command::Reasoning(Some(false))),
        _ => Err(ParseError::new("usage: /reasoning [on|off]")),
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, HELP_TEXT, is_command_line, parse_command};

    #[test]
    fn help_text_lists_all_supported_commands() {
        for needle in [
            "/help",
            "/globals",
            "/history [n]",
            "/trace",
            "/reasoning [on|off]",
        ] {
            assert!(HELP_TEXT.contains(needle), "missing help entry: {needle}");
        }
    }

    #[test]
    fn parse_simple_commands() {
        assert_eq!(parse_command("/help").expect("help"), Command::Help);
        assert_eq!(parse_command("/globals").expect("globals"), Command::Globals);
        assert_eq!(parse_command("/trace").expect("trace"), Command::Trace);
        assert_eq!(parse_command("/HELP").expect("case"), Command::Help);
    }

    #[test]
    fn parse_history_optional_n() {
        assert_eq!(
            parse_command("/history").expect("history"),
            Command::History(None)
        );
        assert_eq!(
            parse_command("/history 12").expect("history 12"),
            Command::History(Some(12))
        );
    }

    #[test]
    fn parse_reasoning_optional_state() {
        assert_eq!(
            parse_command("/reasoning").expect("reasoning"),
            Command::Reasoning(None)
        );
        assert_eq!(
            parse_command("/reasoning on").expect("reasoning on"),
            Command::Reasoning(Some(true))
        );
        assert_eq!(
            parse_command("/reasoning off").expect("reasoning off"),
            Command::Reasoning(Some(false))
        );
    }

    #[test]
    fn parse_reports_usage_for_invalid_arguments() {
        assert_eq!(
            parse_command("/history 0")
                .expect_err("invalid history size")
                .message(),
            "usage: /history [n] (n must be >= 1)"
        );
        assert_eq!(
            parse_command("/history many")
                .expect_err("non-numeric history size")
                .message(),
            "usage: /history [n]"
        );
        assert_eq!(
            parse_command("/globals x")
                .expect_err("unexpected argument")
                .message(),
            "usage: /globals"
        );
        assert_eq!(
            parse_command("/reasoning maybe")
                .expect_err("invalid reasoning")
                .message(),
            "usage: /reasoning [on|off]"
        );
    }

    #[test]
    fn parse_reports_unknown_and_empty_commands() {
        assert_eq!(
            parse_command("/bogus")
                .expect_err("unknown command")
                .message(),
            "unknown command '/bogus'. Try /help"
        );
        assert_eq!(
            parse_command("/ help")
                .expect_err("missing command name")
                .message(),
            "empty command. Try /help"
        );
    }

    #[test]
    fn command_line_detection_is_prefix_based() {
        assert!(is_command_line("/help"));
        assert!(!is_command_line(" /help"));
        assert!(!is_command_line("what does /help do?"));
    }
}
