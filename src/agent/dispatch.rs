use serde_json::{Map, Value, json};

use crate::llm::provider::ToolDeclaration;
use crate::python::ExecOutcome;

pub const EXECUTE_TOOL: &str = "execute";

const EXECUTE_DESCRIPTION: &str = "Execute Python code in a persistent interpreter session and return what it printed. \
Variables, functions and imports defined in one call stay available in later calls, so work can be built up step by step. \
The result contains captured stdout, stderr and the traceback of any uncaught exception.";

pub fn tool_declarations() -> Vec<ToolDeclaration> {
    vec![ToolDeclaration {
        name: EXECUTE_TOOL.to_string(),
        description: EXECUTE_DESCRIPTION.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The Python code to execute"
                }
            },
            "required": ["code"]
        }),
    }]
}

/// Parses the accumulated argument text of one invocation. An empty buffer means `{}`.
pub fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    serde_json::from_str(raw)
        .map_err(|err| format!("Error: tool arguments are not valid JSON ({err}): {raw}"))
}

pub fn extract_code(name: &str, arguments: &Value) -> Result<String, String> {
    if name != EXECUTE_TOOL {
        return Err(format!(
            "Error: Unknown tool '{name}'. The only available tool is '{EXECUTE_TOOL}'."
        ));
    }

    match arguments.get("code").and_then(Value::as_str) {
        Some(code) => Ok(code.to_string()),
        None => Err(format!(
            "Error: Missing string 'code' parameter in {EXECUTE_TOOL} tool input"
        )),
    }
}

/// Text sent back to the model for one executed fragment, and whether it is an error.
pub fn format_outcome(outcome: &ExecOutcome, char_limit: usize) -> (String, bool) {
    let mut sections = Vec::new();

    if !outcome.stdout.is_empty() {
        sections.push(section("stdout", &outcome.stdout, char_limit));
    }
    if !outcome.stderr.is_empty() {
        sections.push(section("stderr", &outcome.stderr, char_limit));
    }
    if let Some(raised) = &outcome.raised {
        sections.push(section("error", raised.traceback.trim_end(), char_limit));
    }

    if sections.is_empty() {
        return ("No output produced.".to_string(), false);
    }

    (sections.join("\n"), outcome.raised.is_some())
}

pub fn executor_failure(err: &anyhow::Error) -> String {
    format!("Error: the Python session failed to run the code: {err:#}")
}

fn section(label: &str, text: &str, char_limit: usize) -> String {
    format!("[{label}]:\n{}", truncate_output(text, label, char_limit))
}

/// Keeps the first `char_limit` characters and appends a marker naming the stream.
/// A limit of 0 disables truncation.
pub fn truncate_output(text: &str, label: &str, char_limit: usize) -> String {
    if char_limit == 0 || text.chars().count() <= char_limit {
        return text.to_string();
    }

    let kept = text.chars().take(char_limit).collect::<String>();
    format!("{kept}\n[... {label} truncated to {char_limit} characters]")
}
