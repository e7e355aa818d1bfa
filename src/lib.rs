pub mod agent;
pub mod cli;
pub mod config;
pub mod http;
pub mod llm;
pub mod python;
pub mod trace;

use agent::{AgentConfig, ConversationHistory, prompt::system_prompt};
use anyhow::{Result, anyhow, bail};
use cli::{AppState, CliArgs, Theme, run_repl};
use config::AppConfig;
use http::client::HttpClient;
use http::debug::HttpDebugConfig;
use llm::anthropic::AnthropicChannel;
use python::PythonSession;
use std::fs;
use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};
use trace::SessionTrace;

pub async fn run(args: CliArgs) -> Result<()> {
    if args.smoke_python {
        return smoke_python();
    }

    let config = AppConfig::load_with_path(args.config.as_deref())?;
    let python = PythonSession::initialize()?;
    let startup_message = run_startup_script_if_configured(&python, &config)?;
    let session_id = generate_session_id();
    let trace = SessionTrace::create(&session_id)?;
    let http = HttpClient::new(
        reqwest::Client::new(),
        HttpDebugConfig::from_verbose(args.verbose),
    )
    .with_trace(trace.clone());
    let channel = AnthropicChannel::new(
        http,
        config.anthropic_api_key.clone(),
        config.anthropic_model.clone(),
        config.anthropic_base_url.clone(),
    )
    .ok();

    let agent_config = agent_config_for(&config, &python)?;
    let theme = Theme::from_config(color_enabled(), &config.theme);

    let mut app_state = AppState {
        session_id,
        python,
        channel,
        agent_config,
        history: ConversationHistory::new(),
        theme,
        startup_message,
        trace,
    };

    run_repl(&mut app_state).await
}

fn smoke_python() -> Result<()> {
    let python = PythonSession::initialize()?;
    let result = python.eval_expr("1 + 1")?;
    if !python.is_healthy() || result.value_repr != "2" {
        bail!(
            "smoke-python: unexpected interpreter state (1 + 1 = {})",
            result.value_repr
        );
    }

    println!("smoke-python: ok (Python {})", python.python_version()?);
    Ok(())
}

fn agent_config_for(config: &AppConfig, python: &PythonSession) -> Result<AgentConfig> {
    let python_version = python.python_version()?;
    let packages = python.installed_packages()?;

    Ok(AgentConfig {
        max_tool_rounds: config.max_tool_rounds,
        max_tokens: config.max_tokens,
        thinking_budget: config.thinking_budget_tokens(),
        output_char_limit: config.output_char_limit,
        system_prompt: Some(system_prompt(&python_version, &packages)),
    })
}

fn color_enabled() -> bool {
    std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal()
}

fn run_startup_script_if_configured(
    python: &PythonSession,
    config: &AppConfig,
) -> Result<Option<String>> {
    let Some(path) = &config.startup_file else {
        return Ok(None);
    };

    let source = fs::read_to_string(path).map_err(|err| {
        anyhow!(
            "Failed to load startup file {}: unable to read file: {err}",
            path.display()
        )
    })?;

    let outcome = python.exec_code(&source)?;
    if let Some(exception) = outcome.raised {
        bail!(
            "Failed to execute startup file {}:\n{}",
            path.display(),
            exception.traceback
        );
    }

    Ok(Some(format!(
        "Startup file {} was executed",
        path.display()
    )))
}

fn generate_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis());
    format!("{millis:x}-{:x}", std::process::id())
}
