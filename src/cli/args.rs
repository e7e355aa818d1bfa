use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone, PartialEq, Eq)]
#[command(name = "pyclaude")]
#[command(
    about = "Chat with Claude while it runs code in a persistent Python session",
    long_about = "Chat with Claude while it runs code in a persistent Python session\n\nConfig file loading:\n  - --config <path> (explicit file, overrides default path discovery)\n  - Default probe path when --config is not provided:\n    1. $XDG_CONFIG_HOME/pyclaude/config.toml\n    2. ~/.config/pyclaude/config.toml\n\nThe API key is read from ANTHROPIC_API_KEY (environment or .env) or from the config file."
)]
pub struct CliArgs {
    /// Load config from this file path instead of the default discovery path.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print redacted HTTP traffic with the model provider to stderr.
    #[arg(long)]
    pub verbose: bool,

    /// Initialize the embedded Python interpreter, report and exit.
    #[arg(long)]
    pub smoke_python: bool,
}
