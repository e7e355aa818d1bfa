mod args;
mod commands;
mod input;
mod render;
mod repl;
pub(crate) mod theme;

pub use args::CliArgs;
pub use repl::{AppState, run_repl};
pub use theme::Theme;
