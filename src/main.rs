use anyhow::Result;
use clap::Parser;
use pyclaude::cli::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    pyclaude::run(args).await
}
