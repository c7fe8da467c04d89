use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use shiftlist_cli::{run_cli, Cli};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = run_cli(cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
