use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = artifact_registry_cli::Cli::parse();
    artifact_registry_cli::run_cli(cli)
}
