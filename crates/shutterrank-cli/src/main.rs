use clap::Parser;
use shutterrank_cli::{run_cli, Cli};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    run_cli(Cli::parse())
}
