mod cli;
mod harness;
mod pipeline;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log)?)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Inspect { path } => pipeline::inspect(&path),
        Command::Convert(args) => pipeline::convert(args),
        Command::Status {
            server,
            version,
            metadata,
        } => harness::status(server, version, metadata).await,
        Command::Predict {
            server,
            instances,
            input_dim,
        } => harness::predict(server, &instances, input_dim).await,
        Command::Evaluate {
            server,
            examples,
            min_accuracy,
        } => harness::evaluate(server, &examples, min_accuracy).await,
    }
}
