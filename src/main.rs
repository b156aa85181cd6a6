use anyhow::Result;
use ashare_agent::cli::CliArgs;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    ashare_agent::run(args).await
}
