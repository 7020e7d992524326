//! appliancectl - command line client for the appliance operator API

use anyhow::Result;
use clap::Parser;

mod client;
mod commands;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
