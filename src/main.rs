mod cli;
mod server;

use clap::Parser;
use cli::{Cli, Commands};
use imgpipe::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    imgpipe::observability::init_tracing();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Server(args) => {
            if let Some(address) = args.address {
                config.server.bind_addr = address;
            }
            server::run_server(config).await?
        }
        Commands::Consumer(args) => {
            if let Some(broker) = args.broker {
                config.broker.address = broker;
                config.validate()?;
            }
            server::run_consumer(config).await?
        }
        Commands::Standalone(args) => {
            if let Some(address) = args.address {
                config.server.bind_addr = address;
            }
            server::run_standalone(config).await?
        }
    }

    Ok(())
}
