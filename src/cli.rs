use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "imgpipe")]
#[command(about = "Image upload and classification pipeline", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $IMGPIPE_CONFIG or config/imgpipe.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the upload API
    Server(ServerArgs),
    /// Run the task consumer
    Consumer(ConsumerArgs),
    /// Run the upload API and the consumer in one process
    Standalone(ServerArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    /// Address to bind the HTTP server to (overrides server.bind_addr)
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct ConsumerArgs {
    /// Broker URI (overrides broker.address)
    #[arg(long)]
    pub broker: Option<String>,
}
