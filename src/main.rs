//! nimbus CLI entry point.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nimbus::{Client, Config, Server};

mod cli;

/// nimbus - personal cloud daemon over the multipass CLI
#[derive(Parser, Debug)]
#[command(name = "nimbus")]
#[command(about = "Personal cloud daemon over the multipass CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
    },

    /// List all VMs
    #[command(alias = "ls")]
    List,

    /// Create a new VM
    Create(cli::vm::CreateArgs),

    /// Start a stopped VM
    Start {
        /// VM name
        name: String,
    },

    /// Stop a running VM
    Stop {
        /// VM name
        name: String,
    },

    /// Restart a VM
    Restart {
        /// VM name
        name: String,
    },

    /// Delete a VM permanently
    Delete {
        /// VM name
        name: String,
        /// Keep the VM recoverable instead of purging
        #[arg(long)]
        keep_recoverable: bool,
    },

    /// Print the browser shell URL for a VM
    ShellUrl {
        /// VM name
        name: String,
        /// Daemon address the URL should point at
        #[arg(long, default_value = "localhost:8080")]
        daemon: String,
    },

    /// Print the management auth token
    Token,
}

#[tokio::main]
async fn main() {
    init_logging();

    tracing::debug!(version = nimbus::VERSION, "starting nimbus");

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve { listen } => serve(listen).await,
        Commands::List => cli::vm::list().await,
        Commands::Create(args) => cli::vm::create(args).await,
        Commands::Start { name } => cli::vm::start(&name).await,
        Commands::Stop { name } => cli::vm::stop(&name).await,
        Commands::Restart { name } => cli::vm::restart(&name).await,
        Commands::Delete {
            name,
            keep_recoverable,
        } => cli::vm::delete(&name, keep_recoverable).await,
        Commands::ShellUrl { name, daemon } => cli::vm::shell_url(&name, &daemon).await,
        Commands::Token => print_token(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn serve(listen: SocketAddr) -> nimbus::Result<()> {
    let config = Config::load()?;
    let server = Server::new(config, Client::new(), listen);
    server.run().await
}

fn print_token() -> nimbus::Result<()> {
    println!("{}", Config::load()?.auth_token);
    Ok(())
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nimbus=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
