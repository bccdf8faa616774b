use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use arv::config::ServerConfig;
use arv::error::Result;
use arv::manager::SessionManager;
use arv::server::{AppState, serve};

#[derive(Parser)]
#[command(name = "arv-server", about = "Multi-agent code-review orchestrator", version)]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator server.
    Serve {
        /// Port to bind.
        #[arg(short, long)]
        port: Option<u16>,

        /// State directory (default: $ARV_STORAGE_ROOT or ./.arv).
        #[arg(long)]
        storage_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("arv=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arv=info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve { port, storage_root } => {
            let root = storage_root
                .or_else(|| std::env::var("ARV_STORAGE_ROOT").ok().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(".arv"));
            tokio::fs::create_dir_all(&root).await?;

            let mut config = ServerConfig::load(&root).await?;
            if let Some(port) = port {
                config.server.port = port;
            }
            let port = config.server.port;

            let manager = SessionManager::load(config).await?;
            serve(AppState::new(manager), port).await
        }
    }
}
