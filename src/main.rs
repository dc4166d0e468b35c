use clap::{Parser, Subcommand};
use color_eyre::Result;
use plclink::app;
use plclink::config::BridgeConfig;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// PLC to MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "plclink")]
#[command(about = "Bridges PLC stations, an MQTT broker and a document store")]
#[command(version)]
struct Args {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll PLC stations and publish telemetry
    Transmitter {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Mirror telemetry into the document store and relay commands
    Server {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.verbose)?;

    match args.command {
        Commands::Transmitter { config } => {
            let config = load_config(config).await?;
            app::transmitter::run(config).await
        }
        Commands::Server { config } => {
            let config = load_config(config).await?;
            app::server::run(config).await
        }
    }
}

async fn load_config(path: Option<PathBuf>) -> Result<BridgeConfig> {
    let path = match path {
        Some(path) => path,
        None => {
            let path = BridgeConfig::default_path();
            BridgeConfig::ensure_default(&path).await?;
            path
        }
    };
    let config = BridgeConfig::load(&path).await?;
    info!("Using config {}", path.display());
    Ok(config)
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env(if verbose { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
