use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use diffdrive_zenoh_runtime::config::{self, DriveConfig, SimConfig};
use diffdrive_zenoh_runtime::runtime;

#[derive(Parser)]
#[command(about = "Differential-drive motor runtime and kinematic simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a real base through a RoboClaw motor controller
    Drive {
        /// JSON config file (all fields optional)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Serial port, overrides the config file
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Simulate a fleet of robots without hardware
    Sim {
        /// JSON config file (all fields optional)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Drive { config, port } => match config::load::<DriveConfig>(config.as_deref()) {
            Ok(mut drive_config) => {
                if let Some(port) = port {
                    drive_config.port = port;
                }
                runtime::run_drive(drive_config).await
            }
            Err(e) => Err(e.into()),
        },
        Command::Sim { config } => match config::load::<SimConfig>(config.as_deref()) {
            Ok(sim_config) => runtime::run_sim(sim_config).await,
            Err(e) => Err(e.into()),
        },
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
