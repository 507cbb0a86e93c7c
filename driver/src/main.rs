pub mod config;
pub mod driver;
pub mod experiment;
pub mod launchers;
pub mod staging;
pub mod store;

use clap::{Parser, Subcommand};
use std::{fs::File, process::exit, sync::Arc};
use tracing::error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE: &str = "nemo_driver.log";

#[derive(Parser, Debug)]
#[command(name = "nemo-driver", version, about = "Configure and launch NEMO/XIOS experiments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a NEMO simulation with a cluster of in-memory stores
    Clustered(driver::ClusteredArgs),
}

/// log to stderr and mirror everything into the driver log file
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    match File::create(LOG_FILE) {
        Ok(log_file) => {
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(log_file)))
                .init();
        }
        Err(e) => {
            registry.init();
            error!("Failed to open {LOG_FILE}, logging to stderr only: {e}");
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let outcome = match cli.command {
        Commands::Clustered(args) => driver::clustered(&args),
    };

    if let Err(e) = outcome {
        error!("{e}");

        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            error!("Caused by: {cause}");
            source = cause.source();
        }

        exit(1);
    }
}
