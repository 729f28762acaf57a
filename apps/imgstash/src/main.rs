//! imgstash command line entry point.

mod app;
mod bridge;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Chunked, resumable image uploads
#[derive(Parser)]
#[command(name = "imgstash")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more images
    Upload(app::UploadArgs),

    /// Print the configuration file path and effective settings
    Config,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let path = cli.config.unwrap_or_else(config::default_path);
    let config = config::Config::load(&path)?;

    match cli.command {
        Commands::Config => {
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Upload(args) => {
            tracing::debug!(version = env!("CARGO_PKG_VERSION"), files = args.files.len(), "starting upload");
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(app::upload(config, args))?;
            Ok(())
        }
    }
}
