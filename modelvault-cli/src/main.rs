//! ModelVault CLI.
//!
//! Fetch generation metadata for an image, resolve the model files it
//! used, and download the missing ones, from the terminal or as an HTTP
//! service.

mod commands;
mod error;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{download, fetch, resolve, serve};
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "modelvault", version, about = "Resolve and download the model files behind generated images")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Registry API key. Falls back to the CIVITAI_API_KEY environment
    /// variable.
    #[arg(long, global = true, env = "CIVITAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Models root directory. Defaults to ./models.
    #[arg(long, global = true)]
    models_dir: Option<std::path::PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch generation metadata for an image id or URL
    Fetch(fetch::FetchArgs),
    /// Resolve an image's model references against the registry
    Resolve(resolve::ResolveArgs),
    /// Download the model files an image depends on
    Download(download::DownloadArgs),
    /// Serve the resolve/download API over HTTP
    Serve(serve::ServeArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context::new(cli.api_key, cli.models_dir);

    let result: Result<(), CliError> = match cli.command {
        Command::Fetch(args) => fetch::run(&ctx, args).await,
        Command::Resolve(args) => resolve::run(&ctx, args).await,
        Command::Download(args) => download::run(&ctx, args).await,
        Command::Serve(args) => serve::run(&ctx, args).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", console::style("error:").red().bold(), e);
        std::process::exit(1);
    }
}
