//! `modelvault serve` - expose the resolve/download pipeline over HTTP.

use std::net::SocketAddr;

use clap::Args;
use modelvault::api::{router, ApiState};
use modelvault::config::DownloadConfig;
use modelvault::downloads::DownloadManager;
use tracing::info;

use crate::error::CliError;

use super::Context;

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8750")]
    pub listen: SocketAddr,

    /// Maximum parallel downloads
    #[arg(long, default_value_t = 3)]
    pub concurrency: usize,
}

pub async fn run(ctx: &Context, args: ServeArgs) -> Result<(), CliError> {
    let registry = ctx.registry();
    let resolver = ctx.resolver(registry.clone());
    let config = DownloadConfig::default().with_concurrency(args.concurrency);
    let manager = DownloadManager::with_verifier(config, Default::default(), ctx.api_key.clone())?;

    let state = ApiState::new(registry, resolver, manager.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .map_err(|e| CliError::Serve(format!("failed to bind {}: {e}", args.listen)))?;
    info!(listen = %args.listen, models_dir = %ctx.models_dir.display(), "serving API");
    println!("Listening on http://{}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .map_err(|e| CliError::Serve(e.to_string()))
}

/// Resolve on Ctrl+C after cancelling live downloads.
async fn shutdown_signal(manager: DownloadManager) {
    if tokio::signal::ctrl_c().await.is_ok() {
        let cancelled = manager.cancel_all();
        info!(cancelled, "shutting down");
    }
}
