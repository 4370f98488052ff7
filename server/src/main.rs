//! Aether Server - message service for the Aether Meet team chat

use std::sync::Arc;

use aether_server::{build_router, config::Config, storage::Storage, AppState};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Aether Server CLI
#[derive(Parser)]
#[command(name = "aether-server")]
#[command(about = "Team chat message service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run,

    /// Purge revocation entries of tokens that have expired
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "aether_server=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Arc::new(Config::load(&cli.config).await?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await?,
        Commands::Cleanup => cleanup(&config).await?,
    }

    Ok(())
}

async fn cleanup(config: &Config) -> anyhow::Result<()> {
    let storage = Storage::new(&config.storage.database_url).await?;
    let purged = storage.purge_revoked_tokens().await?;
    println!("Purged {} expired revocation entries", purged);
    Ok(())
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Starting Aether Server v{}", env!("CARGO_PKG_VERSION"));

    let storage = Arc::new(Storage::new(&config.storage.database_url).await?);
    let storage_for_cleanup = Arc::clone(&storage);

    let state = AppState::new(config.clone(), storage)?;
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;

    let cleanup_interval = config.storage.cleanup_interval_minutes.max(1);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(cleanup_interval * 60));
        loop {
            interval.tick().await;
            match storage_for_cleanup.purge_revoked_tokens().await {
                Ok(purged) if purged > 0 => {
                    tracing::info!("Cleanup: removed {} expired revocation entries", purged);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Cleanup failed: {}", e);
                }
            }
        }
    });

    axum::serve(listener, app).await?;

    Ok(())
}
