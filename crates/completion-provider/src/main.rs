//! Completion provider binary

use anyhow::Result;
use clap::Parser;
use completion_provider::logging::{self, LogFormat};
use completion_provider::rpc::{self, RpcClient};
use completion_provider::server::JobConnectionListener;
use completion_provider::upstream::OpenAiClient;
use completion_provider::{CompletionProvider, JobStore, ProviderConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Serve OpenAI-compatible completion jobs to the marketplace
#[derive(Parser)]
#[command(name = "completion-provider", version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(LogFormat::from_env());
    let cli = Cli::parse();

    let config = ProviderConfig::load(&cli.config)?;
    tracing::debug!(?config, "Loaded config");
    let offers = config.offers()?;

    let store = JobStore::open(&config.database_url)?;
    tracing::info!("Opened job store at {}", config.database_url);

    let api = OpenAiClient::new(
        config.openai_base_url.clone(),
        config.openai_api_key.clone(),
        Duration::from_secs(config.request_timeout_secs),
    )?;

    let (rpc_client, incoming) = RpcClient::connect(&config.rpc_addr()).await?;

    let provider = CompletionProvider::new(
        offers,
        store,
        Arc::new(api),
        Arc::new(rpc_client.clone()),
        Duration::from_secs(config.registry_grace_secs),
    );

    let listener = JobConnectionListener::bind(&config.job_listen_addr).await?;
    tracing::info!("Listening for job connections on {}", listener.local_addr()?);

    provider.init().await?;

    let events = tokio::spawn(rpc::serve_events(
        rpc_client,
        incoming,
        Arc::new(provider.clone()),
    ));

    tokio::select! {
        result = listener.serve(provider) => result?,
        _ = events => tracing::warn!("Marketplace RPC connection ended"),
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down..."),
    }

    Ok(())
}
