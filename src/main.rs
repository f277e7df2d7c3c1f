// ABOUTME: Main entry point for the redis-bridge outbound delivery worker
// ABOUTME: Resolves config from the environment, starts the worker, stops on ctrl-c

use anyhow::{Context, Result};
use clap::Parser;
use redis_bridge::{config::BridgeConfig, plugin::BridgePlugin};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Outbound delivery worker for the Redis message bridge",
    long_about = None
)]
struct Cli {
    /// Redis connection string
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Consumer group on the outbound stream
    #[arg(long, env = "REDIS_BRIDGE_CONSUMER_GROUP")]
    consumer_group: Option<String>,

    /// Consumer name within the group
    #[arg(long, env = "REDIS_BRIDGE_CONSUMER_NAME")]
    consumer_name: Option<String>,

    /// Content publisher endpoint for oversize messages
    #[arg(long, env = "CONTENT_PUBLISHER_URL")]
    content_publisher_url: Option<String>,

    /// Bearer token for the content publisher
    #[arg(long, env = "CONTENT_PUBLISHER_TOKEN")]
    content_publisher_token: Option<String>,

    /// Public base URL used in published-page links
    #[arg(long, env = "CONTENT_PUBLISHER_PUBLIC_URL")]
    content_publisher_public_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,redis_bridge=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = BridgeConfig::from_env().context("Failed to resolve bridge configuration")?;
    if let Some(redis_url) = cli.redis_url {
        config.redis_url = redis_url;
    }
    if let Some(group) = cli.consumer_group {
        config.consumer_group = group;
    }
    if let Some(name) = cli.consumer_name {
        config.consumer_name = name;
    }
    if let Some(url) = cli.content_publisher_url {
        config.publisher_url = Some(url);
    }
    if let Some(token) = cli.content_publisher_token {
        config.publisher_token = Some(token);
    }
    if let Some(public_url) = cli.content_publisher_public_url {
        config.publisher_public_url = Some(public_url);
    }

    tracing::info!(
        redis_url = %config.redis_url,
        group = %config.consumer_group,
        consumer = %config.consumer_name,
        publisher = config.publisher_url.is_some(),
        "Starting redis-bridge outbound worker"
    );

    let plugin = BridgePlugin::new(config).await?;
    plugin.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    plugin.stop().await;

    Ok(())
}
