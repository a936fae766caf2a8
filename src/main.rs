// src/main.rs
mod api;
mod auth;
mod config;
mod db;
mod error;
mod gate;
mod market;
mod models;
mod reconcile;
#[cfg(test)]
mod test_upstream;

use crate::api::AppState;
use crate::auth::IdentityClient;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::market::{CoinGeckoSource, SnapshotCache};
use env_logger::{Builder, Env};
use log::{error, info};
use reqwest::Client;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    info!("Starting the coin tracker application...");

    let state = build_state(&config).await?;
    let api = api::routes(state);

    let (addr, server) = warp::serve(api).bind_with_graceful_shutdown(config.bind_addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    });
    info!("Server running on http://{} (public url {})", addr, config.public_url);
    server.await;
    info!("Server stopped.");
    Ok(())
}

/// Builds every client handle once. A store that cannot be reached aborts
/// startup.
async fn build_state(config: &Config) -> Result<AppState> {
    // One HTTP client for every upstream: identity, hosted table and market data.
    let client = Client::new();

    let store = db::init(config, client.clone()).await.map_err(|e| {
        error!("Failed to initialize holdings store: {}", e);
        e
    })?;

    let identity = IdentityClient::new(
        client.clone(),
        &config.supabase_url,
        &config.supabase_anon_key,
        config.jwt_secret.clone(),
    );
    let source = CoinGeckoSource::new(client, &config.market);
    let market = SnapshotCache::new(Arc::new(source), config.market.cache_ttl);

    Ok(AppState {
        store,
        identity: Arc::new(identity),
        market: Arc::new(market),
        paths: Arc::new(config.paths.clone()),
        reset_redirect: Arc::new(config.password_reset_redirect.clone()),
    })
}
