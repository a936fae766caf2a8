// src/market.rs
use crate::config::MarketConfig;
use crate::error::{AppError, Result};
use crate::models::MarketQuote;
use async_trait::async_trait;
use log::{debug, error, info};
use moka::future::Cache;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Where market snapshots come from.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<MarketQuote>>;
}

#[derive(Deserialize)]
struct CoinMarket {
    #[serde(default)]
    id: String,
    symbol: String,
    name: String,
    current_price: Option<f64>,
    price_change_percentage_24h: Option<f64>,
    image: Option<String>,
}

impl CoinMarket {
    /// Coins without a price are useless for valuation and are dropped.
    fn into_quote(self) -> Option<MarketQuote> {
        let current_price = self.current_price?;
        Some(MarketQuote {
            id: self.id,
            symbol: self.symbol,
            name: self.name,
            current_price,
            price_change_24h: self.price_change_percentage_24h.unwrap_or(0.0),
            image: self.image.unwrap_or_default(),
        })
    }
}

/// CoinGecko-style `/coins/markets` endpoint, top coins by market cap.
pub struct CoinGeckoSource {
    client: Client,
    base_url: String,
    vs_currency: String,
    per_page: u32,
}

impl CoinGeckoSource {
    pub fn new(client: Client, config: &MarketConfig) -> Self {
        CoinGeckoSource {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            vs_currency: config.vs_currency.clone(),
            per_page: config.per_page,
        }
    }
}

#[async_trait]
impl QuoteSource for CoinGeckoSource {
    async fn fetch(&self) -> Result<Vec<MarketQuote>> {
        let url = format!("{}/coins/markets", self.base_url);
        let per_page = self.per_page.to_string();
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[
                ("vs_currency", self.vs_currency.as_str()),
                ("order", "market_cap_desc"),
                ("per_page", per_page.as_str()),
                ("page", "1"),
                ("sparkline", "false"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            error!("Failed to fetch market data: HTTP {}", response.status());
            return Err(AppError::Upstream(format!(
                "market data provider returned HTTP {}",
                response.status()
            )));
        }

        let coins: Vec<CoinMarket> = response.json().await?;
        Ok(coins.into_iter().filter_map(CoinMarket::into_quote).collect())
    }
}

/// Single shared snapshot with a fixed revalidation window. Concurrent misses
/// share one upstream call. A failed refresh is reported to the caller and is
/// never cached, so an expired snapshot is never served.
pub struct SnapshotCache {
    source: Arc<dyn QuoteSource>,
    cache: Cache<(), Arc<Vec<MarketQuote>>>,
}

impl SnapshotCache {
    pub fn new(source: Arc<dyn QuoteSource>, ttl: Duration) -> Self {
        SnapshotCache {
            source,
            cache: Cache::builder().time_to_live(ttl).max_capacity(1).build(),
        }
    }

    pub async fn get(&self) -> Result<Arc<Vec<MarketQuote>>> {
        if let Some(quotes) = self.cache.get(&()).await {
            debug!("Serving cached market snapshot");
            return Ok(quotes);
        }

        let source = self.source.clone();
        self.cache
            .try_get_with((), async move {
                let quotes = source.fetch().await?;
                info!("Fetched market snapshot with {} quotes", quotes.len());
                Ok::<_, AppError>(Arc::new(quotes))
            })
            .await
            .map_err(|shared| match shared.as_ref() {
                AppError::Upstream(message) => AppError::Upstream(message.clone()),
                other => AppError::Upstream(other.to_string()),
            })
    }
}
