// src/config.rs
use crate::error::{AppError, Result};
use crate::gate::GatePaths;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Hosted table behind the provider's REST interface.
    Rest,
    Scylla,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rest" => Ok(StoreBackend::Rest),
            "scylla" => Ok(StoreBackend::Scylla),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(AppError::Config(format!("unknown STORE_BACKEND '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub api_url: String,
    pub vs_currency: String,
    pub per_page: u32,
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub public_url: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub jwt_secret: Option<String>,
    pub store_backend: StoreBackend,
    pub scylla_node: String,
    pub market: MarketConfig,
    pub password_reset_redirect: String,
    pub paths: GatePaths,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            var(key).ok_or_else(|| AppError::Config(format!("{} must be set", key)))
        };

        let bind_addr = var("BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:3030".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| AppError::Config(format!("invalid BIND_ADDR: {}", e)))?;
        let public_url = var("PUBLIC_URL")
            .unwrap_or_else(|| format!("http://{}", bind_addr))
            .trim_end_matches('/')
            .to_string();

        let store_backend = match var("STORE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => StoreBackend::Rest,
        };

        let per_page = parse_number::<u32>(var("MARKET_PER_PAGE"), "MARKET_PER_PAGE", 100)?;
        let ttl_secs = parse_number::<u64>(var("MARKET_CACHE_TTL_SECS"), "MARKET_CACHE_TTL_SECS", 60)?;

        let password_reset_redirect = var("PASSWORD_RESET_REDIRECT")
            .unwrap_or_else(|| format!("{}/auth/reset-password", public_url));

        Ok(Config {
            bind_addr,
            public_url,
            supabase_url: required("SUPABASE_URL")?.trim_end_matches('/').to_string(),
            supabase_anon_key: required("SUPABASE_ANON_KEY")?,
            jwt_secret: var("SUPABASE_JWT_SECRET"),
            store_backend,
            scylla_node: var("SCYLLA_NODE").unwrap_or_else(|| "127.0.0.1:9042".to_string()),
            market: MarketConfig {
                api_url: var("MARKET_API_URL")
                    .unwrap_or_else(|| "https://api.coingecko.com/api/v3".to_string()),
                vs_currency: var("MARKET_VS_CURRENCY").unwrap_or_else(|| "brl".to_string()),
                per_page,
                cache_ttl: Duration::from_secs(ttl_secs),
            },
            password_reset_redirect,
            paths: GatePaths::default(),
        })
    }
}

fn parse_number<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} must be a number, got '{}'", key, value))),
        None => Ok(default),
    }
}
