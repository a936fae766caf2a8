// src/reconcile.rs
use crate::models::{EnrichedHolding, Holding, MarketQuote, PortfolioView};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Joins holdings with a quote snapshot by case-insensitive symbol.
///
/// Output order and length follow `holdings`. When a symbol appears more than
/// once in `quotes` the last occurrence wins. Holdings without a quote fall
/// back to their purchase price with a 24h change of zero.
pub fn enrich(holdings: &[Holding], quotes: &[MarketQuote]) -> Vec<EnrichedHolding> {
    let by_symbol: HashMap<String, &MarketQuote> = quotes
        .iter()
        .map(|quote| (quote.symbol.to_lowercase(), quote))
        .collect();

    holdings
        .iter()
        .map(|holding| {
            match by_symbol.get(&holding.symbol.as_str().to_lowercase()) {
                Some(quote) => EnrichedHolding {
                    holding: holding.clone(),
                    current_price: quote.current_price,
                    price_change_24h: quote.price_change_24h,
                    total_value: holding.quantity * quote.current_price,
                    image: Some(quote.image.clone()),
                },
                None => EnrichedHolding {
                    holding: holding.clone(),
                    current_price: holding.purchase_price,
                    price_change_24h: 0.0,
                    total_value: holding.quantity * holding.purchase_price,
                    image: None,
                },
            }
        })
        .collect()
}

/// Builds the portfolio page model. `quotes` is `None` when the snapshot
/// could not be fetched, in which case every holding takes the miss path.
pub fn portfolio(
    holdings: &[Holding],
    quotes: Option<&[MarketQuote]>,
    now: DateTime<Utc>,
) -> PortfolioView {
    let enriched = enrich(holdings, quotes.unwrap_or(&[]));
    let total_value = enriched.iter().map(|h| h.total_value).sum();
    PortfolioView {
        total_value,
        holdings: enriched,
        last_updated: now,
        prices_available: quotes.is_some(),
    }
}
