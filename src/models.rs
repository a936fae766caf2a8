// src/models.rs
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ticker symbol in canonical (lower) case. Normalised on every way in,
/// including records read back from a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Symbol {
    fn from(raw: String) -> Self {
        Symbol(raw.trim().to_lowercase())
    }
}

impl From<&str> for Symbol {
    fn from(raw: &str) -> Self {
        Symbol(raw.trim().to_lowercase())
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

/// A stored position. Timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub symbol: Symbol,
    pub quantity: f64,
    pub purchase_price: f64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Numeric form field: a JSON number or the raw text typed into a form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberInput {
    Number(f64),
    Text(String),
}

impl NumberInput {
    /// Parses a finite, non-negative real.
    fn parse(&self, field: &str) -> Result<f64> {
        let value = match self {
            NumberInput::Number(n) => *n,
            NumberInput::Text(raw) => raw
                .trim()
                .parse::<f64>()
                .map_err(|_| AppError::Validation(format!("{} must be a number", field)))?,
        };
        if !value.is_finite() {
            return Err(AppError::Validation(format!("{} must be a number", field)));
        }
        if value < 0.0 {
            return Err(AppError::Validation(format!("{} must not be negative", field)));
        }
        Ok(value)
    }
}

/// Raw create request as submitted by the client.
#[derive(Debug, Clone, Deserialize)]
pub struct HoldingDraft {
    pub name: String,
    pub symbol: String,
    pub quantity: NumberInput,
    pub purchase_price: NumberInput,
}

/// A create request that passed validation. The only shape a store accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHolding {
    pub name: String,
    pub symbol: Symbol,
    pub quantity: f64,
    pub purchase_price: f64,
}

fn required_text(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

impl HoldingDraft {
    pub fn validate(self) -> Result<NewHolding> {
        let name = required_text(&self.name, "name")?;
        let symbol = Symbol::from(required_text(&self.symbol, "symbol")?);
        Ok(NewHolding {
            name,
            symbol,
            quantity: self.quantity.parse("quantity")?,
            purchase_price: self.purchase_price.parse("purchase_price")?,
        })
    }
}

/// Raw update request. Absent fields stay untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HoldingPatch {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub quantity: Option<NumberInput>,
    pub purchase_price: Option<NumberInput>,
}

/// Validated set of field changes for an existing holding.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HoldingChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<Symbol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_price: Option<f64>,
}

impl HoldingPatch {
    pub fn validate(self) -> Result<HoldingChanges> {
        let changes = HoldingChanges {
            name: self
                .name
                .as_deref()
                .map(|n| required_text(n, "name"))
                .transpose()?,
            symbol: self
                .symbol
                .as_deref()
                .map(|s| required_text(s, "symbol").map(Symbol::from))
                .transpose()?,
            quantity: self
                .quantity
                .as_ref()
                .map(|q| q.parse("quantity"))
                .transpose()?,
            purchase_price: self
                .purchase_price
                .as_ref()
                .map(|p| p.parse("purchase_price"))
                .transpose()?,
        };
        if changes.is_empty() {
            return Err(AppError::Validation("nothing to update".to_string()));
        }
        Ok(changes)
    }
}

impl HoldingChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.symbol.is_none()
            && self.quantity.is_none()
            && self.purchase_price.is_none()
    }

    pub fn apply(&self, holding: &mut Holding) {
        if let Some(name) = &self.name {
            holding.name = name.clone();
        }
        if let Some(symbol) = &self.symbol {
            holding.symbol = symbol.clone();
        }
        if let Some(quantity) = self.quantity {
            holding.quantity = quantity;
        }
        if let Some(price) = self.purchase_price {
            holding.purchase_price = price;
        }
    }
}

/// Market snapshot entry for one coin. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub current_price: f64,
    #[serde(rename = "price_change_percentage_24h")]
    pub price_change_24h: f64,
    pub image: String,
}

/// Holding joined with its quote, for display only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedHolding {
    #[serde(flatten)]
    pub holding: Holding,
    pub current_price: f64,
    pub price_change_24h: f64,
    pub total_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioView {
    pub total_value: f64,
    pub holdings: Vec<EnrichedHolding>,
    pub last_updated: DateTime<Utc>,
    pub prices_available: bool,
}
