use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::{OrderRequest, OrderResponse};
use crate::error::{Result, UpDownError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Simulated fills against the live odds book
    Paper,
    /// Signed orders through an external gateway
    Polymarket,
}

impl Default for ExchangeKind {
    fn default() -> Self {
        Self::Paper
    }
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Polymarket => "polymarket",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "paper" | "dry" | "dry-run" => Ok(Self::Paper),
            "polymarket" | "pm" => Ok(Self::Polymarket),
            _ => Err("invalid exchange; expected paper|polymarket"),
        }
    }
}

pub fn parse_exchange_kind(raw: &str) -> Result<ExchangeKind> {
    ExchangeKind::from_str(raw).map_err(|e| UpDownError::Validation(e.to_string()))
}

/// Order submission and exit for one venue.
///
/// Implementations apply their own signing and auth.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    fn is_dry_run(&self) -> bool;

    /// Submit a buy or sell. FOK orders come back terminal; GTC orders may be `Open`.
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResponse>;

    async fn get_order(&self, order_id: &str) -> Result<OrderResponse>;

    /// Returns `true` if a resting order was cancelled
    async fn cancel_order(&self, order_id: &str) -> Result<bool>;
}

/// Latest tradable price for a token, read fresh before every order attempt
pub trait LivePriceSource: Send + Sync {
    /// Price a buyer would pay right now
    fn buy_price(&self, token_id: &str) -> Option<Decimal>;

    /// Price a seller would receive right now
    fn sell_price(&self, token_id: &str) -> Option<Decimal>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exchange_kind_accepts_aliases() {
        assert_eq!(
            parse_exchange_kind("paper").expect("paper should parse"),
            ExchangeKind::Paper
        );
        assert_eq!(
            parse_exchange_kind("pm").expect("pm alias should parse"),
            ExchangeKind::Polymarket
        );
    }

    #[test]
    fn parse_exchange_kind_rejects_unknown_value() {
        assert!(parse_exchange_kind("kalshi").is_err());
    }
}
