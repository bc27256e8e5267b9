//! Price-to-beat lookup.
//!
//! The window's opening reference price is served by Polymarket's crypto price
//! endpoint. It is often not published for the first seconds of a window, in
//! which case the lookup reports "unavailable" and the caller retries.

use async_trait::async_trait;
use chrono::SecondsFormat;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::MarketConfig;
use crate::domain::MarketWindow;
use crate::error::Result;
use crate::strategy::PriceToBeatSource;

#[derive(Debug, Deserialize)]
struct CryptoPriceResponse {
    #[serde(rename = "openPrice", default)]
    open_price: Option<serde_json::Value>,
}

/// Accept the open price as a JSON number or a numeric string
fn parse_open_price(body: &str) -> Option<Decimal> {
    let resp: CryptoPriceResponse = serde_json::from_str(body).ok()?;
    let price = match resp.open_price? {
        serde_json::Value::Number(n) => Decimal::try_from(n.as_f64()?).ok()?,
        serde_json::Value::String(s) => s.parse::<Decimal>().ok()?,
        _ => return None,
    };
    (price > Decimal::ZERO).then_some(price)
}

#[derive(Debug, Clone)]
pub struct CryptoPriceClient {
    http: reqwest::Client,
    url: String,
    asset: String,
    variant: String,
}

impl CryptoPriceClient {
    pub fn new(config: &MarketConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: config.price_to_beat_url.clone(),
            asset: config.asset.to_ascii_uppercase(),
            variant: config.variant.clone(),
        })
    }
}

#[async_trait]
impl PriceToBeatSource for CryptoPriceClient {
    async fn price_to_beat(&self, window: &MarketWindow) -> Result<Option<Decimal>> {
        let start = window.start_time.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = window.end_time.to_rfc3339_opts(SecondsFormat::Secs, true);

        let resp = self
            .http
            .get(&self.url)
            .query(&[
                ("symbol", self.asset.as_str()),
                ("eventStartTime", start.as_str()),
                ("variant", self.variant.as_str()),
                ("endDate", end.as_str()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            debug!("Price to beat for {} unavailable: {}", window.id, resp.status());
            return Ok(None);
        }

        let body = resp.text().await?;
        Ok(parse_open_price(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_open_price_number_and_string() {
        assert_eq!(
            parse_open_price(r#"{"openPrice": 97123.5, "closePrice": null}"#),
            Some(dec!(97123.5))
        );
        assert_eq!(
            parse_open_price(r#"{"openPrice": "97000.25"}"#),
            Some(dec!(97000.25))
        );
    }

    #[test]
    fn test_parse_open_price_missing() {
        assert_eq!(parse_open_price(r#"{"openPrice": null}"#), None);
        assert_eq!(parse_open_price(r#"{}"#), None);
        assert_eq!(parse_open_price(r#"{"openPrice": 0}"#), None);
        assert_eq!(parse_open_price("<html>"), None);
    }
}
