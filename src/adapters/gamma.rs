//! Window discovery over the Gamma REST API.
//!
//! Recurring up/down events use slugs of the form `{prefix}-{start_ts}` where
//! `start_ts` is the window open aligned to the interval, so the window that
//! contains "now" can be looked up directly.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::MarketConfig;
use crate::domain::MarketWindow;
use crate::error::{Result, UpDownError};
use crate::strategy::MarketDiscovery;

#[derive(Debug, Clone, Deserialize)]
pub struct GammaEvent {
    pub slug: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "endDate", default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GammaMarket {
    #[serde(rename = "conditionId", default)]
    pub condition_id: Option<String>,
    /// JSON-encoded array of token IDs
    #[serde(rename = "clobTokenIds", default)]
    pub clob_token_ids: Option<String>,
    /// JSON-encoded array of outcome names
    #[serde(default)]
    pub outcomes: Option<String>,
    /// JSON-encoded array of prices
    #[serde(rename = "outcomePrices", default)]
    pub outcome_prices: Option<String>,
}

fn json_list(raw: Option<&str>) -> Option<Vec<String>> {
    serde_json::from_str::<Vec<String>>(raw?).ok()
}

/// Open timestamp of the window containing `now`
pub fn window_start_ts(now: DateTime<Utc>, interval_secs: u64) -> i64 {
    let interval = interval_secs.max(1) as i64;
    now.timestamp().div_euclid(interval) * interval
}

pub fn window_slug(prefix: &str, start_ts: i64) -> String {
    format!("{}-{}", prefix, start_ts)
}

/// Build a window from a Gamma event whose slug opened at `start_ts`
pub fn window_from_event(
    event: &GammaEvent,
    start_ts: i64,
    interval_secs: u64,
) -> Result<MarketWindow> {
    let market = event
        .markets
        .first()
        .ok_or_else(|| UpDownError::InvalidMarketData(format!("{}: no markets", event.slug)))?;

    let tokens = json_list(market.clob_token_ids.as_deref())
        .filter(|t| t.len() >= 2)
        .ok_or_else(|| {
            UpDownError::InvalidMarketData(format!("{}: missing clobTokenIds", event.slug))
        })?;

    // Outcomes are normally ["Up","Down"]; honour a reversed listing
    let reversed = json_list(market.outcomes.as_deref())
        .and_then(|o| o.first().cloned())
        .map(|first| first.eq_ignore_ascii_case("down"))
        .unwrap_or(false);
    let (up_idx, down_idx) = if reversed { (1, 0) } else { (0, 1) };

    let start = Utc
        .timestamp_opt(start_ts, 0)
        .single()
        .ok_or_else(|| UpDownError::InvalidMarketData(format!("bad start {}", start_ts)))?;
    let end = event
        .end_date
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| start + chrono::Duration::seconds(interval_secs as i64));

    let mut window = MarketWindow::new(
        event.slug.clone(),
        event.title.clone().unwrap_or_else(|| event.slug.clone()),
        tokens[up_idx].clone(),
        tokens[down_idx].clone(),
        start,
        end,
    );

    if let Some(condition_id) = &market.condition_id {
        window = window.with_condition_id(condition_id.clone());
    }

    let prices: Option<Vec<Decimal>> = json_list(market.outcome_prices.as_deref())
        .map(|p| p.iter().filter_map(|v| v.parse::<Decimal>().ok()).collect());
    if let Some(prices) = prices.filter(|p| p.len() >= 2) {
        window = window.with_initial_odds(prices[up_idx], prices[down_idx]);
    }

    Ok(window)
}

/// Gamma REST client
#[derive(Debug, Clone)]
pub struct GammaClient {
    http: reqwest::Client,
    base_url: String,
    slug_prefix: String,
    interval_secs: u64,
}

impl GammaClient {
    pub fn new(config: &MarketConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.gamma_url.trim_end_matches('/').to_string(),
            slug_prefix: config.slug_prefix.clone(),
            interval_secs: config.interval_secs,
        })
    }

    /// Fetch an event by slug; `None` if Gamma does not know it
    pub async fn event_by_slug(&self, slug: &str) -> Result<Option<GammaEvent>> {
        let url = format!("{}/events", self.base_url);
        let resp = self.http.get(&url).query(&[("slug", slug)]).send().await?;

        if !resp.status().is_success() {
            return Err(UpDownError::MarketDataUnavailable(format!(
                "Gamma returned {} for {}",
                resp.status(),
                slug
            )));
        }

        let events: Vec<GammaEvent> = resp.json().await?;
        Ok(events.into_iter().next())
    }
}

#[async_trait]
impl MarketDiscovery for GammaClient {
    async fn current_window(&self, now: DateTime<Utc>) -> Result<Option<MarketWindow>> {
        let start_ts = window_start_ts(now, self.interval_secs);
        let slug = window_slug(&self.slug_prefix, start_ts);
        debug!("Looking up window {}", slug);

        match self.event_by_slug(&slug).await? {
            Some(event) if !event.closed => {
                window_from_event(&event, start_ts, self.interval_secs).map(Some)
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn event(outcomes: &str) -> GammaEvent {
        serde_json::from_str(&format!(
            r#"{{
                "slug": "btc-updown-15m-1735689600",
                "title": "Bitcoin Up or Down - Jan 1, 12:00AM ET",
                "endDate": "2025-01-01T00:15:00Z",
                "closed": false,
                "markets": [{{
                    "conditionId": "0xabc",
                    "clobTokenIds": "[\"111\", \"222\"]",
                    "outcomes": "{}",
                    "outcomePrices": "[\"0.535\", \"0.465\"]"
                }}]
            }}"#,
            outcomes
        ))
        .unwrap()
    }

    #[test]
    fn test_window_start_alignment() {
        let now = Utc.timestamp_opt(1_735_690_123, 0).unwrap();
        assert_eq!(window_start_ts(now, 900), 1_735_689_600);
        assert_eq!(
            window_slug("btc-updown-15m", 1_735_689_600),
            "btc-updown-15m-1735689600"
        );
    }

    #[test]
    fn test_window_from_event() {
        let w = window_from_event(&event(r#"[\"Up\", \"Down\"]"#), 1_735_689_600, 900).unwrap();
        assert_eq!(w.id, "btc-updown-15m-1735689600");
        assert_eq!(w.up_token_id, "111");
        assert_eq!(w.down_token_id, "222");
        assert_eq!(w.condition_id.as_deref(), Some("0xabc"));
        assert_eq!(w.initial_odds, Some((dec!(0.535), dec!(0.465))));
        assert_eq!((w.end_time - w.start_time).num_seconds(), 900);
    }

    #[test]
    fn test_reversed_outcomes() {
        let w = window_from_event(&event(r#"[\"Down\", \"Up\"]"#), 1_735_689_600, 900).unwrap();
        assert_eq!(w.up_token_id, "222");
        assert_eq!(w.initial_odds, Some((dec!(0.465), dec!(0.535))));
    }

    #[test]
    fn test_missing_tokens_is_error() {
        let mut e = event(r#"[\"Up\", \"Down\"]"#);
        e.markets[0].clob_token_ids = None;
        assert!(window_from_event(&e, 0, 900).is_err());
    }
}
