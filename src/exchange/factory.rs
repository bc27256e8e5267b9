use std::sync::Arc;

use crate::adapters::{OddsBook, PaperExchange};
use crate::config::AppConfig;
use crate::error::{Result, UpDownError};

use super::{ExchangeClient, ExchangeKind};

/// Create the runtime exchange client from `AppConfig`.
pub fn build_exchange_client(
    app_config: &AppConfig,
    book: OddsBook,
) -> Result<Arc<dyn ExchangeClient>> {
    let exchange = if app_config.dry_run.enabled {
        ExchangeKind::Paper
    } else {
        ExchangeKind::Polymarket
    };

    build_exchange_client_for(exchange, book)
}

/// Create exchange client for an explicit exchange kind.
pub fn build_exchange_client_for(
    exchange: ExchangeKind,
    book: OddsBook,
) -> Result<Arc<dyn ExchangeClient>> {
    match exchange {
        ExchangeKind::Paper => Ok(Arc::new(PaperExchange::new(book))),
        ExchangeKind::Polymarket => Err(UpDownError::Validation(
            "live order submission needs an external signing gateway; \
             set dry_run.enabled = true to trade against the paper exchange"
                .to_string(),
        )),
    }
}
