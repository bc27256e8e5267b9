pub mod factory;
mod traits;

pub use factory::{build_exchange_client, build_exchange_client_for};
pub use traits::{parse_exchange_kind, ExchangeClient, ExchangeKind, LivePriceSource};
