pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod strategy;

pub use config::AppConfig;
pub use error::{Result, UpDownError};
pub use strategy::{EngineDeps, EngineEvent, EngineSnapshot, StrategyEngine};
