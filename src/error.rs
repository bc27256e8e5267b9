use thiserror::Error;

/// Main error type for the up/down engine
#[derive(Error, Debug)]
pub enum UpDownError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    #[error("Window not found: {0}")]
    WindowNotFound(String),

    // Order execution errors
    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Stale data: {0}")]
    StaleData(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for UpDownError
pub type Result<T> = std::result::Result<T, UpDownError>;

/// Specific error types for order execution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("No live price for token {token_id}")]
    NoLivePrice { token_id: String },

    #[error("Cutoff reached: {remaining_secs:.1}s remaining < {cutoff_secs:.1}s")]
    CutoffReached {
        remaining_secs: f64,
        cutoff_secs: f64,
    },

    #[error("Max attempts exceeded: {attempts}")]
    MaxAttemptsExceeded { attempts: u8 },

    #[error("Order rejected: {reason}")]
    Rejected { reason: String },
}

impl From<OrderError> for UpDownError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Rejected { reason } => UpDownError::OrderRejected(reason),
            other => UpDownError::OrderSubmission(other.to_string()),
        }
    }
}
