use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Rejected synchronously by `add_subscription`.
    #[error("Invalid subscription: {0}")]
    InvalidConfig(String),

    #[error("Realtime channel {channel} reported an error: {message}")]
    Channel { channel: String, message: String },

    #[error("Realtime channel {0} timed out")]
    TimedOut(String),

    #[error("Realtime channel {0} closed unexpectedly")]
    Closed(String),

    #[error("Could not reconnect {key} after {attempts} attempts, manual retry required")]
    ReconnectExhausted { key: String, attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Ownership lookup failed: {0}")]
    Lookup(String),

    #[error("Realtime context has been disposed")]
    Disposed,

    #[error("Configuration error: {0}")]
    Config(String),
}
