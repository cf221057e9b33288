//! Re-exports from all modules
mod classify;
mod client;
mod config;
mod executor;
mod gateway;
mod message;
mod pool;
mod provider;
mod roster;

use std::time::Duration;
use thiserror::Error;

/// Result type for promptgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for promptgate operations.
///
/// The first three variants are the per-attempt failure taxonomy the retry
/// machinery acts on; the exhaustion variants are terminal for a request.
#[derive(Debug, Error)]
pub enum Error {
    /// Provider signaled throttling (HTTP 429 or a quota marker in the body)
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Backoff hint parsed from the provider's response, when present
        retry_after: Option<Duration>,
    },

    /// Retryable provider failure (timeout, connect error, 5xx)
    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    /// The attempted model cannot serve this request (not found, no capacity)
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Every credential in the pool is cooling down
    #[error("credential pool exhausted: all keys cooling down")]
    PoolExhausted,

    /// Every candidate model was tried and failed
    #[error("model roster exhausted")]
    RosterExhausted,

    /// A request for the same resource key is already in flight
    #[error("resource busy: a request is already in flight")]
    Busy,

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

pub use classify::{backoff_delay, classify, extract_retry_hint, ErrorClass};
pub use client::{ProviderClient, StreamEvent};
pub use config::{GatewayConfig, ModelSpec, ProviderConfig, ProviderType, RetryConfig};
pub use executor::{Attempt, Executor};
pub use gateway::{Gateway, Reply, SubmitError};
pub use message::{ChatPayload, Message, MessageRole, SubmitOptions, Usage};
pub use pool::{ApiKey, KeyPool};
pub use provider::create_client;
pub use roster::{ModelEntry, ModelRoster};
