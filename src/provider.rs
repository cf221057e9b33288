//! Provider client creation

use crate::client::{AnthropicClient, OpenAiClient, ProviderClient};
use crate::config::{ProviderConfig, ProviderType};
use crate::Result;

/// Create a wire client for the configured provider dialect.
///
/// Returns a trait object so callers are decoupled from concrete provider
/// types. Adding a new dialect only requires a new match arm here.
pub fn create_client(config: &ProviderConfig) -> Result<Box<dyn ProviderClient>> {
    match config.provider_type {
        ProviderType::OpenAi => Ok(Box::new(OpenAiClient::new(config)?)),
        ProviderType::Anthropic => Ok(Box::new(AnthropicClient::new(config)?)),
    }
}
