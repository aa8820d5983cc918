//! Model provider implementations for Quill.
//!
//! All providers implement the `quill_core::Provider` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use quill_core::error::ProviderError;
use std::sync::Arc;

/// Build the configured provider.
///
/// Fails with [`ProviderError::NotConfigured`] when no API key is available.
pub fn build_from_config(
    config: &quill_config::AppConfig,
) -> Result<Arc<dyn quill_core::Provider>, ProviderError> {
    let api_key = config
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            ProviderError::NotConfigured(
                "no API key found; set QUILL_API_KEY or MOONSHOT_API_KEY, or add api_key to config.toml"
                    .into(),
            )
        })?;

    let name = if config.base_url.contains("moonshot") {
        "moonshot"
    } else if config.base_url.contains("openai.com") {
        "openai"
    } else {
        "custom"
    };

    tracing::debug!(provider = name, base_url = %config.base_url, "Building provider");

    Ok(Arc::new(OpenAiCompatProvider::new(
        name,
        &config.base_url,
        api_key,
    )))
}
