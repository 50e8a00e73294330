use onio_core::config::ProviderConfig;
use std::sync::Arc;
use tracing::info;

use crate::{OfflineGenerator, OpenAiGenerator, ResponseGenerator};

/// Default api_base for OpenAI-compatible vendors, inferred from the model name.
fn default_api_base(model: &str) -> &'static str {
    if model.starts_with("deepseek") {
        "https://api.deepseek.com/v1"
    } else if model.starts_with("groq/") {
        "https://api.groq.com/openai/v1"
    } else if model.starts_with("kimi") || model.starts_with("moonshot") {
        "https://api.moonshot.cn/v1"
    } else if model.contains('/') {
        "https://openrouter.ai/api/v1"
    } else {
        "https://api.openai.com/v1"
    }
}

/// Pick a generator for the configured provider.
///
/// Without an API key the offline generator is used so the bot still answers
/// commands that don't need a model.
pub fn create_generator(config: &ProviderConfig) -> Arc<dyn ResponseGenerator> {
    if config.api_key.trim().is_empty() {
        info!("No provider API key configured, using offline generator");
        return Arc::new(OfflineGenerator::new());
    }
    let api_base = config
        .api_base
        .as_deref()
        .unwrap_or_else(|| default_api_base(&config.model));
    let model = config.model.strip_prefix("groq/").unwrap_or(&config.model);
    info!(model = %model, api_base = %api_base, "Using OpenAI-compatible generator");
    Arc::new(OpenAiGenerator::new(
        &config.api_key,
        Some(api_base),
        model,
        config.max_tokens,
        config.temperature,
        config.proxy.as_deref(),
    ))
}
