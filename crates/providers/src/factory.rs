use std::time::Duration;
use switchboard_core::config::ProviderConfig;
use switchboard_core::{Config, Error, Result};

use crate::{OpenAIProvider, Provider};

fn default_api_base(provider_name: &str) -> &'static str {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "ollama" => "http://localhost:11434/v1",
        _ => "https://api.openai.com/v1",
    }
}

/// Infer the provider from the model prefix. `None` means fall back to the
/// first configured provider.
pub fn infer_provider_from_model(model: &str) -> Option<&'static str> {
    if model.starts_with("openrouter/") {
        Some("openrouter")
    } else if model.starts_with("ollama/") {
        Some("ollama")
    } else if model.starts_with("openai/")
        || model.starts_with("gpt-")
        || model.starts_with("o1")
        || model.starts_with("o3")
    {
        Some("openai")
    } else if model.starts_with("deepseek") {
        Some("deepseek")
    } else if model.starts_with("groq/") {
        Some("groq")
    } else {
        None
    }
}

/// Model name as the endpoint expects it. OpenRouter keeps vendor prefixes,
/// everyone else gets the bare model id.
fn wire_model<'a>(provider: &str, model: &'a str) -> &'a str {
    if provider == "openrouter" {
        return model.strip_prefix("openrouter/").unwrap_or(model);
    }
    match model.split_once('/') {
        Some((prefix, rest)) if prefix == provider => rest,
        _ => model,
    }
}

fn fallback_provider_name(config: &Config) -> Option<&str> {
    let priority = ["openai", "openrouter", "deepseek", "groq", "ollama"];
    for name in priority {
        if let Some(p) = config.providers.get(name) {
            if !p.api_key.is_empty() && name != "ollama" {
                return Some(name);
            }
        }
    }
    if config.providers.contains_key("ollama") {
        return Some("ollama");
    }
    None
}

/// Build the chat provider described by `agents.defaults`.
///
/// Resolution order: explicit `provider`, then model prefix, then the first
/// provider in config with an API key.
pub fn create_provider(config: &Config) -> Result<Box<dyn Provider>> {
    let defaults = &config.agents.defaults;
    let model = defaults.model.as_str();
    let explicit_provider = defaults.provider.as_deref();

    let effective_provider: &str = if let Some(ep) = explicit_provider {
        ep
    } else if let Some(inferred) = infer_provider_from_model(model) {
        inferred
    } else if let Some(fallback) = fallback_provider_name(config) {
        fallback
    } else {
        return Err(Error::Config(
            "No LLM provider configured. Set agents.defaults.provider, use a recognized model \
             prefix (e.g. 'openai/gpt-4o'), or add an API key to the providers section."
                .to_string(),
        ));
    };

    let provider_cfg = config.providers.get(effective_provider);
    if explicit_provider.is_some() && effective_provider != "ollama" {
        match provider_cfg {
            None => {
                return Err(Error::Config(format!(
                    "Provider '{}' is explicitly configured but not found in providers section",
                    effective_provider
                )));
            }
            Some(cfg) if cfg.api_key.is_empty() => {
                return Err(Error::Config(format!(
                    "Provider '{}' is explicitly configured but has no API key",
                    effective_provider
                )));
            }
            _ => {}
        }
    }

    let empty_cfg = ProviderConfig::default();
    let resolved_cfg = provider_cfg.unwrap_or(&empty_cfg);
    let api_base = resolved_cfg
        .api_base
        .as_deref()
        .unwrap_or_else(|| default_api_base(effective_provider));

    Ok(Box::new(OpenAIProvider::new(
        &resolved_cfg.api_key,
        Some(api_base),
        wire_model(effective_provider, model),
        defaults.max_tokens,
        defaults.temperature,
        Duration::from_secs(defaults.llm_timeout_secs),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_provider_from_model() {
        assert_eq!(infer_provider_from_model("openai/gpt-4o"), Some("openai"));
        assert_eq!(infer_provider_from_model("gpt-4o-mini"), Some("openai"));
        assert_eq!(infer_provider_from_model("ollama/llama3"), Some("ollama"));
        assert_eq!(infer_provider_from_model("deepseek-chat"), Some("deepseek"));
        assert_eq!(infer_provider_from_model("some-unknown-model"), None);
    }

    #[test]
    fn test_wire_model_strips_own_prefix() {
        assert_eq!(wire_model("openai", "openai/gpt-4o"), "gpt-4o");
        assert_eq!(wire_model("ollama", "ollama/llama3"), "llama3");
        assert_eq!(wire_model("openrouter", "anthropic/claude-3"), "anthropic/claude-3");
        assert_eq!(wire_model("openai", "gpt-4o"), "gpt-4o");
    }

    #[test]
    fn test_create_provider_explicit_wins() {
        let mut config = Config::default();
        config.providers.get_mut("openrouter").unwrap().api_key = "sk-or".to_string();
        config.agents.defaults.provider = Some("openrouter".into());
        config.agents.defaults.model = "gpt-4o".into();
        assert!(create_provider(&config).is_ok());
    }

    #[test]
    fn test_create_provider_ollama_no_key_needed() {
        let mut config = Config::default();
        config.agents.defaults.provider = Some("ollama".into());
        config.agents.defaults.model = "llama3".into();
        assert!(create_provider(&config).is_ok());
    }

    #[test]
    fn test_create_provider_no_config_fails() {
        let mut config = Config::default();
        for p in config.providers.values_mut() {
            p.api_key = String::new();
        }
        config.providers.remove("ollama");
        config.agents.defaults.model = "some-unknown-model".into();
        assert!(matches!(create_provider(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_create_provider_explicit_missing_key_fails() {
        let mut config = Config::default();
        config.agents.defaults.provider = Some("openai".into());
        assert!(matches!(create_provider(&config), Err(Error::Config(_))));
    }
}
