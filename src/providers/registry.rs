use std::collections::HashMap;

use crate::config::Config;

use super::{
    LlmProvider, ProviderError, anthropic::AnthropicProvider, ollama::OllamaProvider,
    openai::OpenAiProvider,
};

/// Providers selected by tag. The prompt engine never sees which one is
/// active; it only emits the generic wire-format chat array.
pub struct ProviderRegistry {
    providers: HashMap<String, Box<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn from_config(cfg: &Config) -> Result<Self, ProviderError> {
        let mut map: HashMap<String, Box<dyn LlmProvider>> = HashMap::new();

        if let Some(oc) = &cfg.openai {
            if let Some(key) = oc.effective_api_key() {
                let base = oc
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".into());
                let model = oc
                    .default_model
                    .clone()
                    .unwrap_or_else(|| "gpt-4o-mini".into());
                map.insert("openai".into(), Box::new(OpenAiProvider::new(base, key, model)));
            }
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            let p = OpenAiProvider::new(
                "https://api.openai.com/v1".into(),
                key,
                "gpt-4o-mini".into(),
            );
            map.insert("openai".into(), Box::new(p));
        }

        if let Some(ac) = &cfg.anthropic {
            if let Some(key) = ac.effective_api_key() {
                let base = ac
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.anthropic.com".into());
                let model = ac
                    .default_model
                    .clone()
                    .unwrap_or_else(|| "claude-3-5-sonnet-latest".into());
                let p = AnthropicProvider::new(base, key, ac.effective_version(), model);
                map.insert("anthropic".into(), Box::new(p));
            }
        } else if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            let p = AnthropicProvider::new(
                "https://api.anthropic.com".into(),
                key,
                "2023-06-01".into(),
                "claude-3-5-sonnet-latest".into(),
            );
            map.insert("anthropic".into(), Box::new(p));
        }

        if let Some(oc) = &cfg.ollama {
            let model = oc
                .default_model
                .clone()
                .unwrap_or_else(|| "llama3.1".into());
            let p = OllamaProvider::new(oc.effective_base_url(), model);
            map.insert("ollama".into(), Box::new(p));
        } else {
            // Sensible default for local dev
            let p = OllamaProvider::new("http://localhost:11434".into(), "llama3.1".into());
            map.insert("ollama".into(), Box::new(p));
        }

        // OpenAI-compatible endpoints configured by name
        if let Some(compat) = &cfg.openai_compatible {
            for (name, cc) in compat {
                let Some(key) = cc.effective_api_key() else {
                    continue;
                };
                let model = cc
                    .default_model
                    .clone()
                    .unwrap_or_else(|| "default".into());
                let p = OpenAiProvider::compatible(
                    name.clone(),
                    cc.base_url.clone(),
                    key,
                    model,
                );
                map.insert(name.clone(), Box::new(p));
            }
        }

        Ok(Self { providers: map })
    }

    pub fn get(&self, key: &str) -> Result<&dyn LlmProvider, ProviderError> {
        self.providers
            .get(key)
            .map(|b| b.as_ref())
            .ok_or_else(|| ProviderError::Config(format!("unknown provider: {key}")))
    }

    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.providers.keys().cloned().collect();
        keys.sort();
        keys
    }
}
