use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub openai: Option<OpenAiConfig>,
    pub anthropic: Option<AnthropicConfig>,
    pub ollama: Option<OllamaConfig>,
    /// Additional OpenAI-compatible endpoints (Groq, DeepSeek, xAI,
    /// OpenRouter, ...), keyed by provider name.
    pub openai_compatible: Option<std::collections::HashMap<String, OpenAiCompatibleConfig>>,
    pub fallback: Option<FallbackConfig>,
    pub persona: Option<PersonaConfig>,
    pub prompts: Option<PromptsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FallbackConfig {
    pub providers: Option<Vec<String>>, // ordered fallback list
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatibleConfig {
    pub api_key: Option<String>,
    /// Environment variable consulted when api_key is unset.
    pub api_key_env: Option<String>,
    pub base_url: String,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersonaConfig {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Prompt-source settings consumed by the population pipeline. Passed into
/// the builder explicitly; nothing in the engine reads configuration on its
/// own.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptsConfig {
    pub system_prompt: Option<String>,
    pub impersonation_prompt: Option<String>,
    pub continue_nudge: Option<String>,
    /// Assistant prefill for prefix continuation; unset means nudge-style
    /// continuation.
    pub continue_prefill: Option<String>,
    pub new_chat_prompt: Option<String>,
    pub new_example_chat_prompt: Option<String>,
    pub group_nudge: Option<String>,
    pub injection_separator: Option<String>,
    pub squash_system_messages: Option<bool>,
    pub pin_examples: Option<bool>,
    pub image_quality: Option<String>,
    pub ordered: Option<Vec<OrderedPromptConfig>>,
    pub inject: Option<Vec<InjectionPromptConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderedPromptConfig {
    pub identifier: String,
    pub role: Option<String>,
    pub content: String,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionPromptConfig {
    pub role: Option<String>,
    pub content: String,
    pub depth: Option<usize>,
    pub order: Option<i32>,
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self> {
        if let Some(p) = path {
            let text = fs::read_to_string(p).with_context(|| format!("reading config at {p}"))?;
            return parse(&text).with_context(|| "parsing config");
        }
        let default = Self::default_path()?;
        if default.exists() {
            let text = fs::read_to_string(&default)
                .with_context(|| format!("reading config at {}", default.display()))?;
            parse(&text).with_context(|| "parsing config")
        } else {
            Ok(Self::default())
        }
    }

    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| anyhow!("cannot resolve config dir"))?;
        Ok(base.join("persona-cli").join("config.toml"))
    }

    pub fn write_example_if_absent() -> Result<PathBuf> {
        let path = Self::default_path()?;
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let example = r#"# persona-cli config (TOML)

[openai]
# api_key can be omitted to use env var OPENAI_API_KEY
api_key = ""
base_url = "https://api.openai.com/v1"
default_model = "gpt-4o-mini"

[anthropic]
# api_key can be omitted to use env var ANTHROPIC_API_KEY
api_key = ""
base_url = "https://api.anthropic.com"
version = "2023-06-01"
default_model = "claude-3-5-sonnet-latest"

[ollama]
base_url = "http://localhost:11434"
default_model = "llama3.1"

# OpenAI-compatible endpoints, one table per provider key
# [openai_compatible.groq]
# api_key_env = "GROQ_API_KEY"
# base_url = "https://api.groq.com/openai/v1"
# default_model = "llama-3.1-70b-versatile"

[persona]
name = "User"
description = ""

[prompts]
system_prompt = "Write {char}'s next reply in a conversation with {user}."
injection_separator = "\n"
squash_system_messages = true
pin_examples = false
image_quality = "auto"

# User-defined prompts added after the fixed sections, in this order
# [[prompts.ordered]]
# identifier = "style_guide"
# role = "system"
# content = "Keep replies under three paragraphs."
# enabled = true

# Depth-tagged prompts merged into chat history
# [[prompts.inject]]
# role = "system"
# content = "Stay in character."
# depth = 4
# order = 100
"#;
            fs::write(&path, example)?;
        }
        Ok(path)
    }
}

fn parse(text: &str) -> Result<Config> {
    toml::from_str(text).map_err(|e| anyhow!(e))
}

impl OpenAiConfig {
    pub fn effective_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

impl AnthropicConfig {
    pub fn effective_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
    }
    pub fn effective_version(&self) -> String {
        self.version.clone().unwrap_or_else(|| "2023-06-01".into())
    }
}

impl OllamaConfig {
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".into())
    }
}

impl OpenAiCompatibleConfig {
    pub fn effective_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            })
    }
}
