use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

/// A character card as stored on disk (JSON). PNG-embedded cards are out of
/// scope; export them to JSON first.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CharacterCard {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub scenario: String,
    /// Replaces the configured main prompt when present.
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub first_message: String,
    #[serde(default)]
    pub examples: Vec<Vec<ExampleTurnDef>>,
    #[serde(default)]
    pub world_info: WorldInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExampleTurnDef {
    pub role: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub content: String,
}

/// Lore entries fixed relative to the character definition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorldInfo {
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
}

impl CharacterCard {
    pub fn load(path: &str) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("reading character card at {path}"))?;
        serde_json::from_str(&text).with_context(|| format!("parsing character card at {path}"))
    }
}
