// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".into()
}
fn default_api_key() -> String {
    "ENV".into()
}
fn default_connect_timeout_ms() -> u64 {
    4_000
}
fn default_max_input_chars() -> usize {
    2_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Only "openai" is wired up; anything else leaves the analyzer disabled.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// "ENV" means: read from OPENAI_API_KEY.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Item text is cut to this many chars before it goes into the prompt.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            model: default_model(),
            endpoint: default_endpoint(),
            api_key: default_api_key(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

impl AiConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let cfg: AiConfig = serde_json::from_str(&data)?;
        cfg.resolved()
    }

    /// Normalize the provider name and resolve an "ENV" key. A missing key is
    /// only an error when the analyzer is enabled.
    pub fn resolved(mut self) -> anyhow::Result<Self> {
        self.provider = self.provider.trim().to_lowercase();
        self.max_input_chars = self.max_input_chars.max(1);

        if self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key = match (self.provider.as_str(), self.enabled) {
                ("openai", true) => env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow::anyhow!("Missing OPENAI_API_KEY env var"))?,
                ("openai", false) => env::var("OPENAI_API_KEY").unwrap_or_default(),
                (other, true) => anyhow::bail!("Unsupported provider in config: {other}"),
                (_, false) => String::new(),
            };
        }
        Ok(self)
    }
}
