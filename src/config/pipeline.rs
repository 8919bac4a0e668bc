// src/config/pipeline.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ai::AiConfig;
use crate::dedup::DedupConfig;
use crate::enrich::EnrichmentConfig;
use crate::health::BreakerPolicy;
use crate::orchestrator::OrchestratorConfig;
use crate::service::RetentionConfig;
use crate::sources::fixture::FixtureSource;
use crate::sources::SourceRegistry;

const ENV_PATH: &str = "PIPELINE_CONFIG_PATH";

/// One JSON-fixture source to register at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub id: String,
    pub fixture_path: PathBuf,
}

/// Every tunable of the service. Missing sections fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub orchestrator: OrchestratorConfig,
    pub health: BreakerPolicy,
    pub dedup: DedupConfig,
    pub enrichment: EnrichmentConfig,
    pub ai: AiConfig,
    pub retention: RetentionConfig,
    pub sources: Vec<SourceEntry>,
}

impl PipelineConfig {
    /// Clamp out-of-range values and resolve the AI key.
    pub fn sanitized(mut self) -> Result<Self> {
        self.orchestrator = self.orchestrator.sanitized();
        self.health = self.health.sanitized();
        self.dedup.store = self.dedup.store.sanitized();
        self.enrichment = self.enrichment.sanitized();
        self.retention.max_batches = self.retention.max_batches.max(1);
        self.ai = self.ai.resolved().context("resolving [ai] section")?;
        Ok(self)
    }

    /// Build the source registry from the configured fixture files.
    pub fn build_registry(&self) -> Result<SourceRegistry> {
        let mut registry = SourceRegistry::new();
        for entry in &self.sources {
            let source = FixtureSource::from_path(&entry.id, &entry.fixture_path)
                .with_context(|| format!("loading source {}", entry.id))?;
            registry.register(Arc::new(source));
        }
        Ok(registry)
    }
}

/// Load from an explicit path. Supports TOML or JSON.
pub fn load_pipeline_config_from(path: &Path) -> Result<PipelineConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading pipeline config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_config(&content, ext.as_str())?.sanitized()
}

/// Load using env var + fallbacks:
/// 1) $PIPELINE_CONFIG_PATH
/// 2) config/pipeline.toml
/// 3) config/pipeline.json
/// 4) defaults
pub fn load_pipeline_config() -> Result<PipelineConfig> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_pipeline_config_from(&pb);
        } else {
            return Err(anyhow!("PIPELINE_CONFIG_PATH points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/pipeline.toml");
    if toml_p.exists() {
        return load_pipeline_config_from(&toml_p);
    }
    let json_p = PathBuf::from("config/pipeline.json");
    if json_p.exists() {
        return load_pipeline_config_from(&json_p);
    }
    PipelineConfig::default().sanitized()
}

fn parse_config(s: &str, hint_ext: &str) -> Result<PipelineConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s).context("parsing TOML pipeline config")?),
        "json" => Ok(serde_json::from_str(s).context("parsing JSON pipeline config")?),
        _ => serde_json::from_str(s)
            .or_else(|_| toml::from_str(s))
            .map_err(|_| anyhow!("unsupported pipeline config format")),
    }
}
