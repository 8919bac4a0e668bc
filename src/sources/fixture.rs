use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Deserialize;

use crate::error::SourceError;
use crate::model::{RawItem, SourceId};
use crate::sources::SourceAdapter;

#[derive(Debug, Clone, Deserialize)]
struct FixtureItem {
    id: String,
    text: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    media_urls: Vec<String>,
    #[serde(default)]
    engagement: HashMap<String, i64>,
    #[serde(default)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Source backed by a JSON array of posts. Used for local runs and demos in
/// place of a real scraper; search is a case-insensitive keyword match.
pub struct FixtureSource {
    id: SourceId,
    items: Vec<RawItem>,
}

impl FixtureSource {
    pub fn from_items(id: impl Into<SourceId>, items: Vec<RawItem>) -> Self {
        Self {
            id: id.into(),
            items,
        }
    }

    pub fn from_fixture_str(id: &str, json: &str) -> Result<Self> {
        let t0 = std::time::Instant::now();
        let source_id = SourceId::new(id);
        let parsed: Vec<FixtureItem> =
            serde_json::from_str(json).with_context(|| format!("parsing fixture for {id}"))?;
        let items = parsed
            .into_iter()
            .map(|it| RawItem {
                source_id: source_id.clone(),
                external_id: it.id,
                text: it.text,
                author: it.author,
                published_at: it.published_at,
                media_urls: it.media_urls,
                engagement: it.engagement,
                source_specific: it.extra,
            })
            .collect::<Vec<_>>();

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("source_fixture_parse_ms").record(ms);
        Ok(Self {
            id: source_id,
            items,
        })
    }

    pub fn from_path(id: &str, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture from {}", path.display()))?;
        Self::from_fixture_str(id, &content)
    }
}

fn matches_any(text: &str, keywords: &[String]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|k| lower.contains(&k.to_lowercase()))
}

#[async_trait]
impl SourceAdapter for FixtureSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    async fn search(
        &self,
        keywords: &[String],
        max_items: usize,
    ) -> Result<Vec<RawItem>, SourceError> {
        let out: Vec<RawItem> = self
            .items
            .iter()
            .filter(|it| keywords.is_empty() || matches_any(&it.text, keywords))
            .take(max_items)
            .cloned()
            .collect();
        counter!("source_items_total", "source" => self.id.to_string()).increment(out.len() as u64);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"[
        {"id": "1", "text": "Project X announces TGE next week", "author": "alice",
         "engagement": {"likes": 12}},
        {"id": "2", "text": "Lunch photos", "author": "bob"},
        {"id": "3", "text": "web3 airdrop and tge details", "author": "carol",
         "extra": {"ip_location": "Shanghai"}}
    ]"#;

    #[tokio::test]
    async fn search_filters_by_keyword_and_caps() {
        let src = FixtureSource::from_fixture_str("weibo", FIXTURE).unwrap();
        let all = src.search(&["tge".to_string()], 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].external_id, "1");
        assert_eq!(all[1].source_specific["ip_location"], "Shanghai");

        let capped = src.search(&["TGE".to_string()], 1).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].source_id, SourceId::new("weibo"));
    }

    #[test]
    fn malformed_fixture_is_an_error() {
        assert!(FixtureSource::from_fixture_str("weibo", "{not json").is_err());
    }
}
