// src/sources/mod.rs
pub mod fixture;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BatchError, SourceError};
use crate::model::{RawItem, SourceId};

/// Capability exposed by every content source (site-specific scraping lives
/// behind this trait).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &SourceId;

    /// Search for up to `max_items` items matching any of `keywords`.
    /// Item order follows the source's own pagination.
    async fn search(&self, keywords: &[String], max_items: usize)
        -> Result<Vec<RawItem>, SourceError>;

    /// Cheap liveness check used before a half-open trial.
    async fn health_probe(&self) -> bool {
        true
    }
}

pub type DynSourceAdapter = Arc<dyn SourceAdapter>;

/// Static set of adapters resolved once at startup.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: BTreeMap<SourceId, DynSourceAdapter>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration. A later adapter with the same id replaces the earlier one.
    pub fn with(mut self, adapter: DynSourceAdapter) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: DynSourceAdapter) {
        let id = adapter.id().clone();
        if self.adapters.insert(id.clone(), adapter).is_some() {
            tracing::warn!(source = %id, "source adapter replaced");
        } else {
            tracing::info!(source = %id, "source adapter registered");
        }
    }

    pub fn get(&self, id: &SourceId) -> Option<DynSourceAdapter> {
        self.adapters.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<SourceId> {
        self.adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Resolve requested ids; an empty request means every registered source.
    pub fn resolve(&self, requested: &[SourceId]) -> Result<Vec<SourceId>, BatchError> {
        if requested.is_empty() {
            if self.adapters.is_empty() {
                return Err(BatchError::NoSources);
            }
            return Ok(self.ids());
        }
        let mut out: Vec<SourceId> = Vec::with_capacity(requested.len());
        for id in requested {
            if !self.adapters.contains_key(id) {
                return Err(BatchError::UnknownSource(id.clone()));
            }
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::fixture::FixtureSource;

    fn registry() -> SourceRegistry {
        SourceRegistry::new()
            .with(Arc::new(FixtureSource::from_items("weibo", vec![])))
            .with(Arc::new(FixtureSource::from_items("zhihu", vec![])))
    }

    #[test]
    fn resolve_rejects_unknown_ids() {
        let r = registry();
        let err = r.resolve(&[SourceId::new("weibo"), SourceId::new("myspace")]);
        assert_eq!(err, Err(BatchError::UnknownSource(SourceId::new("myspace"))));
    }

    #[test]
    fn empty_request_means_all_sources() {
        let r = registry();
        assert_eq!(r.resolve(&[]).unwrap().len(), 2);
        assert_eq!(SourceRegistry::new().resolve(&[]), Err(BatchError::NoSources));
    }

    #[test]
    fn duplicate_ids_collapse() {
        let r = registry();
        let ids = r
            .resolve(&[SourceId::new("zhihu"), SourceId::new("ZHIHU")])
            .unwrap();
        assert_eq!(ids, vec![SourceId::new("zhihu")]);
    }
}
