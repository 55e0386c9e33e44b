//! URL pattern matching for incoming link events.
//!
//! Patterns are read from a [`PatternSource`] on first use and cached until
//! [`PatternMatcher::invalidate`] is called. Pattern writes made through the
//! matcher invalidate the cache themselves.

use std::sync::{Arc, RwLock};

use crate::db::Database;
use crate::error::Result;
use crate::models::UrlPattern;
use crate::utils::parse_link;

/// Where the matcher loads its patterns from.
pub trait PatternSource {
    fn load_patterns(&self) -> Result<Vec<UrlPattern>>;
}

impl PatternSource for Database {
    fn load_patterns(&self) -> Result<Vec<UrlPattern>> {
        self.url_patterns()
    }
}

#[derive(Default)]
pub struct PatternMatcher {
    cache: RwLock<Option<Arc<Vec<UrlPattern>>>>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached patterns, loading them from `source` when the cache is empty.
    pub fn patterns(&self, source: &dyn PatternSource) -> Result<Arc<Vec<UrlPattern>>> {
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            return Ok(Arc::clone(cached));
        }

        let loaded = Arc::new(source.load_patterns()?);
        log::debug!("Loaded {} URL patterns", loaded.len());
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Drop the cached pattern list.
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether the link points at a domain some pattern tracks.
    pub fn is_tracked(&self, source: &dyn PatternSource, link: &str) -> Result<bool> {
        let Some(url) = parse_link(link) else {
            return Ok(false);
        };
        Ok(self.patterns(source)?.iter().any(|p| p.tracks(&url)))
    }

    /// Patterns a link event should be tagged with.
    ///
    /// Untracked links match nothing. For a tracked link every pattern whose
    /// raw or proxied form occurs in the link is returned.
    pub fn matches(&self, source: &dyn PatternSource, link: &str) -> Result<Vec<UrlPattern>> {
        if !self.is_tracked(source, link)? {
            return Ok(Vec::new());
        }
        Ok(self
            .patterns(source)?
            .iter()
            .filter(|p| p.is_substring_of(link))
            .cloned()
            .collect())
    }

    pub fn create_pattern(
        &self,
        db: &Database,
        url: &str,
        collection_id: Option<i64>,
    ) -> Result<UrlPattern> {
        let pattern = db.insert_pattern(url, collection_id)?;
        self.invalidate();
        Ok(pattern)
    }

    pub fn update_pattern(&self, db: &Database, pattern: &UrlPattern) -> Result<()> {
        db.save_pattern(pattern)?;
        self.invalidate();
        Ok(())
    }
}
