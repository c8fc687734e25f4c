//! Storage abstraction for passages, rules, and cached evidence.
//!
//! The pipeline components depend on these traits rather than on SQLite
//! directly, so tests can swap in [`MemoryStore`] and exercise the full
//! retrieval and composition paths without touching disk.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Article, Passage, RuleKind, RuleRecord, Section};

/// Filter applied at the store layer before scoring.
///
/// `tags` uses superset semantics: a passage matches only when it carries
/// every requested tag.
#[derive(Debug, Clone, Default)]
pub struct PassageFilter {
    pub case_id: Option<String>,
    pub stage: Option<u32>,
    pub section: Option<Section>,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait PassageStore: Send + Sync {
    /// Insert a passage, skipping it when an identical `content_hash`
    /// already exists. Returns `true` when a row was written.
    async fn insert_passage(&self, passage: &Passage) -> Result<bool>;

    /// All passages matching the filter, unscored and in no defined order.
    async fn find_passages(&self, filter: &PassageFilter) -> Result<Vec<Passage>>;

    /// Look up one passage by case and id.
    async fn get_passage(&self, case_id: &str, passage_id: &str) -> Result<Option<Passage>>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert or replace the rule at its (id, version) coordinate. Older
    /// versions of the same id stay in place.
    async fn upsert_rule(&self, rule: &RuleRecord) -> Result<()>;

    /// The newest version of each rule of `kind` for `case_id`.
    async fn rules_for(&self, case_id: &str, kind: RuleKind) -> Result<Vec<RuleRecord>>;
}

#[async_trait]
pub trait EvidenceCache: Send + Sync {
    /// Articles previously stored under `query_key`, best-ranked first.
    async fn cached_articles(&self, query_key: &str) -> Result<Vec<Article>>;

    /// Persist fetched articles under `query_key`. Existing entries for the
    /// same (key, id) pair are left untouched.
    async fn store_articles(&self, query_key: &str, articles: &[Article]) -> Result<()>;
}
