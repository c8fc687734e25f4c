//! In-memory store used by unit and pipeline tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::{Article, Passage, RuleKind, RuleRecord};
use crate::store::{EvidenceCache, PassageFilter, PassageStore, RuleStore};

#[derive(Default)]
pub struct MemoryStore {
    passages: RwLock<Vec<Passage>>,
    rules: RwLock<Vec<RuleRecord>>,
    articles: RwLock<HashMap<String, Vec<Article>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches(passage: &Passage, filter: &PassageFilter) -> bool {
    if let Some(case_id) = &filter.case_id {
        if &passage.case_id != case_id {
            return false;
        }
    }
    if let Some(stage) = filter.stage {
        if passage.stage != stage {
            return false;
        }
    }
    if let Some(section) = filter.section {
        if passage.section != section {
            return false;
        }
    }
    filter
        .tags
        .iter()
        .all(|tag| passage.tags.iter().any(|t| t == tag))
}

#[async_trait]
impl PassageStore for MemoryStore {
    async fn insert_passage(&self, passage: &Passage) -> Result<bool> {
        let mut passages = self
            .passages
            .write()
            .map_err(|_| anyhow::anyhow!("passage store lock poisoned"))?;
        if passages
            .iter()
            .any(|p| p.content_hash == passage.content_hash)
        {
            return Ok(false);
        }
        passages.push(passage.clone());
        Ok(true)
    }

    async fn find_passages(&self, filter: &PassageFilter) -> Result<Vec<Passage>> {
        let passages = self
            .passages
            .read()
            .map_err(|_| anyhow::anyhow!("passage store lock poisoned"))?;
        Ok(passages
            .iter()
            .filter(|p| matches(p, filter))
            .cloned()
            .collect())
    }

    async fn get_passage(&self, case_id: &str, passage_id: &str) -> Result<Option<Passage>> {
        let passages = self
            .passages
            .read()
            .map_err(|_| anyhow::anyhow!("passage store lock poisoned"))?;
        Ok(passages
            .iter()
            .find(|p| p.case_id == case_id && p.id == passage_id)
            .cloned())
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn upsert_rule(&self, rule: &RuleRecord) -> Result<()> {
        let mut rules = self
            .rules
            .write()
            .map_err(|_| anyhow::anyhow!("rule store lock poisoned"))?;
        rules.retain(|r| !(r.id == rule.id && r.version == rule.version));
        rules.push(rule.clone());
        Ok(())
    }

    async fn rules_for(&self, case_id: &str, kind: RuleKind) -> Result<Vec<RuleRecord>> {
        let rules = self
            .rules
            .read()
            .map_err(|_| anyhow::anyhow!("rule store lock poisoned"))?;
        let mut matching: Vec<RuleRecord> = rules
            .iter()
            .filter(|r| r.case_id == case_id && r.payload.kind() == kind)
            .cloned()
            .collect();
        // Newest version of each id wins
        matching.sort_by(|a, b| a.id.cmp(&b.id).then(b.version.cmp(&a.version)));
        matching.dedup_by(|a, b| a.id == b.id);
        Ok(matching)
    }
}

#[async_trait]
impl EvidenceCache for MemoryStore {
    async fn cached_articles(&self, query_key: &str) -> Result<Vec<Article>> {
        let articles = self
            .articles
            .read()
            .map_err(|_| anyhow::anyhow!("evidence cache lock poisoned"))?;
        Ok(articles.get(query_key).cloned().unwrap_or_default())
    }

    async fn store_articles(&self, query_key: &str, new_articles: &[Article]) -> Result<()> {
        let mut articles = self
            .articles
            .write()
            .map_err(|_| anyhow::anyhow!("evidence cache lock poisoned"))?;
        let entry = articles.entry(query_key.to_string()).or_default();
        for article in new_articles {
            if !entry.iter().any(|a| a.external_id == article.external_id) {
                entry.push(article.clone());
            }
        }
        entry.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.external_id.cmp(&b.external_id))
        });
        Ok(())
    }
}
