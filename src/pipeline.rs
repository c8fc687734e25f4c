//! Component wiring.
//!
//! [`Pipeline::connect`] builds the production stack on SQLite;
//! [`Pipeline::assemble`] accepts injected stores and a model so tests can
//! run the identical wiring against in-memory components.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::compose::Composer;
use crate::config::Config;
use crate::db;
use crate::evidence::EvidenceClient;
use crate::guard::SecurityGuard;
use crate::model::{create_model, CompletionModel};
use crate::retrieve::{Retriever, SessionCache};
use crate::rules::RulesEngine;
use crate::store::{EvidenceCache, PassageStore, RuleStore, SqliteStore};

pub struct Pipeline {
    guard: Arc<SecurityGuard>,
    cache: Arc<SessionCache>,
    retriever: Arc<Retriever>,
    rules: Arc<RulesEngine>,
    evidence: Arc<EvidenceClient>,
    composer: Composer,
    pool: Option<SqlitePool>,
}

impl Pipeline {
    /// Production wiring over the configured SQLite database.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let store = Arc::new(SqliteStore::new(pool.clone()));

        let mut pipeline = Self::assemble(
            store.clone(),
            store.clone(),
            store,
            create_model(&config.model)?,
            config,
        )?;
        pipeline.pool = Some(pool);
        Ok(pipeline)
    }

    /// Wire the pipeline from injected collaborators.
    pub fn assemble(
        passages: Arc<dyn PassageStore>,
        rule_store: Arc<dyn RuleStore>,
        evidence_cache: Arc<dyn EvidenceCache>,
        model: Arc<dyn CompletionModel>,
        config: &Config,
    ) -> Result<Self> {
        let guard = Arc::new(SecurityGuard::new(&config.security));
        let cache = Arc::new(SessionCache::new(Duration::from_secs(
            config.retrieval.cache_ttl_secs,
        )));
        let retriever = Arc::new(Retriever::new(passages, cache.clone(), guard.clone()));
        let rules = Arc::new(RulesEngine::new(rule_store, guard.clone()));
        let evidence = Arc::new(EvidenceClient::new(
            evidence_cache,
            guard.clone(),
            config.evidence.clone(),
        )?);
        let composer = Composer::new(
            retriever.clone(),
            evidence.clone(),
            model,
            guard.clone(),
            config.composer.clone(),
            config.security.max_input_tokens,
        );

        Ok(Self {
            guard,
            cache,
            retriever,
            rules,
            evidence,
            composer,
            pool: None,
        })
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn rules(&self) -> &RulesEngine {
        &self.rules
    }

    pub fn evidence(&self) -> &EvidenceClient {
        &self.evidence
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn guard(&self) -> &SecurityGuard {
        &self.guard
    }

    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}
