//! Case bundle ingestion.
//!
//! Bundles are authored JSON files holding curated passages and versioned
//! rule records for one or more cases. Passages dedup on a content hash,
//! rules upsert on (id, version), so re-seeding a bundle is idempotent.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::models::{CaseBundle, Passage, RuleRecord, SeedPassage, SeedRule};
use crate::store::{PassageStore, RuleStore, SqliteStore};

#[derive(Debug, Default)]
pub struct SeedSummary {
    pub passages_inserted: usize,
    pub passages_skipped: usize,
    pub rules_upserted: usize,
}

/// Dedup hash over the identity-bearing passage fields. Tags, citation,
/// and license are presentation metadata and do not affect identity.
pub fn content_hash(passage: &SeedPassage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(passage.case_id.as_bytes());
    hasher.update(passage.stage.to_le_bytes());
    hasher.update(passage.section.as_str().as_bytes());
    hasher.update(passage.body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Checksum of the canonical payload encoding, stored alongside the rule
/// for audit.
pub fn rule_checksum(rule: &SeedRule) -> Result<String> {
    let payload = serde_json::to_vec(&rule.payload)?;
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    Ok(format!("{:x}", hasher.finalize()))
}

pub async fn seed_bundle(
    store: &(impl PassageStore + RuleStore),
    bundle: &CaseBundle,
) -> Result<SeedSummary> {
    let mut summary = SeedSummary::default();

    for seed in &bundle.passages {
        let passage = Passage {
            id: seed
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            case_id: seed.case_id.clone(),
            stage: seed.stage,
            section: seed.section,
            tags: seed.tags.clone(),
            body: seed.body.clone(),
            source_citation: seed.source_citation.clone(),
            license: seed.license.clone(),
            content_hash: content_hash(seed),
        };
        if store.insert_passage(&passage).await? {
            summary.passages_inserted += 1;
        } else {
            summary.passages_skipped += 1;
        }
    }

    for rule in &bundle.rules {
        let record = RuleRecord {
            id: rule.id.clone(),
            case_id: rule.case_id.clone(),
            version: rule.version,
            checksum: rule_checksum(rule)?,
            payload: rule.payload.clone(),
        };
        store.upsert_rule(&record).await?;
        summary.rules_upserted += 1;
    }

    Ok(summary)
}

pub async fn run_seed(config: &Config, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("read case bundle {}", file.display()))?;
    let bundle: CaseBundle = serde_json::from_str(&raw)
        .with_context(|| format!("parse case bundle {}", file.display()))?;

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let summary = seed_bundle(&store, &bundle).await?;

    println!(
        "passages: {} inserted, {} skipped",
        summary.passages_inserted, summary.passages_skipped
    );
    println!("rules:    {} upserted", summary.rules_upserted);
    println!("ok");

    pool.close().await;
    Ok(())
}
