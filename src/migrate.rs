use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Create passages table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS passages (
            id TEXT PRIMARY KEY,
            case_id TEXT NOT NULL,
            stage INTEGER NOT NULL,
            section TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            body TEXT NOT NULL,
            source_citation TEXT NOT NULL DEFAULT '',
            license TEXT NOT NULL DEFAULT '',
            content_hash TEXT NOT NULL,
            UNIQUE(content_hash)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create rules table; old versions are retained, (id, version) is the key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rules (
            id TEXT NOT NULL,
            case_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            kind TEXT NOT NULL,
            checksum TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (id, version)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create evidence cache table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS evidence_cache (
            query_key TEXT NOT NULL,
            external_id TEXT NOT NULL,
            title TEXT NOT NULL,
            abstract_text TEXT NOT NULL DEFAULT '',
            authors_json TEXT NOT NULL DEFAULT '[]',
            venue TEXT NOT NULL DEFAULT '',
            published_year INTEGER,
            relevance REAL NOT NULL DEFAULT 0.0,
            fetched_at INTEGER NOT NULL,
            PRIMARY KEY (query_key, external_id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_passages_case ON passages(case_id)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_passages_section ON passages(section)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rules_case_kind ON rules(case_id, kind)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
