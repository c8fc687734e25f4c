//! SQLite-backed store. One pool serves all three storage roles.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::models::{Article, Passage, RuleKind, RuleRecord, Section};
use crate::store::{EvidenceCache, PassageFilter, PassageStore, RuleStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_passage(row: &sqlx::sqlite::SqliteRow) -> Result<Passage> {
    let section_str: String = row.get("section");
    let section = section_str
        .parse::<Section>()
        .map_err(|e| anyhow::anyhow!(e))?;
    let tags_json: String = row.get("tags_json");
    let tags: Vec<String> = serde_json::from_str(&tags_json)?;
    let stage: i64 = row.get("stage");

    Ok(Passage {
        id: row.get("id"),
        case_id: row.get("case_id"),
        stage: stage as u32,
        section,
        tags,
        body: row.get("body"),
        source_citation: row.get("source_citation"),
        license: row.get("license"),
        content_hash: row.get("content_hash"),
    })
}

#[async_trait]
impl PassageStore for SqliteStore {
    async fn insert_passage(&self, passage: &Passage) -> Result<bool> {
        let tags_json = serde_json::to_string(&passage.tags)?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO passages
                (id, case_id, stage, section, tags_json, body, source_citation, license, content_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&passage.id)
        .bind(&passage.case_id)
        .bind(passage.stage as i64)
        .bind(passage.section.as_str())
        .bind(&tags_json)
        .bind(&passage.body)
        .bind(&passage.source_citation)
        .bind(&passage.license)
        .bind(&passage.content_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_passages(&self, filter: &PassageFilter) -> Result<Vec<Passage>> {
        let mut sql = String::from(
            "SELECT id, case_id, stage, section, tags_json, body, source_citation, license, content_hash \
             FROM passages WHERE 1=1",
        );
        if filter.case_id.is_some() {
            sql.push_str(" AND case_id = ?");
        }
        if filter.stage.is_some() {
            sql.push_str(" AND stage = ?");
        }
        if filter.section.is_some() {
            sql.push_str(" AND section = ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(case_id) = &filter.case_id {
            query = query.bind(case_id);
        }
        if let Some(stage) = filter.stage {
            query = query.bind(stage as i64);
        }
        if let Some(section) = filter.section {
            query = query.bind(section.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;

        let mut passages = Vec::with_capacity(rows.len());
        for row in &rows {
            passages.push(row_to_passage(row)?);
        }

        // Tag filter applies in Rust; tags live in a JSON column
        if !filter.tags.is_empty() {
            passages.retain(|p| {
                filter
                    .tags
                    .iter()
                    .all(|tag| p.tags.iter().any(|t| t == tag))
            });
        }

        Ok(passages)
    }

    async fn get_passage(&self, case_id: &str, passage_id: &str) -> Result<Option<Passage>> {
        let row = sqlx::query(
            "SELECT id, case_id, stage, section, tags_json, body, source_citation, license, content_hash \
             FROM passages WHERE case_id = ? AND id = ?",
        )
        .bind(case_id)
        .bind(passage_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_passage(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn upsert_rule(&self, rule: &RuleRecord) -> Result<()> {
        let payload_json = serde_json::to_string(&rule.payload)?;

        sqlx::query(
            r#"
            INSERT INTO rules (id, case_id, version, kind, checksum, payload_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id, version) DO UPDATE SET
                case_id = excluded.case_id,
                kind = excluded.kind,
                checksum = excluded.checksum,
                payload_json = excluded.payload_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.case_id)
        .bind(rule.version as i64)
        .bind(rule.payload.kind().as_str())
        .bind(&rule.checksum)
        .bind(&payload_json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn rules_for(&self, case_id: &str, kind: RuleKind) -> Result<Vec<RuleRecord>> {
        let rows = sqlx::query(
            "SELECT id, case_id, version, checksum, payload_json \
             FROM rules WHERE case_id = ? AND kind = ? \
             ORDER BY id ASC, version DESC",
        )
        .bind(case_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let payload_json: String = row.get("payload_json");
            let payload: crate::models::RulePayload = serde_json::from_str(&payload_json)?;
            let version: i64 = row.get("version");
            records.push(RuleRecord {
                id: row.get("id"),
                case_id: row.get("case_id"),
                version: version as u32,
                checksum: row.get("checksum"),
                payload,
            });
        }

        // Rows come back newest-version-first within each id
        records.dedup_by(|a, b| a.id == b.id);
        Ok(records)
    }
}

#[async_trait]
impl EvidenceCache for SqliteStore {
    async fn cached_articles(&self, query_key: &str) -> Result<Vec<Article>> {
        let rows = sqlx::query(
            "SELECT external_id, title, abstract_text, authors_json, venue, published_year, relevance \
             FROM evidence_cache WHERE query_key = ? \
             ORDER BY relevance DESC, external_id ASC",
        )
        .bind(query_key)
        .fetch_all(&self.pool)
        .await?;

        let mut articles = Vec::with_capacity(rows.len());
        for row in &rows {
            let authors_json: String = row.get("authors_json");
            let authors: Vec<String> = serde_json::from_str(&authors_json)?;
            articles.push(Article {
                external_id: row.get("external_id"),
                title: row.get("title"),
                abstract_text: row.get("abstract_text"),
                authors,
                venue: row.get("venue"),
                published_year: row.get("published_year"),
                relevance: row.get("relevance"),
            });
        }

        Ok(articles)
    }

    async fn store_articles(&self, query_key: &str, articles: &[Article]) -> Result<()> {
        let fetched_at = chrono::Utc::now().timestamp();

        for article in articles {
            let authors_json = serde_json::to_string(&article.authors)?;
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO evidence_cache
                    (query_key, external_id, title, abstract_text, authors_json, venue, published_year, relevance, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(query_key)
            .bind(&article.external_id)
            .bind(&article.title)
            .bind(&article.abstract_text)
            .bind(&authors_json)
            .bind(&article.venue)
            .bind(article.published_year)
            .bind(article.relevance)
            .bind(fetched_at)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }
}
