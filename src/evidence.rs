//! External bibliographic evidence client.
//!
//! Queries a PubMed-style eutils endpoint in two round trips: an identifier
//! search (`esearch.fcgi`), then a detail fetch (`efetch.fcgi`) for those
//! identifiers. Parsed articles are ranked by a fixed relevance heuristic
//! and persisted in the durable evidence cache keyed by the normalized
//! query string, so a repeated query costs zero network calls.
//!
//! Evidence is additive context, never load-bearing: any network or parse
//! failure degrades to an empty list with a warning, and the composition
//! pipeline carries on without it. Only guard rejections (rate limit,
//! open circuit) surface to the caller.

use anyhow::Result;
use chrono::Datelike;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{Config, EvidenceConfig};
use crate::db;
use crate::error::PipelineError;
use crate::guard::{Endpoint, SecurityGuard};
use crate::models::Article;
use crate::store::{EvidenceCache, SqliteStore};

#[derive(Debug, Clone)]
pub struct EvidenceQuery {
    pub intervention: String,
    pub case_type: String,
    pub age_group: Option<String>,
    pub limit: usize,
}

/// Normalized cache key: lowercased terms from the query inputs plus the
/// fixed pediatric/emergency qualifiers, deduplicated in first-seen order.
pub fn query_key(query: &EvidenceQuery) -> String {
    let parts = [
        Some(query.intervention.as_str()),
        Some(query.case_type.as_str()),
        query.age_group.as_deref(),
        Some("pediatric"),
        Some("emergency"),
    ];

    let mut seen = HashSet::new();
    let mut terms = Vec::new();
    for part in parts.into_iter().flatten() {
        for term in part.to_lowercase().split_whitespace() {
            if seen.insert(term.to_string()) {
                terms.push(term.to_string());
            }
        }
    }
    terms.join(" ")
}

/// Relevance heuristic over a fetched article. Capped at 1.0.
pub fn relevance(article: &Article, query: &EvidenceQuery) -> f64 {
    let title = article.title.to_lowercase();
    let abstract_text = article.abstract_text.to_lowercase();
    let intervention = query.intervention.to_lowercase();
    let case_type = query.case_type.to_lowercase();

    let mut score: f64 = 0.0;
    if !intervention.is_empty() && title.contains(&intervention) {
        score += 0.4;
    }
    if !intervention.is_empty() && abstract_text.contains(&intervention) {
        score += 0.3;
    }
    if !case_type.is_empty() && (title.contains(&case_type) || abstract_text.contains(&case_type)) {
        score += 0.2;
    }
    if let Some(age_group) = &query.age_group {
        let age_group = age_group.to_lowercase();
        if !age_group.is_empty()
            && (title.contains(&age_group) || abstract_text.contains(&age_group))
        {
            score += 0.1;
        }
    }
    if let Some(year) = article.published_year {
        if chrono::Utc::now().year() - year <= 5 {
            score += 0.05;
        }
    }

    score.min(1.0)
}

pub struct EvidenceClient {
    cache: Arc<dyn EvidenceCache>,
    guard: Arc<SecurityGuard>,
    config: EvidenceConfig,
    client: reqwest::Client,
}

impl EvidenceClient {
    pub fn new(
        cache: Arc<dyn EvidenceCache>,
        guard: Arc<SecurityGuard>,
        config: EvidenceConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(guard.budget(Endpoint::Evidence))
            .build()?;
        Ok(Self {
            cache,
            guard,
            config,
            client,
        })
    }

    pub fn default_limit(&self) -> usize {
        self.config.default_limit
    }

    /// Top `limit` ranked articles for the query, cache-first.
    pub async fn search(
        &self,
        requester_id: &str,
        query: &EvidenceQuery,
    ) -> Result<Vec<Article>, PipelineError> {
        self.guard.allow(requester_id, Endpoint::Evidence)?;

        let key = query_key(query);
        let cached = match self.cache.cached_articles(&key).await {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(error = %err, "evidence cache read failed");
                Vec::new()
            }
        };
        if !cached.is_empty() {
            tracing::debug!(key = %key, hits = cached.len(), "evidence served from cache");
            return Ok(cached.into_iter().take(query.limit).collect());
        }

        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let fetched = self
            .guard
            .with_timeout(Endpoint::Evidence, self.fetch_and_rank(query))
            .await;

        match fetched {
            Ok(articles) => {
                self.guard.record_success(requester_id, Endpoint::Evidence);
                if let Err(err) = self.cache.store_articles(&key, &articles).await {
                    tracing::warn!(error = %err, "failed to persist evidence articles");
                }
                Ok(articles.into_iter().take(query.limit).collect())
            }
            Err(err) => {
                self.guard.record_failure(requester_id, Endpoint::Evidence);
                tracing::warn!(error = %err, "evidence search failed; continuing without it");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_and_rank(&self, query: &EvidenceQuery) -> Result<Vec<Article>, PipelineError> {
        let term = query_key(query);
        let retmax = self.config.max_ids.to_string();

        let response = self
            .client
            .get(format!("{}/esearch.fcgi", self.config.base_url))
            .query(&[
                ("db", "pubmed"),
                ("term", term.as_str()),
                ("retmax", retmax.as_str()),
                ("retmode", "xml"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::external(format!(
                "identifier search returned {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        let ids = parse_id_list(&body)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let id_list = ids.join(",");
        let response = self
            .client
            .get(format!("{}/efetch.fcgi", self.config.base_url))
            .query(&[
                ("db", "pubmed"),
                ("id", id_list.as_str()),
                ("retmode", "xml"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::external(format!(
                "detail fetch returned {}",
                response.status()
            )));
        }
        let body = response.text().await?;

        let mut articles = parse_article_set(&body)?;
        for article in &mut articles {
            article.relevance = relevance(article, query);
        }
        articles.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.external_id.cmp(&b.external_id))
        });

        Ok(articles)
    }
}

fn parse_id_list(xml: &str) -> Result<Vec<String>, PipelineError> {
    let mut ids = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_id = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"Id" {
                    in_id = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_id => {
                let id = te.unescape().unwrap_or_default().trim().to_string();
                if !id.is_empty() {
                    ids.push(id);
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"Id" {
                    in_id = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(PipelineError::external(format!(
                    "identifier list parse: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(ids)
}

#[derive(Default)]
struct ArticleDraft {
    external_id: String,
    title: String,
    abstract_text: String,
    authors: Vec<String>,
    venue: String,
    year: Option<i32>,
    last_name: String,
    fore_name: String,
}

/// Parse an efetch article set. Records missing an identifier or a title
/// are dropped rather than failing the whole document.
fn parse_article_set(xml: &str) -> Result<Vec<Article>, PipelineError> {
    let mut articles = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut current: Option<ArticleDraft> = None;
    let mut in_medline = false;
    let mut in_pmid = false;
    let mut in_title = false;
    let mut in_abstract = false;
    let mut in_journal = false;
    let mut in_journal_title = false;
    let mut in_pub_date = false;
    let mut in_year = false;
    let mut in_author = false;
    let mut in_last = false;
    let mut in_fore = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"PubmedArticle" => current = Some(ArticleDraft::default()),
                b"MedlineCitation" => in_medline = true,
                b"PMID" if in_medline => in_pmid = true,
                b"ArticleTitle" => in_title = true,
                b"AbstractText" => in_abstract = true,
                b"Journal" => in_journal = true,
                b"Title" if in_journal => in_journal_title = true,
                b"PubDate" => in_pub_date = true,
                b"Year" if in_pub_date => in_year = true,
                b"Author" => {
                    in_author = true;
                    if let Some(draft) = current.as_mut() {
                        draft.last_name.clear();
                        draft.fore_name.clear();
                    }
                }
                b"LastName" if in_author => in_last = true,
                b"ForeName" if in_author => in_fore = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) => {
                if let Some(draft) = current.as_mut() {
                    let text = te.unescape().unwrap_or_default();
                    if in_pmid && draft.external_id.is_empty() {
                        draft.external_id = text.trim().to_string();
                    } else if in_title {
                        draft.title.push(' ');
                        draft.title.push_str(&text);
                    } else if in_abstract {
                        draft.abstract_text.push(' ');
                        draft.abstract_text.push_str(&text);
                    } else if in_journal_title && draft.venue.is_empty() {
                        draft.venue = text.trim().to_string();
                    } else if in_year && draft.year.is_none() {
                        draft.year = text.trim().parse::<i32>().ok();
                    } else if in_last {
                        draft.last_name = text.trim().to_string();
                    } else if in_fore {
                        draft.fore_name = text.trim().to_string();
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"MedlineCitation" => in_medline = false,
                b"PMID" => in_pmid = false,
                b"ArticleTitle" => in_title = false,
                b"AbstractText" => in_abstract = false,
                b"Journal" => in_journal = false,
                b"Title" => in_journal_title = false,
                b"PubDate" => in_pub_date = false,
                b"Year" => in_year = false,
                b"LastName" => in_last = false,
                b"ForeName" => in_fore = false,
                b"Author" => {
                    in_author = false;
                    if let Some(draft) = current.as_mut() {
                        let name = format!("{} {}", draft.fore_name, draft.last_name)
                            .trim()
                            .to_string();
                        if !name.is_empty() {
                            draft.authors.push(name);
                        }
                    }
                }
                b"PubmedArticle" => {
                    if let Some(draft) = current.take() {
                        let title = collapse(&draft.title);
                        if !draft.external_id.is_empty() && !title.is_empty() {
                            articles.push(Article {
                                external_id: draft.external_id,
                                title,
                                abstract_text: collapse(&draft.abstract_text),
                                authors: draft.authors,
                                venue: draft.venue,
                                published_year: draft.year,
                                relevance: 0.0,
                            });
                        }
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(PipelineError::external(format!(
                    "article set parse: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(articles)
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============ CLI ============

pub async fn run_evidence(
    config: &Config,
    intervention: &str,
    case_type: &str,
    age_group: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let guard = Arc::new(SecurityGuard::new(&config.security));
    let client = EvidenceClient::new(
        Arc::new(SqliteStore::new(pool.clone())),
        guard,
        config.evidence.clone(),
    )?;

    let query = EvidenceQuery {
        intervention: intervention.to_string(),
        case_type: case_type.to_string(),
        age_group,
        limit: limit.unwrap_or(config.evidence.default_limit),
    };

    let articles = client.search("cli", &query).await?;

    if articles.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, article) in articles.iter().enumerate() {
        println!("{}. [{:.2}] {}", i + 1, article.relevance, article.title);
        match article.published_year {
            Some(year) => println!("    venue: {} ({})", article.venue, year),
            None => println!("    venue: {}", article.venue),
        }
        if !article.authors.is_empty() {
            println!("    authors: {}", article.authors.join(", "));
        }
        println!("    id: {}", article.external_id);
        println!();
    }

    pool.close().await;
    Ok(())
}
