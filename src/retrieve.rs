//! Passage retrieval: store filtering, scoring, and the session cache.
//!
//! Scoring is a two-part heuristic. `text_score` sums raw case-insensitive
//! occurrence counts of each query term in the passage body; `tag_score` is
//! the highest priority among the passage's tags from a fixed table. The
//! combined score weights text 0.7 and tags 0.3, so tag priority breaks
//! near-ties between textually similar passages without overwhelming the
//! query terms.
//!
//! Results are cached per (requester, session, query text) with a TTL, so a
//! learner re-asking the same question inside one scenario run costs no
//! store round trip.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::db;
use crate::error::PipelineError;
use crate::guard::{Endpoint, SecurityGuard};
use crate::models::{CacheStats, Passage, PassageQuery, RetrievalResult, ScoredPassage, Section};
use crate::store::{PassageFilter, PassageStore, SqliteStore};

/// Priority of a tag in the fixed ranking table. Unknown tags rank 1.
pub fn tag_priority(tag: &str) -> f64 {
    match tag {
        "critical_actions" => 10.0,
        "contraindication" => 9.0,
        "pitfall" => 8.0,
        "ICS1" => 7.0,
        "ICS2" => 6.0,
        "red-flag" => 5.0,
        "airway" => 4.0,
        "seizure" => 3.0,
        "emergency" => 2.0,
        _ => 1.0,
    }
}

/// Score and rank candidates for a query, keeping the top `limit`.
pub fn score_passages(
    query_text: &str,
    candidates: Vec<Passage>,
    limit: usize,
) -> Vec<ScoredPassage> {
    let terms: Vec<String> = query_text
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect();

    let mut scored: Vec<ScoredPassage> = candidates
        .into_iter()
        .map(|passage| {
            let body_lower = passage.body.to_lowercase();
            let text_score: f64 = terms
                .iter()
                .map(|term| body_lower.matches(term.as_str()).count() as f64)
                .sum();
            let tag_score = passage
                .tags
                .iter()
                .map(|tag| tag_priority(tag))
                .fold(1.0, f64::max);
            let combined_score = 0.7 * text_score + 0.3 * tag_score;

            ScoredPassage {
                passage,
                text_score,
                tag_score,
                combined_score,
            }
        })
        .collect();

    // Sort: combined desc, id asc (deterministic)
    scored.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.passage.id.cmp(&b.passage.id))
    });
    scored.truncate(limit);
    scored
}

// ============ Session cache ============

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub requester_id: String,
    pub session_id: String,
    pub query_text: String,
}

struct CacheEntry {
    result: RetrievalResult,
    stored_at: Instant,
    stored_unix: i64,
}

/// In-process TTL cache for retrieval results. Expired entries are pruned
/// lazily on access.
pub struct SessionCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<RetrievalResult> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.result.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: CacheKey, result: RetrievalResult) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: Instant::now(),
                stored_unix: chrono::Utc::now().timestamp(),
            },
        );
    }

    /// Drop every entry belonging to one session. Returns the count removed.
    pub fn clear_session(&self, session_id: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|key, _| key.session_id != session_id);
        before - entries.len()
    }

    pub fn clear_all(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn stats(&self) -> CacheStats {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);

        let sessions: HashSet<&str> = entries.keys().map(|k| k.session_id.as_str()).collect();
        let oldest_entry = entries.values().map(|e| e.stored_unix).min();

        CacheStats {
            total_entries: entries.len(),
            total_sessions: sessions.len(),
            oldest_entry,
        }
    }
}

// ============ Retriever ============

pub struct Retriever {
    store: Arc<dyn PassageStore>,
    cache: Arc<SessionCache>,
    guard: Arc<SecurityGuard>,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn PassageStore>,
        cache: Arc<SessionCache>,
        guard: Arc<SecurityGuard>,
    ) -> Self {
        Self {
            store,
            cache,
            guard,
        }
    }

    pub async fn retrieve(&self, query: &PassageQuery) -> Result<RetrievalResult, PipelineError> {
        self.guard.allow(&query.requester_id, Endpoint::Retrieval)?;

        let key = CacheKey {
            requester_id: query.requester_id.clone(),
            session_id: query.session_id.clone(),
            query_text: query.text.clone(),
        };

        if let Some(mut hit) = self.cache.get(&key) {
            hit.cache_hit = true;
            tracing::debug!(
                session = %query.session_id,
                query = %query.text,
                "retrieval served from session cache"
            );
            return Ok(hit);
        }

        let filter = PassageFilter {
            case_id: query.case_id.clone(),
            stage: query.stage,
            section: query.section,
            tags: query.tags.clone(),
        };

        let store = Arc::clone(&self.store);
        let fetched = self
            .guard
            .with_timeout(Endpoint::Retrieval, async move {
                store
                    .find_passages(&filter)
                    .await
                    .map_err(|e| PipelineError::store(e.to_string()))
            })
            .await;

        match fetched {
            Ok(candidates) => {
                self.guard
                    .record_success(&query.requester_id, Endpoint::Retrieval);
                let total_found = candidates.len();
                let passages = score_passages(&query.text, candidates, query.limit);
                let result = RetrievalResult {
                    passages,
                    total_found,
                    query_text: query.text.clone(),
                    cache_hit: false,
                };
                self.cache.put(key, result.clone());
                Ok(result)
            }
            Err(err) => {
                self.guard
                    .record_failure(&query.requester_id, Endpoint::Retrieval);
                Err(err)
            }
        }
    }
}

// ============ CLI ============

#[allow(clippy::too_many_arguments)]
pub async fn run_retrieve(
    config: &Config,
    text: &str,
    case_id: Option<String>,
    stage: Option<u32>,
    section: Option<String>,
    tags: Vec<String>,
    limit: Option<usize>,
    session: &str,
) -> Result<()> {
    if text.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let section = match section {
        Some(s) => Some(
            s.parse::<Section>()
                .map_err(|e| anyhow::anyhow!(e))?,
        ),
        None => None,
    };

    let pool = db::connect(config).await?;
    let store: Arc<dyn PassageStore> = Arc::new(SqliteStore::new(pool.clone()));
    let guard = Arc::new(SecurityGuard::new(&config.security));
    let cache = Arc::new(SessionCache::new(Duration::from_secs(
        config.retrieval.cache_ttl_secs,
    )));
    let retriever = Retriever::new(store, cache, guard);

    let query = PassageQuery {
        text: text.to_string(),
        case_id,
        stage,
        section,
        tags,
        limit: limit.unwrap_or(config.retrieval.default_limit),
        requester_id: "cli".to_string(),
        session_id: session.to_string(),
    };

    let result = retriever.retrieve(&query).await?;

    if result.passages.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, scored) in result.passages.iter().enumerate() {
        let p = &scored.passage;
        println!(
            "{}. [{:.2}] {} / {} (stage {})",
            i + 1,
            scored.combined_score,
            p.case_id,
            p.section,
            p.stage
        );
        if !p.tags.is_empty() {
            println!("    tags: {}", p.tags.join(", "));
        }
        println!(
            "    text: {:.2}  tag: {:.2}",
            scored.text_score, scored.tag_score
        );
        let excerpt: String = p.body.chars().take(160).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    id: {}", p.id);
        println!();
    }

    pool.close().await;
    Ok(())
}
