//! Grounded answer composition.
//!
//! One `explain` call walks a fixed state machine: retrieve passages,
//! gather optional external evidence, build a sanitized prompt, call the
//! completion model under the guard, parse the model's structured output,
//! resolve its inline citations against the retrieved set, and finalize.
//! Any step that cannot establish grounding downgrades to a fallback
//! bundle instead of erroring: a fallback always carries zero evidence
//! sources, at least one risk flag, and a human-readable safety notice.
//! Only rate-limit and open-circuit rejections surface to the caller.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{ComposerConfig, Config};
use crate::error::PipelineError;
use crate::evidence::{EvidenceClient, EvidenceQuery};
use crate::guard::{Endpoint, SecurityGuard};
use crate::model::CompletionModel;
use crate::models::{
    Article, EvidenceRef, GroundedBundle, PassageQuery, ScoredPassage, Section, Verdict,
};
use crate::pipeline::Pipeline;
use crate::retrieve::Retriever;
use crate::sanitize::{build_secure_system_prompt, detect_threats, sanitize, scrub, RiskLevel};

/// Safety notice carried by every fallback bundle.
pub const FALLBACK_NOTICE: &str = "This response could not be grounded in the curated case \
material. Do not act on it without confirming against the scenario protocol and your instructor.";

const OBJECTIVE_KEYWORDS: [&str; 3] = ["objective", "goal", "aim"];
const RISK_KEYWORDS: [&str; 4] = ["risk", "danger", "avoid", "warning"];
const NEXT_KEYWORDS: [&str; 4] = ["next", "then", "follow", "continue"];

const MAX_LIST_ITEMS: usize = 5;

static CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([A-Za-z0-9_-]+)#([A-Za-z0-9_-]+)\)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    InsufficientEvidence,
    ModelError,
    ValidationError,
}

impl FallbackReason {
    pub fn flag(&self) -> &'static str {
        match self {
            FallbackReason::InsufficientEvidence => "insufficient_evidence",
            FallbackReason::ModelError => "model_error",
            FallbackReason::ValidationError => "validation_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainRequest {
    pub question: String,
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub stage: Option<u32>,
    #[serde(default)]
    pub section: Option<Section>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Intervention term for the external literature lookup. Evidence is
    /// skipped entirely when absent.
    #[serde(default)]
    pub intervention: Option<String>,
    #[serde(default)]
    pub age_group: Option<String>,
    pub requester_id: String,
    pub session_id: String,
}

pub struct Composer {
    retriever: Arc<Retriever>,
    evidence: Arc<EvidenceClient>,
    model: Arc<dyn CompletionModel>,
    guard: Arc<SecurityGuard>,
    config: ComposerConfig,
    max_input_tokens: usize,
}

impl Composer {
    pub fn new(
        retriever: Arc<Retriever>,
        evidence: Arc<EvidenceClient>,
        model: Arc<dyn CompletionModel>,
        guard: Arc<SecurityGuard>,
        config: ComposerConfig,
        max_input_tokens: usize,
    ) -> Self {
        Self {
            retriever,
            evidence,
            model,
            guard,
            config,
            max_input_tokens,
        }
    }

    /// Produce a grounded bundle for a learner question, or a fallback
    /// bundle when grounding cannot be established.
    pub async fn explain(&self, request: &ExplainRequest) -> Result<GroundedBundle, PipelineError> {
        self.guard
            .allow(&request.requester_id, Endpoint::Composition)?;

        let report = detect_threats(&request.question);
        if report.risk_level >= RiskLevel::Medium {
            tracing::warn!(
                requester = %request.requester_id,
                risk = report.risk_level.as_str(),
                "threat markers detected in learner question"
            );
        }

        let question = sanitize(&request.question, self.max_input_tokens);
        if question.is_empty() {
            return Ok(self.fallback(FallbackReason::ValidationError, None, &[]));
        }

        let query = PassageQuery {
            text: question.clone(),
            case_id: request.case_id.clone(),
            stage: request.stage,
            section: request.section,
            tags: request.tags.clone(),
            limit: self.config.max_context_passages,
            requester_id: request.requester_id.clone(),
            session_id: request.session_id.clone(),
        };

        // Retrieval and the literature lookup are independent; evidence
        // failures of any kind mean composing with fewer articles.
        let retrieval_fut = self.retriever.retrieve(&query);
        let evidence_fut = async {
            let intervention = match &request.intervention {
                Some(term) if !term.trim().is_empty() => term.clone(),
                _ => return Vec::new(),
            };
            let evidence_query = EvidenceQuery {
                intervention,
                case_type: request.case_id.clone().unwrap_or_default(),
                age_group: request.age_group.clone(),
                limit: self.evidence.default_limit(),
            };
            match self
                .evidence
                .search(&request.requester_id, &evidence_query)
                .await
            {
                Ok(articles) => articles,
                Err(err) => {
                    tracing::warn!(error = %err, "external evidence unavailable");
                    Vec::new()
                }
            }
        };
        let (retrieval, articles) = tokio::join!(retrieval_fut, evidence_fut);

        let retrieval = match retrieval {
            Ok(result) => result,
            Err(err) if err.is_hard() => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "retrieval failed during composition");
                return Ok(self.fallback(FallbackReason::InsufficientEvidence, None, &[]));
            }
        };
        if retrieval.passages.is_empty() {
            return Ok(self.fallback(FallbackReason::InsufficientEvidence, None, &[]));
        }
        let passages = retrieval.passages;

        let system_prompt =
            build_secure_system_prompt(&self.config.system_prompt, self.max_input_tokens);
        let user_prompt = self.build_user_prompt(&question, &passages, &articles);

        let completion = self
            .guard
            .with_timeout(Endpoint::Composition, async {
                self.model.complete(&system_prompt, &user_prompt).await
            })
            .await;

        let raw = match completion {
            Ok(raw) => {
                self.guard
                    .record_success(&request.requester_id, Endpoint::Composition);
                raw
            }
            Err(err) => {
                self.guard
                    .record_failure(&request.requester_id, Endpoint::Composition);
                tracing::warn!(error = %err, model = self.model.name(), "model call failed");
                return Ok(self.fallback(FallbackReason::ModelError, None, &passages));
            }
        };

        let parsed = match parse_model_output(&raw) {
            Ok(parsed) => parsed,
            Err(failure) => {
                tracing::warn!(reason = %failure.reason, "model output failed validation");
                return Ok(self.fallback(
                    FallbackReason::ValidationError,
                    failure.partial,
                    &passages,
                ));
            }
        };

        let citations = extract_citations(&parsed.explanation, &passages);
        if citations.len() < self.config.min_citations {
            tracing::info!(
                resolved = citations.len(),
                required = self.config.min_citations,
                "not enough resolvable citations"
            );
            return Ok(self.fallback(FallbackReason::InsufficientEvidence, None, &passages));
        }

        Ok(self.finalize(parsed, citations, &passages))
    }

    fn finalize(
        &self,
        parsed: ParsedOutput,
        citations: Vec<EvidenceRef>,
        passages: &[ScoredPassage],
    ) -> GroundedBundle {
        let objective_hits = if parsed.objective_hits.is_empty() {
            scan_family(passages, &OBJECTIVE_KEYWORDS)
        } else {
            cap_list(parsed.objective_hits)
        };
        let risk_flags = if parsed.risk_flags.is_empty() {
            scan_family(passages, &RISK_KEYWORDS)
        } else {
            cap_list(parsed.risk_flags)
        };
        let next_stage_recommendations = if parsed.next_stage_recommendations.is_empty() {
            scan_family(passages, &NEXT_KEYWORDS)
        } else {
            cap_list(parsed.next_stage_recommendations)
        };

        let license = citations
            .first()
            .map(|c| c.license.clone())
            .unwrap_or_default();

        GroundedBundle {
            explanation: parsed.explanation,
            evidence_sources: citations,
            objective_hits,
            risk_flags,
            next_stage_recommendations,
            verdict: parsed.verdict.unwrap_or(Verdict::Informational),
            confidence: parsed.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            fallback: false,
            license,
            source_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Safe bundle for every non-grounding outcome. Zero evidence sources,
    /// the reason as the leading risk flag, and structured lists scanned
    /// from whatever passages were retrieved.
    fn fallback(
        &self,
        reason: FallbackReason,
        partial: Option<String>,
        passages: &[ScoredPassage],
    ) -> GroundedBundle {
        tracing::info!(reason = reason.flag(), "composition fell back");

        let explanation = match partial {
            Some(partial) if !partial.trim().is_empty() => {
                format!("{}\n\n{}", FALLBACK_NOTICE, partial.trim())
            }
            _ => FALLBACK_NOTICE.to_string(),
        };

        let mut risk_flags = vec![reason.flag().to_string()];
        for flag in scan_family(passages, &RISK_KEYWORDS) {
            if risk_flags.len() >= MAX_LIST_ITEMS {
                break;
            }
            risk_flags.push(flag);
        }

        GroundedBundle {
            explanation,
            evidence_sources: Vec::new(),
            objective_hits: scan_family(passages, &OBJECTIVE_KEYWORDS),
            risk_flags,
            next_stage_recommendations: scan_family(passages, &NEXT_KEYWORDS),
            verdict: Verdict::Informational,
            confidence: self.config.fallback_confidence,
            fallback: true,
            license: String::new(),
            source_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn build_user_prompt(
        &self,
        question: &str,
        passages: &[ScoredPassage],
        articles: &[Article],
    ) -> String {
        let budget = self.config.max_prompt_tokens * 4;
        let mut out = String::from("Case passages:\n");

        for scored in passages.iter().take(self.config.max_context_passages) {
            let passage = &scored.passage;
            let line = format!(
                "- ({}#{}) [{} / stage {}] {}\n",
                passage.case_id,
                passage.id,
                passage.section,
                passage.stage,
                scrub(&passage.body)
            );
            if out.len() + line.len() > budget && out.len() > "Case passages:\n".len() {
                break;
            }
            out.push_str(&line);
        }

        if !articles.is_empty() {
            out.push_str("\nExternal literature (context only, not citable as passages):\n");
            for article in articles {
                match article.published_year {
                    Some(year) => out.push_str(&format!(
                        "- {} ({}, {}) [{}]\n",
                        article.title, article.venue, year, article.external_id
                    )),
                    None => out.push_str(&format!(
                        "- {} ({}) [{}]\n",
                        article.title, article.venue, article.external_id
                    )),
                }
            }
        }

        out.push_str(&format!("\nLearner question: {}\n", question));
        out.push_str(&format!(
            "\nRespond with a single JSON object: {{\"explanation\": string citing passages \
inline as (caseId#passageId), \"objectiveHits\": [string], \"riskFlags\": [string], \
\"nextStageRecommendations\": [string], \"verdict\": one of correct, partially_correct, \
incorrect, harmful, irrelevant, informational, \"confidence\": number in [0,1]}}. \
Cite at least {} passages.",
            self.config.min_citations
        ));

        out
    }
}

struct ParsedOutput {
    explanation: String,
    objective_hits: Vec<String>,
    risk_flags: Vec<String>,
    next_stage_recommendations: Vec<String>,
    verdict: Option<Verdict>,
    confidence: Option<f64>,
}

struct ParseFailure {
    reason: String,
    partial: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelOutput {
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    objective_hits: Vec<String>,
    #[serde(default)]
    risk_flags: Vec<String>,
    #[serde(default)]
    next_stage_recommendations: Vec<String>,
    #[serde(default)]
    verdict: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Two-phase parse: best-effort text cleanup, then strict shape checks.
/// Failures carry any salvageable explanation text for the fallback.
fn parse_model_output(raw: &str) -> Result<ParsedOutput, ParseFailure> {
    let cleaned = strip_code_fences(raw);

    let output: ModelOutput = match serde_json::from_str(cleaned) {
        Ok(output) => output,
        Err(err) => {
            return Err(ParseFailure {
                reason: format!("model output is not valid JSON: {}", err),
                partial: salvage_explanation(cleaned),
            })
        }
    };

    if output.explanation.trim().is_empty() {
        return Err(ParseFailure {
            reason: "model output has an empty explanation".to_string(),
            partial: None,
        });
    }

    let verdict = match output.verdict.as_deref() {
        None | Some("") => None,
        Some(raw_verdict) => match Verdict::from_str(raw_verdict) {
            Ok(verdict) => Some(verdict),
            Err(err) => {
                return Err(ParseFailure {
                    reason: err,
                    partial: Some(output.explanation),
                })
            }
        },
    };

    Ok(ParsedOutput {
        explanation: output.explanation,
        objective_hits: output.objective_hits,
        risk_flags: output.risk_flags,
        next_stage_recommendations: output.next_stage_recommendations,
        verdict,
        confidence: output.confidence,
    })
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    match rest.strip_suffix("```") {
        Some(inner) => inner.trim(),
        None => rest.trim(),
    }
}

/// Pull usable prose out of an unparseable model reply. A quoted
/// explanation field wins; otherwise non-JSON text is kept as-is.
fn salvage_explanation(cleaned: &str) -> Option<String> {
    static EXPLANATION_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#""explanation"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

    if let Some(caps) = EXPLANATION_RE.captures(cleaned) {
        let text = caps[1].replace("\\\"", "\"").replace("\\n", " ");
        if !text.trim().is_empty() {
            return Some(text);
        }
    }

    if !cleaned.trim_start().starts_with('{') && !cleaned.trim().is_empty() {
        let mut text = cleaned.trim().to_string();
        if text.len() > 600 {
            text.truncate(600);
        }
        return Some(text);
    }

    None
}

/// Resolve `(caseId#passageId)` citations against the retrieved set, in
/// first-appearance order, deduplicated. Unresolvable citations are
/// silently dropped; the caller enforces the minimum count.
fn extract_citations(explanation: &str, retrieved: &[ScoredPassage]) -> Vec<EvidenceRef> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();

    for caps in CITATION_RE.captures_iter(explanation) {
        let case_id = caps[1].to_string();
        let passage_id = caps[2].to_string();
        if !seen.insert((case_id.clone(), passage_id.clone())) {
            continue;
        }
        if let Some(scored) = retrieved
            .iter()
            .find(|s| s.passage.case_id == case_id && s.passage.id == passage_id)
        {
            refs.push(EvidenceRef {
                case_id: scored.passage.case_id.clone(),
                section: scored.passage.section,
                passage_id: scored.passage.id.clone(),
                source_citation: scored.passage.source_citation.clone(),
                license: scored.passage.license.clone(),
            });
        }
    }

    refs
}

/// Collect tags and sentences matching one keyword family, in retrieval
/// order, deduplicated, capped at five items.
fn scan_family(passages: &[ScoredPassage], keywords: &[&str]) -> Vec<String> {
    let mut hits: Vec<String> = Vec::new();

    for scored in passages {
        let passage = &scored.passage;
        for tag in &passage.tags {
            let lower = tag.to_lowercase();
            if keywords.iter().any(|k| lower.contains(k)) && !hits.contains(tag) {
                hits.push(tag.clone());
            }
        }
        for sentence in passage.body.split(['.', ';', '\n']) {
            let trimmed = sentence.trim();
            if trimmed.is_empty() {
                continue;
            }
            let lower = trimmed.to_lowercase();
            if keywords.iter().any(|k| lower.contains(k)) {
                let item = trimmed.to_string();
                if !hits.contains(&item) {
                    hits.push(item);
                }
            }
        }
    }

    hits.truncate(MAX_LIST_ITEMS);
    hits
}

fn cap_list(mut items: Vec<String>) -> Vec<String> {
    items.truncate(MAX_LIST_ITEMS);
    items
}

// ============ CLI ============

#[allow(clippy::too_many_arguments)]
pub async fn run_explain(
    config: &Config,
    question: &str,
    case_id: Option<String>,
    stage: Option<u32>,
    section: Option<String>,
    tags: Vec<String>,
    intervention: Option<String>,
    age_group: Option<String>,
    session: Option<String>,
) -> Result<()> {
    let section = match section {
        Some(raw) => Some(
            Section::from_str(&raw).map_err(|e| anyhow::anyhow!(e))?,
        ),
        None => None,
    };

    let pipeline = Pipeline::connect(config).await?;

    let request = ExplainRequest {
        question: question.to_string(),
        case_id,
        stage,
        section,
        tags,
        intervention,
        age_group,
        requester_id: "cli".to_string(),
        session_id: session.unwrap_or_else(|| "cli".to_string()),
    };

    let bundle = pipeline.composer().explain(&request).await?;
    println!("{}", serde_json::to_string_pretty(&bundle)?);

    pipeline.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvidenceConfig, SecurityConfig};
    use crate::model::ScriptedModel;
    use crate::models::Passage;
    use crate::retrieve::SessionCache;
    use crate::store::{MemoryStore, PassageStore};
    use std::time::Duration;

    fn passage(id: &str, section: Section, tags: &[&str], body: &str) -> Passage {
        Passage {
            id: id.to_string(),
            case_id: "anaphylaxis".to_string(),
            stage: 1,
            section,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            body: body.to_string(),
            source_citation: "PALS 2020".to_string(),
            license: "CC-BY-4.0".to_string(),
            content_hash: format!("hash-{}", id),
        }
    }

    fn fixture_passages() -> Vec<Passage> {
        vec![
            passage(
                "p1",
                Section::CriticalActions,
                &["critical_actions", "airway"],
                "Give IM epinephrine without delay. Then reassess the airway.",
            ),
            passage(
                "p2",
                Section::Pitfalls,
                &["pitfall"],
                "Avoid delaying epinephrine while waiting for IV access. This is a known risk.",
            ),
            passage(
                "p3",
                Section::Objectives,
                &["objectives"],
                "Goal: recognize anaphylaxis early. Objective: deliver epinephrine in stage 1.",
            ),
        ]
    }

    async fn seeded_composer(
        responses: Vec<Result<String, PipelineError>>,
    ) -> (Composer, Arc<ScriptedModel>) {
        let store = Arc::new(MemoryStore::new());
        for p in fixture_passages() {
            store.insert_passage(&p).await.unwrap();
        }

        let guard = Arc::new(SecurityGuard::new(&SecurityConfig::default()));
        let cache = Arc::new(SessionCache::new(Duration::from_secs(300)));
        let retriever = Arc::new(Retriever::new(store.clone(), cache, guard.clone()));
        let evidence = Arc::new(
            EvidenceClient::new(store, guard.clone(), EvidenceConfig::default()).unwrap(),
        );
        let model = Arc::new(ScriptedModel::new(responses));

        let composer = Composer::new(
            retriever,
            evidence,
            model.clone(),
            guard,
            ComposerConfig::default(),
            SecurityConfig::default().max_input_tokens,
        );
        (composer, model)
    }

    fn request(question: &str) -> ExplainRequest {
        ExplainRequest {
            question: question.to_string(),
            case_id: Some("anaphylaxis".to_string()),
            stage: Some(1),
            section: None,
            tags: Vec::new(),
            intervention: None,
            age_group: None,
            requester_id: "r1".to_string(),
            session_id: "s1".to_string(),
        }
    }

    fn assert_fallback_invariants(bundle: &GroundedBundle) {
        assert!(bundle.fallback);
        assert!(bundle.evidence_sources.is_empty());
        assert!(!bundle.risk_flags.is_empty());
        assert!(bundle.explanation.contains(FALLBACK_NOTICE));
    }

    #[test]
    fn test_strip_code_fences_variants() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_parse_model_output_valid() {
        let raw = r#"{"explanation":"Give epinephrine (anaphylaxis#p1).","objectiveHits":["x"],"verdict":"correct","confidence":0.9}"#;
        let parsed = parse_model_output(raw).ok().unwrap();
        assert_eq!(parsed.verdict, Some(Verdict::Correct));
        assert_eq!(parsed.confidence, Some(0.9));
        assert_eq!(parsed.objective_hits, vec!["x"]);
    }

    #[test]
    fn test_parse_model_output_bad_verdict_preserves_partial() {
        let raw = r#"{"explanation":"Some text.","verdict":"amazing"}"#;
        let failure = parse_model_output(raw).err().unwrap();
        assert!(failure.reason.contains("unknown verdict"));
        assert_eq!(failure.partial.as_deref(), Some("Some text."));
    }

    #[test]
    fn test_parse_model_output_prose_salvaged() {
        let failure = parse_model_output("Sorry, I cannot answer that.").err().unwrap();
        assert_eq!(failure.partial.as_deref(), Some("Sorry, I cannot answer that."));
    }

    #[test]
    fn test_parse_model_output_salvages_quoted_explanation() {
        let raw = r#"{"explanation": "Partial answer here", "verdict": }"#;
        let failure = parse_model_output(raw).err().unwrap();
        assert_eq!(failure.partial.as_deref(), Some("Partial answer here"));
    }

    #[test]
    fn test_extract_citations_resolves_and_dedups() {
        let passages: Vec<ScoredPassage> = fixture_passages()
            .into_iter()
            .map(|p| ScoredPassage {
                passage: p,
                text_score: 0.0,
                tag_score: 1.0,
                combined_score: 0.3,
            })
            .collect();

        let text = "First (anaphylaxis#p1), again (anaphylaxis#p1), \
unknown (anaphylaxis#p9), wrong case (sepsis#p1), then (anaphylaxis#p2).";
        let refs = extract_citations(text, &passages);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].passage_id, "p1");
        assert_eq!(refs[1].passage_id, "p2");
        assert_eq!(refs[0].license, "CC-BY-4.0");
    }

    #[test]
    fn test_scan_family_matches_tags_and_sentences() {
        let passages: Vec<ScoredPassage> = fixture_passages()
            .into_iter()
            .map(|p| ScoredPassage {
                passage: p,
                text_score: 0.0,
                tag_score: 1.0,
                combined_score: 0.3,
            })
            .collect();

        let objectives = scan_family(&passages, &OBJECTIVE_KEYWORDS);
        assert!(objectives.iter().any(|o| o == "objectives"));
        assert!(objectives.iter().any(|o| o.contains("recognize anaphylaxis")));

        let risks = scan_family(&passages, &RISK_KEYWORDS);
        assert!(risks.iter().any(|r| r.contains("Avoid delaying")));

        let next = scan_family(&passages, &NEXT_KEYWORDS);
        assert!(next.iter().any(|n| n.contains("reassess the airway")));
        assert!(objectives.len() <= MAX_LIST_ITEMS);
    }

    #[tokio::test]
    async fn test_explain_grounded_with_two_citations() {
        let reply = r#"{"explanation":"Give IM epinephrine first (anaphylaxis#p1). Do not wait for IV access (anaphylaxis#p2).","objectiveHits":["Recognize anaphylaxis"],"riskFlags":[],"nextStageRecommendations":[],"verdict":"correct","confidence":0.9}"#;
        let (composer, model) = seeded_composer(vec![Ok(reply.to_string())]).await;

        let bundle = composer
            .explain(&request("what is the first drug for anaphylaxis"))
            .await
            .unwrap();

        assert!(!bundle.fallback);
        assert_eq!(bundle.evidence_sources.len(), 2);
        assert_eq!(bundle.verdict, Verdict::Correct);
        assert_eq!(bundle.confidence, 0.9);
        assert_eq!(bundle.license, "CC-BY-4.0");
        assert_eq!(bundle.source_version, env!("CARGO_PKG_VERSION"));
        // lists missing from the model output are filled by keyword scan
        assert!(!bundle.risk_flags.is_empty());

        let (system, user) = model.requests().into_iter().next().unwrap();
        assert!(system.contains("clinical education assistant"));
        assert!(user.contains("(anaphylaxis#p1)"));
        assert!(user.contains("Learner question:"));
    }

    #[tokio::test]
    async fn test_explain_single_citation_falls_back() {
        let reply = r#"{"explanation":"Give epinephrine (anaphylaxis#p1).","verdict":"correct"}"#;
        let (composer, _) = seeded_composer(vec![Ok(reply.to_string())]).await;

        let bundle = composer.explain(&request("epinephrine?")).await.unwrap();
        assert_fallback_invariants(&bundle);
        assert_eq!(bundle.risk_flags[0], "insufficient_evidence");
        assert_eq!(bundle.confidence, ComposerConfig::default().fallback_confidence);
    }

    #[tokio::test]
    async fn test_explain_model_error_falls_back() {
        let (composer, _) =
            seeded_composer(vec![Err(PipelineError::model("upstream down"))]).await;

        let bundle = composer.explain(&request("epinephrine?")).await.unwrap();
        assert_fallback_invariants(&bundle);
        assert_eq!(bundle.risk_flags[0], "model_error");
        assert_eq!(bundle.verdict, Verdict::Informational);
    }

    #[tokio::test]
    async fn test_explain_invalid_json_preserves_partial() {
        let (composer, _) =
            seeded_composer(vec![Ok("The answer is epinephrine, obviously.".to_string())]).await;

        let bundle = composer.explain(&request("epinephrine?")).await.unwrap();
        assert_fallback_invariants(&bundle);
        assert_eq!(bundle.risk_flags[0], "validation_error");
        assert!(bundle.explanation.contains("epinephrine, obviously"));
    }

    #[tokio::test]
    async fn test_explain_no_passages_skips_model() {
        let reply = r#"{"explanation":"unused"}"#;
        let (composer, model) = seeded_composer(vec![Ok(reply.to_string())]).await;

        let mut req = request("anything");
        req.case_id = Some("no-such-case".to_string());
        let bundle = composer.explain(&req).await.unwrap();

        assert_fallback_invariants(&bundle);
        assert_eq!(bundle.risk_flags[0], "insufficient_evidence");
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_explain_empty_question_skips_model() {
        let (composer, model) = seeded_composer(vec![]).await;

        let bundle = composer.explain(&request("   ")).await.unwrap();
        assert_fallback_invariants(&bundle);
        assert_eq!(bundle.risk_flags[0], "validation_error");
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_explain_defaults_verdict_and_clamps_confidence() {
        let reply = r#"{"explanation":"See (anaphylaxis#p1) and (anaphylaxis#p3).","confidence":1.7}"#;
        let (composer, _) = seeded_composer(vec![Ok(reply.to_string())]).await;

        let bundle = composer.explain(&request("objectives?")).await.unwrap();
        assert!(!bundle.fallback);
        assert_eq!(bundle.verdict, Verdict::Informational);
        assert_eq!(bundle.confidence, 1.0);
    }
}
