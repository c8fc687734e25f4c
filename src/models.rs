//! Core data models used throughout Evidence Harness.
//!
//! These types represent the case-file passages, deterministic rule records,
//! and grounded response bundles that flow through the retrieval and
//! composition pipeline.
//!
//! Wire-facing structs serialize with camelCase field names to match the
//! HTTP contract; enum values stay snake_case (`critical_actions`,
//! `drug_dose`, `partially_correct`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Section of a simulation case file a passage belongs to.
///
/// The set is closed: seed files naming any other section fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Background,
    Objectives,
    CriticalActions,
    Contraindications,
    Debrief,
    ActorPrompts,
    Pitfalls,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Background => "background",
            Section::Objectives => "objectives",
            Section::CriticalActions => "critical_actions",
            Section::Contraindications => "contraindications",
            Section::Debrief => "debrief",
            Section::ActorPrompts => "actor_prompts",
            Section::Pitfalls => "pitfalls",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "background" => Ok(Section::Background),
            "objectives" => Ok(Section::Objectives),
            "critical_actions" => Ok(Section::CriticalActions),
            "contraindications" => Ok(Section::Contraindications),
            "debrief" => Ok(Section::Debrief),
            "actor_prompts" => Ok(Section::ActorPrompts),
            "pitfalls" => Ok(Section::Pitfalls),
            other => Err(format!("unknown section: {}", other)),
        }
    }
}

/// A single curated passage from a case file. Immutable once seeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Passage {
    pub id: String,
    pub case_id: String,
    pub stage: u32,
    pub section: Section,
    #[serde(default)]
    pub tags: Vec<String>,
    pub body: String,
    #[serde(default)]
    pub source_citation: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub content_hash: String,
}

/// A retrieval request. Transient, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassageQuery {
    pub text: String,
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub stage: Option<u32>,
    #[serde(default)]
    pub section: Option<Section>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_query_limit")]
    pub limit: usize,
    pub requester_id: String,
    pub session_id: String,
}

fn default_query_limit() -> usize {
    8
}

/// A passage paired with its retrieval scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredPassage {
    pub passage: Passage,
    pub text_score: f64,
    pub tag_score: f64,
    pub combined_score: f64,
}

/// Ranked output of the retriever.
///
/// `cache_hit` is observability only; cached and fresh results are otherwise
/// byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    pub passages: Vec<ScoredPassage>,
    pub total_found: usize,
    pub query_text: String,
    pub cache_hit: bool,
}

// ============ Rule records ============

/// Discriminant of a [`RulePayload`], stored as its own column so rules can
/// be queried by kind without decoding payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    DrugDose,
    AlgoSteps,
    CriticalActions,
    VitalCurve,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::DrugDose => "drug_dose",
            RuleKind::AlgoSteps => "algo_steps",
            RuleKind::CriticalActions => "critical_actions",
            RuleKind::VitalCurve => "vital_curve",
        }
    }
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drug_dose" => Ok(RuleKind::DrugDose),
            "algo_steps" => Ok(RuleKind::AlgoSteps),
            "critical_actions" => Ok(RuleKind::CriticalActions),
            "vital_curve" => Ok(RuleKind::VitalCurve),
            other => Err(format!("unknown rule kind: {}", other)),
        }
    }
}

/// Closed tagged union of deterministic rule payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RulePayload {
    DrugDose(DrugDosePayload),
    AlgoSteps(AlgoStepsPayload),
    CriticalActions(CriticalActionsPayload),
    VitalCurve(VitalCurvePayload),
}

impl RulePayload {
    pub fn kind(&self) -> RuleKind {
        match self {
            RulePayload::DrugDose(_) => RuleKind::DrugDose,
            RulePayload::AlgoSteps(_) => RuleKind::AlgoSteps,
            RulePayload::CriticalActions(_) => RuleKind::CriticalActions,
            RulePayload::VitalCurve(_) => RuleKind::VitalCurve,
        }
    }
}

/// Weight-based dosing rule for a single drug.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrugDosePayload {
    pub drug: String,
    pub unit: String,
    pub route: String,
    pub mg_per_kg_min: f64,
    pub mg_per_kg_max: f64,
    pub max_dose: f64,
    #[serde(default)]
    pub weight_bands: Vec<WeightBand>,
}

/// A fixed dose for a contiguous weight range, taking precedence over the
/// per-kilogram formula.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightBand {
    pub min_kg: f64,
    pub max_kg: f64,
    pub dose: f64,
}

/// Ordered treatment-algorithm steps, each gated on vital-sign conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoStepsPayload {
    pub steps: Vec<AlgoStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoStep {
    pub order: u32,
    pub action: String,
    #[serde(default)]
    pub applies_if: Vec<VitalCondition>,
}

/// A predicate over one vital sign. Any combination of `eq`, `min`, and
/// `max` may be set; all set bounds must hold. A vital absent from the
/// observed set fails the condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalCondition {
    pub vital: String,
    #[serde(default)]
    pub eq: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// Per-stage checklist of expected learner actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalActionsPayload {
    pub actions: Vec<CriticalAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalAction {
    pub id: String,
    pub stage: u32,
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// Scripted trajectory of one vital sign over scenario time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalCurvePayload {
    pub vital: String,
    pub points: Vec<CurvePoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurvePoint {
    pub at_seconds: u32,
    pub value: f64,
}

/// A versioned deterministic rule. Newer versions of the same `id` shadow
/// older ones; old versions are kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    pub id: String,
    pub case_id: String,
    pub version: u32,
    #[serde(default)]
    pub checksum: String,
    pub payload: RulePayload,
}

// ============ Grounded bundles ============

/// Assessment of a learner utterance or question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Correct,
    PartiallyCorrect,
    Incorrect,
    Harmful,
    Irrelevant,
    Informational,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Correct => "correct",
            Verdict::PartiallyCorrect => "partially_correct",
            Verdict::Incorrect => "incorrect",
            Verdict::Harmful => "harmful",
            Verdict::Irrelevant => "irrelevant",
            Verdict::Informational => "informational",
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "correct" => Ok(Verdict::Correct),
            "partially_correct" => Ok(Verdict::PartiallyCorrect),
            "incorrect" => Ok(Verdict::Incorrect),
            "harmful" => Ok(Verdict::Harmful),
            "irrelevant" => Ok(Verdict::Irrelevant),
            "informational" => Ok(Verdict::Informational),
            other => Err(format!("unknown verdict: {}", other)),
        }
    }
}

/// A resolved citation pointing into the retrieved passage set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRef {
    pub case_id: String,
    pub section: Section,
    pub passage_id: String,
    pub source_citation: String,
    pub license: String,
}

/// The composer's response contract.
///
/// Invariants, enforced by the composer and asserted in tests: a fallback
/// bundle carries zero `evidence_sources` and at least one risk flag; a
/// grounded bundle carries at least two resolved `evidence_sources`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundedBundle {
    pub explanation: String,
    pub evidence_sources: Vec<EvidenceRef>,
    pub objective_hits: Vec<String>,
    pub risk_flags: Vec<String>,
    pub next_stage_recommendations: Vec<String>,
    pub verdict: Verdict,
    pub confidence: f64,
    pub fallback: bool,
    pub license: String,
    pub source_version: String,
}

// ============ Rules engine requests/responses ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseQuery {
    pub drug: String,
    pub weight_kg: f64,
    #[serde(default)]
    pub age_months: Option<u32>,
    #[serde(default)]
    pub case_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseResponse {
    pub drug: String,
    pub dose: f64,
    pub unit: String,
    pub route: String,
    pub warnings: Vec<String>,
    pub rule_id: String,
    pub rule_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoQuery {
    pub case_id: String,
    pub stage: u32,
    #[serde(default)]
    pub vitals: HashMap<String, f64>,
    #[serde(default)]
    pub completed_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoResponse {
    pub steps: Vec<AlgoStep>,
    pub critical_actions: Vec<CriticalAction>,
    pub next_stage: u32,
}

// ============ External evidence ============

/// A bibliographic record fetched from the external literature service and
/// persisted in the durable evidence cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub abstract_text: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub venue: String,
    #[serde(default)]
    pub published_year: Option<i32>,
    #[serde(default)]
    pub relevance: f64,
}

/// Session-cache operator statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_sessions: usize,
    pub oldest_entry: Option<i64>,
}

// ============ Seed files ============

/// A case bundle as authored on disk: passages plus rule records.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseBundle {
    #[serde(default)]
    pub passages: Vec<SeedPassage>,
    #[serde(default)]
    pub rules: Vec<SeedRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedPassage {
    #[serde(default)]
    pub id: Option<String>,
    pub case_id: String,
    pub stage: u32,
    pub section: Section,
    #[serde(default)]
    pub tags: Vec<String>,
    pub body: String,
    #[serde(default)]
    pub source_citation: String,
    #[serde(default)]
    pub license: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRule {
    pub id: String,
    pub case_id: String,
    pub version: u32,
    pub payload: RulePayload,
}
