//! Deterministic rules engine: dosing, treatment algorithms, and critical
//! actions.
//!
//! Everything in this module is replayable from a rule snapshot. It never
//! calls the generative model; dosing math and stage gating must not
//! depend on anything but the stored records and the caller's inputs.
//!
//! Case-specific dosing rules shadow the shared `general` set, so a case
//! author can override a standard dose for one scenario without touching
//! the shared table.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::error::PipelineError;
use crate::guard::{Endpoint, SecurityGuard};
use crate::models::{
    AlgoQuery, AlgoResponse, CriticalAction, CurvePoint, DoseQuery, DoseResponse, DrugDosePayload,
    RuleKind, RulePayload, RuleRecord, VitalCondition,
};
use crate::store::{RuleStore, SqliteStore};

pub const GENERAL_CASE: &str = "general";

pub struct RulesEngine {
    store: Arc<dyn RuleStore>,
    guard: Arc<SecurityGuard>,
}

impl RulesEngine {
    pub fn new(store: Arc<dyn RuleStore>, guard: Arc<SecurityGuard>) -> Self {
        Self { store, guard }
    }

    pub async fn dose(
        &self,
        requester_id: &str,
        query: &DoseQuery,
    ) -> Result<DoseResponse, PipelineError> {
        if query.drug.trim().is_empty() {
            return Err(PipelineError::validation("drug must not be empty"));
        }
        if !query.weight_kg.is_finite() || query.weight_kg <= 0.0 {
            return Err(PipelineError::validation("weightKg must be positive"));
        }

        self.guard.allow(requester_id, Endpoint::Rules)?;

        let lookup = {
            let store = Arc::clone(&self.store);
            let case_id = query
                .case_id
                .clone()
                .unwrap_or_else(|| GENERAL_CASE.to_string());
            let drug = query.drug.clone();
            self.guard
                .with_timeout(Endpoint::Rules, async move {
                    let mut candidates = matching_dose_rules(&*store, &case_id, &drug).await?;
                    if candidates.is_empty() && case_id != GENERAL_CASE {
                        candidates = matching_dose_rules(&*store, GENERAL_CASE, &drug).await?;
                    }
                    Ok(candidates)
                })
                .await
        };

        let candidates = match lookup {
            Ok(candidates) => {
                self.guard.record_success(requester_id, Endpoint::Rules);
                candidates
            }
            Err(err) => {
                self.guard.record_failure(requester_id, Endpoint::Rules);
                return Err(err);
            }
        };

        let record = match newest(candidates) {
            Some(record) => record,
            None => {
                return Err(PipelineError::validation(format!(
                    "no dosing rule for '{}'",
                    query.drug
                )))
            }
        };

        let payload = match &record.payload {
            RulePayload::DrugDose(payload) => payload,
            _ => {
                return Err(PipelineError::store(format!(
                    "rule {} is not a dosing rule",
                    record.id
                )))
            }
        };

        let (dose, warnings) = compute_dose(payload, query.weight_kg);
        Ok(DoseResponse {
            drug: payload.drug.clone(),
            dose,
            unit: payload.unit.clone(),
            route: payload.route.clone(),
            warnings,
            rule_id: record.id.clone(),
            rule_version: record.version,
        })
    }

    pub async fn algorithm(
        &self,
        requester_id: &str,
        query: &AlgoQuery,
    ) -> Result<AlgoResponse, PipelineError> {
        if query.case_id.trim().is_empty() {
            return Err(PipelineError::validation("caseId must not be empty"));
        }

        self.guard.allow(requester_id, Endpoint::Rules)?;

        let lookup = {
            let store = Arc::clone(&self.store);
            let case_id = query.case_id.clone();
            self.guard
                .with_timeout(Endpoint::Rules, async move {
                    let algo = store
                        .rules_for(&case_id, RuleKind::AlgoSteps)
                        .await
                        .map_err(|e| PipelineError::store(e.to_string()))?;
                    let actions = store
                        .rules_for(&case_id, RuleKind::CriticalActions)
                        .await
                        .map_err(|e| PipelineError::store(e.to_string()))?;
                    Ok((algo, actions))
                })
                .await
        };

        let (algo_rules, action_rules) = match lookup {
            Ok(pair) => {
                self.guard.record_success(requester_id, Endpoint::Rules);
                pair
            }
            Err(err) => {
                self.guard.record_failure(requester_id, Endpoint::Rules);
                return Err(err);
            }
        };

        let mut steps = Vec::new();
        if let Some(record) = newest(algo_rules) {
            if let RulePayload::AlgoSteps(payload) = &record.payload {
                steps = payload
                    .steps
                    .iter()
                    .filter(|step| {
                        step.applies_if
                            .iter()
                            .all(|cond| condition_holds(cond, &query.vitals))
                    })
                    .cloned()
                    .collect();
                steps.sort_by_key(|s| s.order);
            }
        }

        let mut stage_actions = Vec::new();
        let mut next_stage = query.stage;
        if let Some(record) = newest(action_rules) {
            if let RulePayload::CriticalActions(payload) = &record.payload {
                stage_actions = payload
                    .actions
                    .iter()
                    .filter(|a| a.stage == query.stage)
                    .cloned()
                    .collect();
                // Advance only when every required action is done; a stage
                // with no required actions advances freely
                let all_required_done = stage_actions
                    .iter()
                    .filter(|a| a.required)
                    .all(|a| query.completed_actions.iter().any(|done| done == &a.id));
                if all_required_done {
                    next_stage = query.stage + 1;
                }
            }
        }

        Ok(AlgoResponse {
            steps,
            critical_actions: stage_actions,
            next_stage,
        })
    }

    pub async fn critical_actions(
        &self,
        requester_id: &str,
        case_id: &str,
        stage: u32,
    ) -> Result<Vec<CriticalAction>, PipelineError> {
        self.guard.allow(requester_id, Endpoint::Rules)?;

        let lookup = {
            let store = Arc::clone(&self.store);
            let case_id = case_id.to_string();
            self.guard
                .with_timeout(Endpoint::Rules, async move {
                    store
                        .rules_for(&case_id, RuleKind::CriticalActions)
                        .await
                        .map_err(|e| PipelineError::store(e.to_string()))
                })
                .await
        };

        let rules = match lookup {
            Ok(rules) => {
                self.guard.record_success(requester_id, Endpoint::Rules);
                rules
            }
            Err(err) => {
                self.guard.record_failure(requester_id, Endpoint::Rules);
                return Err(err);
            }
        };

        let mut actions = Vec::new();
        if let Some(record) = newest(rules) {
            if let RulePayload::CriticalActions(payload) = &record.payload {
                actions = payload
                    .actions
                    .iter()
                    .filter(|a| a.stage == stage)
                    .cloned()
                    .collect();
            }
        }
        Ok(actions)
    }

    /// Scripted trajectory for one vital, from the newest matching curve
    /// record. Points come back ordered by scenario time.
    pub async fn vital_curve(
        &self,
        requester_id: &str,
        case_id: &str,
        vital: &str,
    ) -> Result<Vec<CurvePoint>, PipelineError> {
        self.guard.allow(requester_id, Endpoint::Rules)?;

        let lookup = {
            let store = Arc::clone(&self.store);
            let case_id = case_id.to_string();
            self.guard
                .with_timeout(Endpoint::Rules, async move {
                    store
                        .rules_for(&case_id, RuleKind::VitalCurve)
                        .await
                        .map_err(|e| PipelineError::store(e.to_string()))
                })
                .await
        };

        let rules = match lookup {
            Ok(rules) => {
                self.guard.record_success(requester_id, Endpoint::Rules);
                rules
            }
            Err(err) => {
                self.guard.record_failure(requester_id, Endpoint::Rules);
                return Err(err);
            }
        };

        let matching: Vec<RuleRecord> = rules
            .into_iter()
            .filter(|r| {
                matches!(&r.payload, RulePayload::VitalCurve(c) if c.vital.eq_ignore_ascii_case(vital))
            })
            .collect();

        let mut points = Vec::new();
        if let Some(record) = newest(matching) {
            if let RulePayload::VitalCurve(payload) = &record.payload {
                points = payload.points.clone();
                points.sort_by_key(|p| p.at_seconds);
            }
        }
        Ok(points)
    }
}

async fn matching_dose_rules(
    store: &dyn RuleStore,
    case_id: &str,
    drug: &str,
) -> Result<Vec<RuleRecord>, PipelineError> {
    let rules = store
        .rules_for(case_id, RuleKind::DrugDose)
        .await
        .map_err(|e| PipelineError::store(e.to_string()))?;
    Ok(rules
        .into_iter()
        .filter(|r| {
            matches!(&r.payload, RulePayload::DrugDose(d) if d.drug.eq_ignore_ascii_case(drug))
        })
        .collect())
}

fn newest(mut records: Vec<RuleRecord>) -> Option<RuleRecord> {
    records.sort_by(|a, b| b.version.cmp(&a.version).then(a.id.cmp(&b.id)));
    records.into_iter().next()
}

/// Dose for a weight under one dosing payload, plus any warnings.
///
/// A covering weight band supplies a fixed authored dose. Otherwise the
/// dose is weight times the midpoint of the per-kilogram range, floored at
/// the per-kilogram minimum and capped at the absolute maximum; the cap
/// wins when the two conflict.
pub fn compute_dose(payload: &DrugDosePayload, weight_kg: f64) -> (f64, Vec<String>) {
    let mut warnings = Vec::new();
    if weight_kg < 1.0 {
        warnings.push("weight below 1 kg; verify before administration".to_string());
    }

    let band = payload
        .weight_bands
        .iter()
        .find(|b| weight_kg >= b.min_kg && weight_kg <= b.max_kg);

    let dose = match band {
        Some(band) => band.dose,
        None => {
            let per_kg = (payload.mg_per_kg_min + payload.mg_per_kg_max) / 2.0;
            let floored = (weight_kg * per_kg).max(payload.mg_per_kg_min * weight_kg);
            if floored > payload.max_dose {
                warnings.push(format!(
                    "dose capped at the {} {} absolute maximum",
                    payload.max_dose, payload.unit
                ));
                payload.max_dose
            } else {
                floored
            }
        }
    };

    (round2(dose), warnings)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn condition_holds(cond: &VitalCondition, vitals: &HashMap<String, f64>) -> bool {
    let value = match lookup_vital(vitals, &cond.vital) {
        Some(v) => v,
        None => return false,
    };
    if let Some(eq) = cond.eq {
        if (value - eq).abs() > 1e-9 {
            return false;
        }
    }
    if let Some(min) = cond.min {
        if value < min {
            return false;
        }
    }
    if let Some(max) = cond.max {
        if value > max {
            return false;
        }
    }
    true
}

fn lookup_vital(vitals: &HashMap<String, f64>, name: &str) -> Option<f64> {
    vitals
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| *value)
}

// ============ CLI ============

pub async fn run_dose(
    config: &Config,
    drug: &str,
    weight_kg: f64,
    age_months: Option<u32>,
    case_id: Option<String>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let engine = RulesEngine::new(
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(SecurityGuard::new(&config.security)),
    );

    let response = engine
        .dose(
            "cli",
            &DoseQuery {
                drug: drug.to_string(),
                weight_kg,
                age_months,
                case_id,
            },
        )
        .await?;

    println!("--- Dose ---");
    println!("drug:    {}", response.drug);
    println!("dose:    {} {}", response.dose, response.unit);
    println!("route:   {}", response.route);
    println!("rule:    {} v{}", response.rule_id, response.rule_version);
    for warning in &response.warnings {
        println!("warning: {}", warning);
    }

    pool.close().await;
    Ok(())
}

pub async fn run_algo(
    config: &Config,
    case_id: &str,
    stage: u32,
    vitals: Vec<(String, f64)>,
    completed: Vec<String>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let engine = RulesEngine::new(
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(SecurityGuard::new(&config.security)),
    );

    let response = engine
        .algorithm(
            "cli",
            &AlgoQuery {
                case_id: case_id.to_string(),
                stage,
                vitals: vitals.into_iter().collect(),
                completed_actions: completed,
            },
        )
        .await?;

    println!("--- Algorithm ({}, stage {}) ---", case_id, stage);
    if response.steps.is_empty() {
        println!("(no applicable steps)");
    }
    for step in &response.steps {
        println!("{}. {}", step.order, step.action);
    }
    println!();

    println!("--- Critical actions ---");
    if response.critical_actions.is_empty() {
        println!("(none for this stage)");
    }
    for action in &response.critical_actions {
        let marker = if action.required { "[required]" } else { "[optional]" };
        println!("{} {}: {}", marker, action.id, action.description);
    }
    println!();
    println!("next stage: {}", response.next_stage);

    pool.close().await;
    Ok(())
}
