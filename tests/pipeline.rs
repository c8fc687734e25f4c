//! End-to-end pipeline tests against in-memory stores and a scripted model.

use std::sync::Arc;

use evidence_harness::compose::{ExplainRequest, FALLBACK_NOTICE};
use evidence_harness::config::Config;
use evidence_harness::error::PipelineError;
use evidence_harness::model::ScriptedModel;
use evidence_harness::models::{GroundedBundle, Passage, PassageQuery, Section, Verdict};
use evidence_harness::pipeline::Pipeline;
use evidence_harness::store::{MemoryStore, PassageStore};

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

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let fixtures = vec![
        passage(
            "epi-im",
            Section::CriticalActions,
            &["critical_actions"],
            "Give IM epinephrine without delay for anaphylaxis. The epinephrine dose is weight based.",
        ),
        passage(
            "airway-check",
            Section::CriticalActions,
            &["critical_actions", "airway"],
            "Reassess the airway after the first epinephrine dose.",
        ),
        passage(
            "repeat-dose",
            Section::CriticalActions,
            &["critical_actions"],
            "A second epinephrine dose may follow in five minutes for refractory anaphylaxis.",
        ),
        passage(
            "iv-pitfall",
            Section::Pitfalls,
            &["pitfall"],
            "Avoid delaying epinephrine while waiting for IV access.",
        ),
    ];
    for p in fixtures {
        store.insert_passage(&p).await.unwrap();
    }
    store
}

fn pipeline_with(
    store: Arc<MemoryStore>,
    responses: Vec<Result<String, PipelineError>>,
) -> (Pipeline, Arc<ScriptedModel>) {
    let model = Arc::new(ScriptedModel::new(responses));
    let pipeline = Pipeline::assemble(
        store.clone(),
        store.clone(),
        store,
        model.clone(),
        &Config::default(),
    )
    .unwrap();
    (pipeline, model)
}

fn query(text: &str) -> PassageQuery {
    PassageQuery {
        text: text.to_string(),
        case_id: Some("anaphylaxis".to_string()),
        stage: Some(1),
        section: None,
        tags: Vec::new(),
        limit: 8,
        requester_id: "learner-1".to_string(),
        session_id: "session-1".to_string(),
    }
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
        requester_id: "learner-1".to_string(),
        session_id: "session-1".to_string(),
    }
}

fn assert_fallback_invariants(bundle: &GroundedBundle) {
    assert!(bundle.fallback);
    assert!(bundle.evidence_sources.is_empty());
    assert!(!bundle.risk_flags.is_empty());
    assert!(bundle.explanation.contains(FALLBACK_NOTICE));
}

#[tokio::test]
async fn test_retrieval_ranks_critical_actions_passages_first() {
    let store = seeded_store().await;
    let (pipeline, _) = pipeline_with(store, Vec::new());

    let result = pipeline
        .retriever()
        .retrieve(&query("epinephrine dose for anaphylaxis"))
        .await
        .unwrap();

    assert!(result.passages.len() >= 3);
    assert_eq!(result.total_found, 4);

    let top = &result.passages[0];
    assert_eq!(top.tag_score, 10.0);
    assert!(result
        .passages
        .iter()
        .all(|p| p.tag_score <= top.tag_score));
    assert!(result
        .passages
        .windows(2)
        .all(|w| w[0].combined_score >= w[1].combined_score));
}

#[tokio::test]
async fn test_repeated_retrieval_is_cached_and_identical() {
    let store = seeded_store().await;
    let (pipeline, _) = pipeline_with(store, Vec::new());

    let q = query("epinephrine dose for anaphylaxis");
    let first = pipeline.retriever().retrieve(&q).await.unwrap();
    let second = pipeline.retriever().retrieve(&q).await.unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);

    // Identical apart from the observability flag
    let strip = |r: &evidence_harness::models::RetrievalResult| {
        serde_json::json!({
            "passages": r.passages,
            "totalFound": r.total_found,
            "queryText": r.query_text,
        })
    };
    assert_eq!(strip(&first), strip(&second));

    assert_eq!(pipeline.cache().stats().total_entries, 1);
    assert_eq!(pipeline.cache().clear_session("session-1"), 1);
    assert_eq!(pipeline.cache().stats().total_entries, 0);
}

#[tokio::test]
async fn test_explain_grounded_when_model_cites_two_passages() {
    let reply = r#"{"explanation":"Give IM epinephrine first (anaphylaxis#epi-im), then reassess the airway (anaphylaxis#airway-check).","objectiveHits":[],"riskFlags":[],"nextStageRecommendations":[],"verdict":"correct","confidence":0.85}"#;
    let store = seeded_store().await;
    let (pipeline, model) = pipeline_with(store, vec![Ok(reply.to_string())]);

    let bundle = pipeline
        .composer()
        .explain(&request("epinephrine dose for anaphylaxis"))
        .await
        .unwrap();

    assert!(!bundle.fallback);
    assert_eq!(bundle.evidence_sources.len(), 2);
    assert_eq!(bundle.evidence_sources[0].passage_id, "epi-im");
    assert_eq!(bundle.evidence_sources[1].passage_id, "airway-check");
    assert_eq!(bundle.verdict, Verdict::Correct);
    assert_eq!(bundle.license, "CC-BY-4.0");
    assert_eq!(model.calls(), 1);

    // The prompt carried the citable passage markers
    let (_, user) = model.requests().into_iter().next().unwrap();
    assert!(user.contains("(anaphylaxis#epi-im)"));
}

#[tokio::test]
async fn test_explain_single_citation_downgrades_to_fallback() {
    let reply = r#"{"explanation":"Give IM epinephrine first (anaphylaxis#epi-im).","verdict":"correct","confidence":0.85}"#;
    let store = seeded_store().await;
    let (pipeline, _) = pipeline_with(store, vec![Ok(reply.to_string())]);

    let bundle = pipeline
        .composer()
        .explain(&request("epinephrine dose for anaphylaxis"))
        .await
        .unwrap();

    assert_fallback_invariants(&bundle);
    assert_eq!(bundle.risk_flags[0], "insufficient_evidence");
}

#[tokio::test]
async fn test_explain_citations_outside_retrieved_set_do_not_count() {
    // Both citations resolve only if the passage was actually retrieved;
    // made-up ids must not ground a bundle
    let reply = r#"{"explanation":"Trust me (anaphylaxis#made-up-1) and (anaphylaxis#made-up-2).","verdict":"correct"}"#;
    let store = seeded_store().await;
    let (pipeline, _) = pipeline_with(store, vec![Ok(reply.to_string())]);

    let bundle = pipeline
        .composer()
        .explain(&request("epinephrine dose for anaphylaxis"))
        .await
        .unwrap();

    assert_fallback_invariants(&bundle);
    assert_eq!(bundle.risk_flags[0], "insufficient_evidence");
}

#[tokio::test]
async fn test_every_fallback_reason_satisfies_the_invariant() {
    // model transport failure
    let store = seeded_store().await;
    let (pipeline, _) = pipeline_with(store, vec![Err(PipelineError::model("down"))]);
    let bundle = pipeline.composer().explain(&request("epi?")).await.unwrap();
    assert_fallback_invariants(&bundle);
    assert_eq!(bundle.risk_flags[0], "model_error");

    // unparseable model output
    let store = seeded_store().await;
    let (pipeline, _) = pipeline_with(store, vec![Ok("not json at all".to_string())]);
    let bundle = pipeline.composer().explain(&request("epi?")).await.unwrap();
    assert_fallback_invariants(&bundle);
    assert_eq!(bundle.risk_flags[0], "validation_error");

    // empty retrieval
    let (pipeline, model) = pipeline_with(Arc::new(MemoryStore::new()), Vec::new());
    let bundle = pipeline.composer().explain(&request("epi?")).await.unwrap();
    assert_fallback_invariants(&bundle);
    assert_eq!(bundle.risk_flags[0], "insufficient_evidence");
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_rate_limit_surfaces_from_explain() {
    let store = seeded_store().await;

    let mut config = Config::default();
    config.security.rate_limit_max = 1;

    let model = Arc::new(ScriptedModel::new(Vec::new()));
    let pipeline =
        Pipeline::assemble(store.clone(), store.clone(), store, model, &config).unwrap();

    // First call consumes the budget (and falls back, scripts exhausted)
    let first = pipeline.composer().explain(&request("epi?")).await.unwrap();
    assert!(first.fallback);

    let err = pipeline
        .composer()
        .explain(&request("epi?"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::RateLimited(_)));
}

#[tokio::test]
async fn test_dose_through_assembled_pipeline() {
    use evidence_harness::models::{
        DoseQuery, DrugDosePayload, RulePayload, RuleRecord,
    };
    use evidence_harness::store::RuleStore;

    let store = seeded_store().await;
    store
        .upsert_rule(&RuleRecord {
            id: "epi-dose".to_string(),
            case_id: "general".to_string(),
            version: 1,
            checksum: String::new(),
            payload: RulePayload::DrugDose(DrugDosePayload {
                drug: "epinephrine".to_string(),
                unit: "mg".to_string(),
                route: "IM".to_string(),
                mg_per_kg_min: 0.01,
                mg_per_kg_max: 0.01,
                max_dose: 0.5,
                weight_bands: Vec::new(),
            }),
        })
        .await
        .unwrap();

    let (pipeline, _) = pipeline_with(store, Vec::new());

    let response = pipeline
        .rules()
        .dose(
            "learner-1",
            &DoseQuery {
                drug: "epinephrine".to_string(),
                weight_kg: 20.0,
                age_months: None,
                case_id: Some("anaphylaxis".to_string()),
            },
        )
        .await
        .unwrap();

    assert!((response.dose - 0.2).abs() < 1e-9);
    assert_eq!(response.unit, "mg");
    assert!(response.warnings.is_empty());
}
