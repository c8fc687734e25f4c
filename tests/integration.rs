use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn evh_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("evh");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    // Create config
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    // Case bundle with passages and rules for the anaphylaxis scenario
    let cases_dir = root.join("cases");
    fs::create_dir_all(&cases_dir).unwrap();
    fs::write(
        cases_dir.join("anaphylaxis.json"),
        r#"{
  "passages": [
    {
      "id": "epi-first",
      "caseId": "anaphylaxis",
      "stage": 1,
      "section": "critical_actions",
      "tags": ["critical_actions", "airway"],
      "body": "Give IM epinephrine without delay. Then reassess the airway and breathing.",
      "sourceCitation": "PALS 2020",
      "license": "CC-BY-4.0"
    },
    {
      "id": "iv-pitfall",
      "caseId": "anaphylaxis",
      "stage": 1,
      "section": "pitfalls",
      "tags": ["pitfall"],
      "body": "Avoid delaying epinephrine while waiting for IV access. This is a known risk.",
      "sourceCitation": "PALS 2020",
      "license": "CC-BY-4.0"
    },
    {
      "id": "objectives-1",
      "caseId": "anaphylaxis",
      "stage": 1,
      "section": "objectives",
      "tags": ["objectives"],
      "body": "Objective: recognize anaphylaxis early and deliver epinephrine in stage 1.",
      "sourceCitation": "PALS 2020",
      "license": "CC-BY-4.0"
    },
    {
      "caseId": "anaphylaxis",
      "stage": 2,
      "section": "debrief",
      "tags": [],
      "body": "Discuss the timing of the first epinephrine dose with the learner.",
      "sourceCitation": "PALS 2020",
      "license": "CC-BY-4.0"
    }
  ],
  "rules": [
    {
      "id": "epi-dose",
      "caseId": "general",
      "version": 1,
      "payload": {
        "kind": "drug_dose",
        "drug": "epinephrine",
        "unit": "mg",
        "route": "IM",
        "mgPerKgMin": 0.01,
        "mgPerKgMax": 0.01,
        "maxDose": 0.5,
        "weightBands": []
      }
    },
    {
      "id": "anaphylaxis-steps",
      "caseId": "anaphylaxis",
      "version": 1,
      "payload": {
        "kind": "algo_steps",
        "steps": [
          { "order": 1, "action": "Administer IM epinephrine", "appliesIf": [] },
          {
            "order": 2,
            "action": "Start high-flow oxygen",
            "appliesIf": [{ "vital": "spo2", "max": 94.0 }]
          }
        ]
      }
    },
    {
      "id": "anaphylaxis-actions",
      "caseId": "anaphylaxis",
      "version": 1,
      "payload": {
        "kind": "critical_actions",
        "actions": [
          {
            "id": "give-epi",
            "stage": 1,
            "description": "Administer IM epinephrine",
            "required": true
          },
          {
            "id": "call-family",
            "stage": 1,
            "description": "Update the family",
            "required": false
          }
        ]
      }
    }
  ]
}"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/evh.sqlite"

[retrieval]
default_limit = 8
cache_ttl_secs = 300

[security]
rate_limit_max = 100
rate_limit_window_secs = 60

[model]
provider = "disabled"

[evidence]
enabled = false

[server]
bind = "127.0.0.1:7878"
"#,
        root.display()
    );

    let config_path = config_dir.join("evh.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_evh(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = evh_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run evh binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn seed_case(config_path: &Path, tmp: &TempDir) {
    let bundle = tmp.path().join("cases").join("anaphylaxis.json");
    let (stdout, stderr, success) = run_evh(config_path, &["seed", bundle.to_str().unwrap()]);
    assert!(success, "seed failed: stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_evh(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("evh.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_evh(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_evh(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_seed_reports_counts() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    let bundle = tmp.path().join("cases").join("anaphylaxis.json");
    let (stdout, stderr, success) = run_evh(&config_path, &["seed", bundle.to_str().unwrap()]);
    assert!(success, "seed failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("passages: 4 inserted, 0 skipped"));
    assert!(stdout.contains("rules:    3 upserted"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_seed_idempotent_no_duplicates() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    let bundle = tmp.path().join("cases").join("anaphylaxis.json");
    run_evh(&config_path, &["seed", bundle.to_str().unwrap()]);

    // Passages with authored ids dedup on content hash; the id-less
    // passage gets a fresh uuid but the same hash, so it is skipped too
    let (stdout, _, success) = run_evh(&config_path, &["seed", bundle.to_str().unwrap()]);
    assert!(success);
    assert!(
        stdout.contains("passages: 0 inserted, 4 skipped"),
        "Expected all passages skipped on re-seed, got: {}",
        stdout
    );
}

#[test]
fn test_seed_missing_file_errors() {
    let (_tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    let (_, stderr, success) = run_evh(&config_path, &["seed", "no-such-bundle.json"]);
    assert!(!success, "Seeding a missing file should fail");
    assert!(stderr.contains("no-such-bundle.json"));
}

#[test]
fn test_retrieve_ranks_by_combined_score() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    let (stdout, stderr, success) = run_evh(
        &config_path,
        &["retrieve", "epinephrine airway", "--case", "anaphylaxis"],
    );
    assert!(
        success,
        "retrieve failed: stdout={}, stderr={}",
        stdout, stderr
    );
    // The critical_actions passage carries the top tag priority and both
    // query terms, so it must rank first
    let first_line = stdout.lines().next().unwrap_or_default();
    assert!(
        first_line.contains("critical_actions"),
        "Expected critical_actions passage first, got: {}",
        stdout
    );
    assert!(stdout.contains("id: epi-first"));
}

#[test]
fn test_retrieve_deterministic() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    let (stdout1, _, _) = run_evh(&config_path, &["retrieve", "epinephrine"]);
    let (stdout2, _, _) = run_evh(&config_path, &["retrieve", "epinephrine"]);
    assert_eq!(
        stdout1, stdout2,
        "Retrieval output should be deterministic across runs"
    );
}

#[test]
fn test_retrieve_empty_query() {
    let (_tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    let (stdout, _, success) = run_evh(&config_path, &["retrieve", ""]);
    assert!(success, "Empty query should not panic");
    assert!(stdout.contains("No results"));
}

#[test]
fn test_retrieve_no_matching_case() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    let (stdout, _, success) = run_evh(
        &config_path,
        &["retrieve", "epinephrine", "--case", "sepsis"],
    );
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_retrieve_stage_and_section_filters() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    let (stdout, _, success) = run_evh(
        &config_path,
        &[
            "retrieve",
            "epinephrine",
            "--case",
            "anaphylaxis",
            "--stage",
            "2",
            "--section",
            "debrief",
        ],
    );
    assert!(success);
    assert!(stdout.contains("anaphylaxis / debrief (stage 2)"));
    assert!(!stdout.contains("id: epi-first"));
}

#[test]
fn test_retrieve_unknown_section_errors() {
    let (_tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    let (_, stderr, success) = run_evh(
        &config_path,
        &["retrieve", "epinephrine", "--section", "grand_rounds"],
    );
    assert!(!success, "Unknown section should fail");
    assert!(stderr.contains("unknown section"));
}

#[test]
fn test_dose_from_seeded_rule() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    let (stdout, stderr, success) = run_evh(
        &config_path,
        &["dose", "epinephrine", "--weight-kg", "20"],
    );
    assert!(success, "dose failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("dose:    0.2 mg"));
    assert!(stdout.contains("route:   IM"));
    assert!(stdout.contains("rule:    epi-dose v1"));
}

#[test]
fn test_dose_caps_at_max_with_warning() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    let (stdout, _, success) = run_evh(
        &config_path,
        &["dose", "Epinephrine", "--weight-kg", "80"],
    );
    assert!(success);
    assert!(stdout.contains("dose:    0.5 mg"));
    assert!(stdout.contains("warning:"));
    assert!(stdout.contains("capped"));
}

#[test]
fn test_dose_unknown_drug_errors() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    let (_, stderr, success) = run_evh(
        &config_path,
        &["dose", "unobtainium", "--weight-kg", "20"],
    );
    assert!(!success, "Unknown drug should fail");
    assert!(stderr.contains("no dosing rule"));
}

#[test]
fn test_algo_steps_and_stage_gate() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    // spo2 is low, so the oxygen step applies; the required action is
    // still outstanding, so the stage holds
    let (stdout, stderr, success) = run_evh(
        &config_path,
        &[
            "algo",
            "anaphylaxis",
            "--stage",
            "1",
            "--vital",
            "spo2=91",
        ],
    );
    assert!(success, "algo failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("1. Administer IM epinephrine"));
    assert!(stdout.contains("2. Start high-flow oxygen"));
    assert!(stdout.contains("[required] give-epi"));
    assert!(stdout.contains("next stage: 1"));

    // Completing the required action advances the stage
    let (stdout, _, success) = run_evh(
        &config_path,
        &[
            "algo",
            "anaphylaxis",
            "--stage",
            "1",
            "--vital",
            "spo2=91",
            "--done",
            "give-epi",
        ],
    );
    assert!(success);
    assert!(stdout.contains("next stage: 2"));
}

#[test]
fn test_algo_conditions_fail_without_vitals() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    let (stdout, _, success) = run_evh(&config_path, &["algo", "anaphylaxis", "--stage", "1"]);
    assert!(success);
    assert!(stdout.contains("1. Administer IM epinephrine"));
    assert!(
        !stdout.contains("Start high-flow oxygen"),
        "Conditioned step should be excluded when its vital is absent, got: {}",
        stdout
    );
}

#[test]
fn test_explain_without_model_returns_fallback_bundle() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    let (stdout, stderr, success) = run_evh(
        &config_path,
        &[
            "explain",
            "what is the first drug for anaphylaxis?",
            "--case",
            "anaphylaxis",
            "--stage",
            "1",
        ],
    );
    assert!(
        success,
        "explain failed: stdout={}, stderr={}",
        stdout, stderr
    );

    let bundle: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(bundle["fallback"], true);
    assert_eq!(bundle["evidenceSources"].as_array().unwrap().len(), 0);
    assert_eq!(bundle["riskFlags"][0], "model_error");
    assert!(bundle["explanation"]
        .as_str()
        .unwrap()
        .contains("could not be grounded"));
}

#[test]
fn test_explain_no_passages_is_insufficient_evidence() {
    let (_tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);

    let (stdout, _, success) = run_evh(
        &config_path,
        &["explain", "anything at all", "--case", "anaphylaxis"],
    );
    assert!(success);

    let bundle: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(bundle["fallback"], true);
    assert_eq!(bundle["riskFlags"][0], "insufficient_evidence");
}

#[test]
fn test_evidence_disabled_returns_no_results() {
    let (_tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    let (stdout, _, success) = run_evh(
        &config_path,
        &["evidence", "epinephrine", "--case-type", "anaphylaxis"],
    );
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_stats_shows_case_breakdown() {
    let (tmp, config_path) = setup_test_env();

    run_evh(&config_path, &["init"]);
    seed_case(&config_path, &tmp);

    let (stdout, stderr, success) = run_evh(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Passages:    4"));
    assert!(stdout.contains("anaphylaxis"));
    assert!(stdout.contains("general"));
}

#[test]
fn test_cache_stats_requires_running_server() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_evh(&config_path, &["cache", "stats"]);
    assert!(!success, "cache stats should fail without a server");
    assert!(stderr.contains("is the server running?"));
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, config_path) = setup_test_env();

    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}/data/evh.sqlite\"\n\n[model]\nprovider = \"oracle\"\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_evh(&config_path, &["init"]);
    assert!(!success, "Unknown model provider should fail validation");
    assert!(stderr.contains("Unknown model provider"));
}

#[test]
fn test_invalid_vital_argument_errors() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_evh(
        &config_path,
        &["algo", "anaphylaxis", "--stage", "1", "--vital", "hr"],
    );
    assert!(!success, "Malformed --vital should fail");
    assert!(stderr.contains("no '=' found"));
}
