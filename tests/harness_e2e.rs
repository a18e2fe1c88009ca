//! End-to-end harness test against a stub backend.
//!
//! Builds a dataset and group declarations on disk, probes a stub CLI,
//! runs the full evaluation loop, and checks the written envelope.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use routing_eval::backend::{Backend, BackendKind};
use routing_eval::config::{BackendName, EvalConfig};
use routing_eval::dataset::{load_cases, DomainGroups};
use routing_eval::detect::Classification;
use routing_eval::envelope::ResultsEnvelope;
use routing_eval::harness::{EvalHarness, RunOptions};
use routing_eval::invoke::ModelInvoker;
use routing_eval::probe::CapabilityProber;

fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).expect("failed to write stub");
    let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("failed to chmod stub");
    path
}

/// Routes by marker tokens planted in the user prompts; markers never
/// appear in the routing index, so matching is unambiguous.
const ROUTER_STUB: &str = r#"#!/bin/sh
last=""
for arg in "$@"; do
  last="$arg"
done
if [ "$last" = "-p" ]; then
  last=$(cat)
fi
case "$last" in
  *CAPROBE_OK*) printf 'CAPROBE_OK' ;;
  *ROUTE_TO_XUNIT*) printf '%s' '{"skills": ["xunit"], "reasoning": "unit test work"}' ;;
  *ROUTE_TO_INTEGRATION*) printf '%s' '{"skills": ["integration"], "reasoning": "integration work"}' ;;
  *) printf '%s' '{"skills": [], "reasoning": "nothing fits"}' ;;
esac
"#;

const GROUPS_YAML: &str = r#"
groups:
  testing:
    - id: xunit
      description: Unit testing with xUnit
    - id: integration
      description: End-to-end integration testing patterns
"#;

fn write_dataset(dir: &Path) {
    std::fs::write(
        dir.join("confusion_matrix.jsonl"),
        concat!(
            r#"{"id":"t1","group":"testing","user_prompt":"ROUTE_TO_XUNIT please","expected_skill":"xunit"}"#,
            "\n",
            r#"{"id":"t2","group":"testing","user_prompt":"ROUTE_TO_INTEGRATION please","expected_skill":"xunit"}"#,
            "\n",
            r#"{"id":"t3","group":"testing","user_prompt":"ROUTE_TO_INTEGRATION again","expected_skill":"integration"}"#,
            "\n",
        ),
    )
    .unwrap();
    std::fs::write(
        dir.join("negative_controls.jsonl"),
        concat!(
            r#"{"id":"n1","user_prompt":"what is the weather like","should_activate":false,"category":"off_topic"}"#,
            "\n",
        ),
    )
    .unwrap();
}

async fn stub_harness(stub_dir: &Path) -> EvalHarness {
    let stub = write_stub(stub_dir, "stub-router", ROUTER_STUB);

    let mut config = EvalConfig::default();
    config.backend = BackendName("claude".to_string());
    config.retry.backoff_jitter = 0.0;

    let groups: DomainGroups = serde_yaml::from_str(GROUPS_YAML).unwrap();

    let backend = Backend::new(BackendKind::Claude).with_cli_path(stub.to_string_lossy());
    let mut prober = CapabilityProber::new(Duration::from_secs(10));
    let capability = prober.probe(&backend).await.unwrap();

    let invoker = ModelInvoker::new(backend.clone(), capability, Duration::from_secs(10));
    let judge = ModelInvoker::new(backend, capability, Duration::from_secs(10));

    EvalHarness::with_invokers(config, groups, Box::new(invoker), Box::new(judge))
}

#[tokio::test]
async fn full_run_produces_matrix_and_envelope() {
    let stub_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    write_dataset(data_dir.path());

    let loaded = load_cases(data_dir.path(), None).unwrap();
    assert_eq!(loaded.confusion.len(), 3);
    assert_eq!(loaded.negative.len(), 1);

    let mut harness = stub_harness(stub_dir.path()).await;
    let options = RunOptions {
        output_dir: Some(out_dir.path().to_path_buf()),
        ..RunOptions::default()
    };
    let outcome = harness
        .run(&loaded.confusion, &loaded.negative, &options)
        .await
        .unwrap();

    assert!(!outcome.aborted);
    // Three confusion cases plus one negative control, one call each.
    assert_eq!(outcome.total_calls, 4);

    let matrix = &outcome.envelope.artifacts.confusion_matrices["testing"];
    assert_eq!(matrix.count("xunit", "xunit"), 1);
    assert_eq!(matrix.count("xunit", "integration"), 1);
    assert_eq!(matrix.count("integration", "integration"), 1);
    assert_eq!(matrix.out_of_group_count, 0);
    assert_eq!(matrix.total_cases, 3);

    // xunit -> integration at 50% is above the 20% flag threshold.
    let report = &outcome.envelope.artifacts.cross_activation_rates["testing"];
    assert_eq!(report.per_skill_cross_activation["xunit"], 0.5);
    assert_eq!(report.flagged_cross_activations.len(), 1);
    assert_eq!(report.flagged_cross_activations[0].predicted, "integration");

    // The negative control returned an empty selection and passed.
    let negative_summary = outcome.envelope.summary.negative_controls.as_ref().unwrap();
    assert_eq!(negative_summary.passed, 1);
    assert_eq!(negative_summary.failed, 0);

    // The envelope on disk re-parses to identical analysis structures.
    let reparsed: ResultsEnvelope =
        serde_json::from_str(&std::fs::read_to_string(&outcome.output_path).unwrap()).unwrap();
    assert_eq!(
        reparsed.artifacts.confusion_matrices,
        outcome.envelope.artifacts.confusion_matrices
    );
    assert_eq!(
        reparsed.artifacts.cross_activation_rates,
        outcome.envelope.artifacts.cross_activation_rates
    );
    assert_eq!(reparsed.cases.len(), 4);
}

#[tokio::test]
async fn run_scores_expected_and_alternate_handlers() {
    let stub_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();

    let mut harness = stub_harness(stub_dir.path()).await;

    let cases = vec![
        routing_eval::EvalCase {
            id: "exact".to_string(),
            group: Some("testing".to_string()),
            user_prompt: "ROUTE_TO_XUNIT".to_string(),
            expected_skill: "xunit".to_string(),
            acceptable_skills: vec![],
            should_activate: true,
            category: None,
        },
        routing_eval::EvalCase {
            id: "alternate".to_string(),
            group: Some("testing".to_string()),
            user_prompt: "ROUTE_TO_INTEGRATION".to_string(),
            expected_skill: "xunit".to_string(),
            acceptable_skills: vec!["integration".to_string()],
            should_activate: true,
            category: None,
        },
        routing_eval::EvalCase {
            id: "none".to_string(),
            group: Some("testing".to_string()),
            user_prompt: "nothing relevant".to_string(),
            expected_skill: "xunit".to_string(),
            acceptable_skills: vec![],
            should_activate: true,
            category: None,
        },
    ];

    let options = RunOptions {
        output_dir: Some(out_dir.path().to_path_buf()),
        ..RunOptions::default()
    };
    let outcome = harness.run(&cases, &[], &options).await.unwrap();

    let by_id = |id: &str| {
        outcome
            .envelope
            .cases
            .iter()
            .find(|c| c.id == id)
            .unwrap()
    };

    assert!(by_id("exact").passed);
    assert!(by_id("alternate").passed);
    let none = by_id("none");
    assert!(!none.passed);
    assert_eq!(none.classification, Some(Classification::NoActivation));
}
