//! Configuration loading and validation tests.

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use rstest::rstest;
use tagpilot_core::{
    config, ApplicationsApi, ConfigError, RunMode, SchedulePolicy, SigningMethod, UpdaterConfig,
};

// ---------------------------------------------------------------------------
// 1. Load
// ---------------------------------------------------------------------------

#[test]
fn load_missing_file_returns_not_found() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let path = dir.path().join("tagpilot.yaml");
    let err = config::load_at(&path).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("tagpilot.yaml"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let file = dir.child("tagpilot.yaml");
    file.write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = config::load_at(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("tagpilot.yaml"));
}

#[test]
fn load_full_document() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let file = dir.child("tagpilot.yaml");
    file.write_str(
        r#"
mode: continuous
check_interval_secs: 30
max_concurrency: 0
schedule: fail-first
cooldown_secs: 300
per_repo_cap: 2
warm_up: true
applications_api: argocd
label_selector: team=payments
app_name_patterns: ["pay-*", "billing"]
git:
  user: bot
  email: bot@example.com
  signing_method: ssh
  signing_key: /keys/id_ed25519
  sign_off: true
  max_batch: 5
  flush_every_ms: 500
"#,
    )
    .expect("write");
    file.assert(predicate::path::exists());

    let cfg = config::load_at(file.path()).expect("load");
    assert_eq!(cfg.mode, RunMode::Continuous);
    assert_eq!(cfg.check_interval().as_secs(), 30);
    assert_eq!(cfg.concurrency(), None);
    assert_eq!(cfg.schedule, SchedulePolicy::FailFirst);
    assert_eq!(cfg.cooldown().as_secs(), 300);
    assert_eq!(cfg.per_repo_cap, 2);
    assert!(cfg.warm_up);
    assert_eq!(cfg.api_kind().expect("api"), ApplicationsApi::Argocd);
    assert_eq!(cfg.app_name_patterns, vec!["pay-*", "billing"]);
    assert_eq!(cfg.git.signing_method, SigningMethod::Ssh);
    assert!(cfg.git.sign_off);
    assert_eq!(cfg.git.max_batch, 5);
    assert_eq!(cfg.git.flush_every().map(|d| d.as_millis()), Some(500));
    assert_eq!(cfg.git.queue_depth, 64);
}

#[test]
fn empty_mapping_uses_defaults() {
    let cfg = UpdaterConfig::from_yaml_str("{}").expect("parse");
    assert_eq!(cfg, UpdaterConfig::default());
    assert_eq!(cfg.mode, RunMode::Cycle);
    assert_eq!(cfg.check_interval_secs, 120);
    assert_eq!(cfg.concurrency(), Some(10));
    assert_eq!(cfg.git.max_batch, 10);
    assert_eq!(cfg.git.flush_every_ms, 2000);
}

// ---------------------------------------------------------------------------
// 2. Validation
// ---------------------------------------------------------------------------

#[test]
fn negative_concurrency_is_rejected() {
    let err = UpdaterConfig::from_yaml_str("max_concurrency: -1").unwrap_err();
    assert!(matches!(err, ConfigError::NegativeConcurrency(-1)), "got: {err}");
}

#[test]
fn unknown_api_kind_is_rejected() {
    let err = UpdaterConfig::from_yaml_str("applications_api: nomad").unwrap_err();
    assert!(matches!(err, ConfigError::UnsupportedApiKind(ref k) if k == "nomad"), "got: {err}");
}

#[rstest]
#[case("git: { max_batch: 0 }")]
#[case("git: { queue_depth: 0 }")]
#[case("git: { max_batch: 4, flush_every_ms: 0 }")]
fn invalid_batching_is_rejected(#[case] yaml: &str) {
    let err = UpdaterConfig::from_yaml_str(yaml).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidBatching(_)), "got: {err}");
}

#[test]
fn timerless_single_intent_batches_are_allowed() {
    let cfg = UpdaterConfig::from_yaml_str("git: { max_batch: 1, flush_every_ms: 0 }").expect("parse");
    assert_eq!(cfg.git.flush_every(), None);
}

#[rstest]
#[case("default", SchedulePolicy::Default)]
#[case("lru", SchedulePolicy::Lru)]
#[case("fail-first", SchedulePolicy::FailFirst)]
#[case("failfirst", SchedulePolicy::FailFirst)]
fn schedule_policy_names(#[case] name: &str, #[case] expected: SchedulePolicy) {
    let cfg = UpdaterConfig::from_yaml_str(&format!("schedule: {name}")).expect("parse");
    assert_eq!(cfg.schedule, expected);
}
