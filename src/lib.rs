//! Routing Eval - offline evaluation harness for CLI-based skill routing.
//!
//! This library measures how reliably a skill selector built on top of
//! third-party CLI model tools picks the correct handler for a request:
//! it probes each backend's transport capabilities, invokes it with
//! budget-gated retries and fail-fast outage detection, and turns the
//! accumulated classification outcomes into per-group confusion matrices
//! and cross-activation reports.

pub mod analysis;
pub mod backend;
pub mod baseline;
pub mod config;
pub mod dataset;
pub mod detect;
pub mod envelope;
pub mod error;
pub mod failfast;
pub mod harness;
pub mod invoke;
pub mod matrix;
pub mod probe;
pub mod retry;

pub use error::{Error, Result, RetryError};

pub use analysis::{
    analyze, generate_findings, CrossActivationReport, Finding, FindingKind,
    FlaggedCrossActivation, Severity, CROSS_ACTIVATION_FLAG_THRESHOLD,
};
pub use backend::{Backend, BackendKind, TransportMode, KNOWN_BACKENDS};
pub use baseline::{compare, load_baseline, load_latest_result, CompareThresholds, ComparisonMode};
pub use config::{EvalConfig, Validate, ValidationResult};
pub use dataset::{load_cases, DomainGroups, EvalCase, LoadedCases, SkillEntry};
pub use detect::{
    classify, detect_activation_fallback, detect_skills_structured, extract_json, Classification,
    DetectionMethod,
};
pub use envelope::{
    build_group_summaries, build_negative_summary, compute_stats, Artifacts, GroupSummary,
    ResultsEnvelope, RunMetadata, Stats, Summary,
};
pub use failfast::{ConsecutiveFailureTracker, FailureFingerprint};
pub use harness::{EvalHarness, RunOptions, RunOutcome};
pub use invoke::{CostModel, InvocationResult, Invoker, ModelInvoker, ARG_TRANSPORT_MAX_BYTES};
pub use matrix::{build_confusion_matrices, CaseResult, ConfusionMatrix};
pub use probe::{locate_executable, Capability, CapabilityProber};
pub use retry::{run_with_retry, Budget, CallAccounting, RetryPolicy};
