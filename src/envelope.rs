//! Results envelope: run metadata, summary statistics and artifacts.
//!
//! Every run writes one envelope, aborted or not. The envelope records
//! whether the run was cut short and, when fail-fast triggered, the
//! fingerprint that caused it, so downstream comparison never mistakes an
//! aborted run for a clean one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::analysis::{analyze, CrossActivationReport, Finding};
use crate::error::Result;
use crate::matrix::{build_confusion_matrices, CaseResult, ConfusionMatrix};

/// Metadata for one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Unique run identifier.
    pub run_id: String,
    /// UTC start timestamp, RFC 3339.
    pub timestamp: String,
    /// Which eval produced this envelope.
    pub eval_type: String,
    /// Backend the run used.
    pub backend: String,
    /// Generation model identifier.
    pub model: String,
    /// Judge model used for fallback detection.
    pub judge_model: String,
    /// RNG seed recorded for reproducibility of case ordering.
    pub seed: u64,
    /// Total USD spend across the run.
    pub total_cost: f64,
    /// Total backend calls across the run.
    pub total_calls: u32,
    /// Whether the run was cut short by budget or fail-fast.
    pub aborted: bool,
    /// The repeating failure fingerprint, when fail-fast triggered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_fast_reason: Option<String>,
}

impl RunMetadata {
    /// Creates metadata for a run starting now.
    pub fn new(
        eval_type: impl Into<String>,
        backend: impl Into<String>,
        model: impl Into<String>,
        judge_model: impl Into<String>,
        seed: u64,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            eval_type: eval_type.into(),
            backend: backend.into(),
            model: model.into(),
            judge_model: judge_model.into(),
            seed,
            total_cost: 0.0,
            total_calls: 0,
            aborted: false,
            fail_fast_reason: None,
        }
    }
}

/// Mean, sample standard deviation, and sample count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub mean: f64,
    pub stddev: f64,
    pub n: usize,
}

/// Computes mean and sample standard deviation.
pub fn compute_stats(values: &[f64]) -> Stats {
    let n = values.len();
    if n == 0 {
        return Stats {
            mean: 0.0,
            stddev: 0.0,
            n: 0,
        };
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return Stats {
            mean,
            stddev: 0.0,
            n,
        };
    }
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    Stats {
        mean,
        stddev: variance.sqrt(),
        n,
    }
}

/// Per-group scalar summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub accuracy: f64,
    pub cross_activation_rate: f64,
    pub n: usize,
    pub accuracy_stats: Stats,
    pub cross_activation_stats: Stats,
    pub multi_activation_count: u32,
    pub no_activation_count: u32,
    pub total_cases: u32,
}

/// Negative-control summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegativeControlSummary {
    pub pass_rate: f64,
    pub passed: usize,
    pub failed: usize,
    pub n: usize,
}

/// Summary section of the envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub groups: BTreeMap<String, GroupSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_controls: Option<NegativeControlSummary>,
}

/// Serialized analysis structures carried alongside the raw cases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifacts {
    pub confusion_matrices: BTreeMap<String, ConfusionMatrix>,
    pub cross_activation_rates: BTreeMap<String, CrossActivationReport>,
    pub findings: Vec<Finding>,
    pub domain_groups: BTreeMap<String, Vec<String>>,
}

/// The full results envelope written at the end of every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsEnvelope {
    pub meta: RunMetadata,
    pub summary: Summary,
    pub cases: Vec<CaseResult>,
    pub artifacts: Artifacts,
}

impl ResultsEnvelope {
    /// Writes the envelope to `<dir>/<eval_type>_<run_id>.json`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let filename = format!("{}_{}.json", self.meta.eval_type, self.meta.run_id);
        let path = dir.join(filename);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

/// Builds per-group summaries from confusion case results.
///
/// With multiple run iterations, accuracy and cross-activation stats are
/// computed across per-run values; a single run reports its point values
/// with `n = 1`.
pub fn build_group_summaries(
    results: &[CaseResult],
    matrices: &BTreeMap<String, ConfusionMatrix>,
    reports: &BTreeMap<String, CrossActivationReport>,
    group_axes: &BTreeMap<String, Vec<String>>,
    runs: u32,
) -> BTreeMap<String, GroupSummary> {
    let mut group_names: Vec<String> = results
        .iter()
        .filter_map(|r| r.group.clone())
        .collect();
    group_names.sort();
    group_names.dedup();

    let mut summaries = BTreeMap::new();
    for group_name in group_names {
        let group_results: Vec<&CaseResult> = results
            .iter()
            .filter(|r| r.group.as_deref() == Some(group_name.as_str()))
            .collect();

        let (accuracy_stats, cross_stats) = if runs > 1 {
            let mut run_accuracies = Vec::new();
            let mut run_cross_rates = Vec::new();
            for run_idx in 0..runs {
                let run_cases: Vec<CaseResult> = group_results
                    .iter()
                    .filter(|r| r.run_index == run_idx)
                    .map(|r| (*r).clone())
                    .collect();
                if run_cases.is_empty() {
                    continue;
                }
                let passed = run_cases.iter().filter(|r| r.passed).count();
                run_accuracies.push(passed as f64 / run_cases.len() as f64);

                let run_matrices = build_confusion_matrices(&run_cases, group_axes);
                let run_reports = analyze(&run_matrices);
                if let Some(report) = run_reports.get(&group_name) {
                    run_cross_rates.push(report.cross_activation_rate);
                }
            }
            (compute_stats(&run_accuracies), compute_stats(&run_cross_rates))
        } else {
            let passed = group_results.iter().filter(|r| r.passed).count();
            let accuracy = if group_results.is_empty() {
                0.0
            } else {
                passed as f64 / group_results.len() as f64
            };
            let cross = reports
                .get(&group_name)
                .map(|r| r.cross_activation_rate)
                .unwrap_or(0.0);
            (
                Stats {
                    mean: accuracy,
                    stddev: 0.0,
                    n: 1,
                },
                Stats {
                    mean: cross,
                    stddev: 0.0,
                    n: 1,
                },
            )
        };

        let matrix = matrices.get(&group_name);
        summaries.insert(
            group_name.clone(),
            GroupSummary {
                accuracy: accuracy_stats.mean,
                cross_activation_rate: cross_stats.mean,
                n: group_results.len(),
                accuracy_stats,
                cross_activation_stats: cross_stats,
                multi_activation_count: matrix.map(|m| m.multi_activation_count).unwrap_or(0),
                no_activation_count: matrix.map(|m| m.no_activation_count).unwrap_or(0),
                total_cases: matrix.map(|m| m.total_cases).unwrap_or(0),
            },
        );
    }

    summaries
}

/// Builds the negative-control summary, if any controls ran.
pub fn build_negative_summary(negative_results: &[CaseResult]) -> Option<NegativeControlSummary> {
    if negative_results.is_empty() {
        return None;
    }
    let n = negative_results.len();
    let passed = negative_results.iter().filter(|r| r.passed).count();
    Some(NegativeControlSummary {
        pass_rate: (passed as f64 / n as f64 * 10_000.0).round() / 10_000.0,
        passed,
        failed: n - passed,
        n,
    })
}
