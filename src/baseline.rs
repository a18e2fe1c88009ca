//! Baseline comparison for regression detection.
//!
//! The comparison mode is explicit and named, never inferred from which
//! optional file happens to exist on disk: `AgainstBaseline` refuses to
//! run without a stored baseline, and `StaticExpectation` scores the
//! current envelope against fixed expectations instead.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::envelope::ResultsEnvelope;
use crate::error::{Error, Result};

/// How regressions are judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMode {
    /// Compare the current envelope against a stored baseline envelope.
    AgainstBaseline,
    /// Compare the current envelope against static expectations only.
    StaticExpectation,
}

/// Thresholds governing what counts as a regression.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareThresholds {
    /// Groups with fewer cases than this are not compared.
    pub min_cases_before_compare: usize,
    /// Accuracy drop that counts as a regression.
    pub mean_drop_threshold: f64,
    /// The drop must also exceed this many baseline stddevs.
    pub stddev_multiplier: f64,
    /// Static mode: minimum acceptable group accuracy.
    pub static_min_accuracy: f64,
    /// Static mode: maximum acceptable cross-activation rate.
    pub static_max_cross_activation: f64,
}

impl Default for CompareThresholds {
    fn default() -> Self {
        Self {
            min_cases_before_compare: 3,
            mean_drop_threshold: 0.05,
            stddev_multiplier: 2.0,
            static_min_accuracy: 0.7,
            static_max_cross_activation: 0.25,
        }
    }
}

/// Finds and loads the most recent results file for an eval type.
pub fn load_latest_result(results_dir: &Path, eval_type: &str) -> Result<Option<ResultsEnvelope>> {
    if !results_dir.is_dir() {
        return Ok(None);
    }
    let prefix = format!("{}_", eval_type);
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(results_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("json")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
        })
        .collect();
    candidates.sort_by_key(|p| {
        p.metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });

    let Some(latest) = candidates.pop() else {
        return Ok(None);
    };
    let content = std::fs::read_to_string(latest)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Loads the stored baseline envelope for an eval type.
pub fn load_baseline(baselines_dir: &Path, eval_type: &str) -> Result<Option<ResultsEnvelope>> {
    let path = baselines_dir.join(format!("{}_baseline.json", eval_type));
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Compares a results envelope under the given mode.
///
/// Returns human-readable regression lines; an empty list means no
/// regressions were detected. `AgainstBaseline` with no baseline supplied
/// is a configuration error, not a silent mode switch.
pub fn compare(
    current: &ResultsEnvelope,
    baseline: Option<&ResultsEnvelope>,
    mode: ComparisonMode,
    thresholds: &CompareThresholds,
) -> Result<Vec<String>> {
    let mut findings = Vec::new();

    if current.meta.aborted {
        findings.push(format!(
            "NOTE: current run {} was aborted ({}); comparison covers a partial run",
            current.meta.run_id,
            current
                .meta
                .fail_fast_reason
                .as_deref()
                .unwrap_or("budget exhausted")
        ));
    }

    match mode {
        ComparisonMode::AgainstBaseline => {
            let baseline = baseline.ok_or_else(|| {
                Error::Config(
                    "comparison mode 'against_baseline' requires a baseline envelope".to_string(),
                )
            })?;
            compare_against_baseline(current, baseline, thresholds, &mut findings);
        }
        ComparisonMode::StaticExpectation => {
            compare_static(current, thresholds, &mut findings);
        }
    }

    Ok(findings)
}

fn compare_against_baseline(
    current: &ResultsEnvelope,
    baseline: &ResultsEnvelope,
    thresholds: &CompareThresholds,
    findings: &mut Vec<String>,
) {
    for (group, summary) in &current.summary.groups {
        let Some(base) = baseline.summary.groups.get(group) else {
            findings.push(format!("NEW: {} (no baseline, not a regression)", group));
            continue;
        };
        if summary.n < thresholds.min_cases_before_compare
            || base.n < thresholds.min_cases_before_compare
        {
            continue;
        }

        let drop = base.accuracy - summary.accuracy;
        let stddev_bar = thresholds.stddev_multiplier * base.accuracy_stats.stddev;
        if drop > thresholds.mean_drop_threshold && drop > stddev_bar {
            findings.push(format!(
                "REGRESSION: {} accuracy dropped {:.2} -> {:.2} (drop={:.2}, threshold={:.2}, {}x stddev={:.2})",
                group,
                base.accuracy,
                summary.accuracy,
                drop,
                thresholds.mean_drop_threshold,
                thresholds.stddev_multiplier,
                stddev_bar
            ));
        }

        let cross_rise = summary.cross_activation_rate - base.cross_activation_rate;
        if cross_rise > thresholds.mean_drop_threshold {
            findings.push(format!(
                "REGRESSION: {} cross-activation rose {:.2} -> {:.2}",
                group, base.cross_activation_rate, summary.cross_activation_rate
            ));
        }
    }
}

fn compare_static(
    current: &ResultsEnvelope,
    thresholds: &CompareThresholds,
    findings: &mut Vec<String>,
) {
    for (group, summary) in &current.summary.groups {
        if summary.n < thresholds.min_cases_before_compare {
            continue;
        }
        if summary.accuracy < thresholds.static_min_accuracy {
            findings.push(format!(
                "BELOW EXPECTATION: {} accuracy {:.2} under static minimum {:.2}",
                group, summary.accuracy, thresholds.static_min_accuracy
            ));
        }
        if summary.cross_activation_rate > thresholds.static_max_cross_activation {
            findings.push(format!(
                "BELOW EXPECTATION: {} cross-activation {:.2} over static maximum {:.2}",
                group, summary.cross_activation_rate, thresholds.static_max_cross_activation
            ));
        }
    }
}
