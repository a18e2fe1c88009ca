//! Cross-activation analysis over confusion matrices.
//!
//! Derives per-group and per-handler error rates, flags handler pairs the
//! model systematically confuses, and detects handlers with chronically
//! low discriminative power.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::detect::Classification;
use crate::matrix::{CaseResult, ConfusionMatrix};

/// Absolute share of a row above which an off-diagonal cell is flagged.
pub const CROSS_ACTIVATION_FLAG_THRESHOLD: f64 = 0.20;

/// Multi/no-activation rate above which a group is called out.
const ACTIVATION_RATE_THRESHOLD: f64 = 0.20;

/// Index-violation rate above which the finding escalates to a warning.
const INDEX_VIOLATION_WARN_THRESHOLD: f64 = 0.10;

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// One handler pair whose confusion rate crossed the flag threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedCrossActivation {
    /// The handler the case expected.
    pub expected: String,
    /// The handler the model selected instead.
    pub predicted: String,
    /// Share of the expected handler's row.
    pub rate: f64,
    /// Raw cell count.
    pub count: u32,
    /// Row total.
    pub total: u32,
}

/// Derived error rates for one group. Recomputed each analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossActivationReport {
    /// Share of in-matrix predictions that went to the wrong handler.
    pub cross_activation_rate: f64,
    /// Share of predictions that left the declared index entirely.
    pub index_violation_rate: f64,
    /// Raw out-of-group prediction count.
    pub out_of_group_count: u32,
    /// Cross rate per expected handler (zero-total rows report 0.0).
    pub per_skill_cross_activation: BTreeMap<String, f64>,
    /// Flagged pairs, sorted descending by rate.
    pub flagged_cross_activations: Vec<FlaggedCrossActivation>,
    /// Handlers with two or more equal-or-stronger competitors.
    pub low_discrimination_skills: Vec<String>,
}

/// Computes cross-activation reports for every group's matrix.
pub fn analyze(
    matrices: &BTreeMap<String, ConfusionMatrix>,
) -> BTreeMap<String, CrossActivationReport> {
    let mut reports = BTreeMap::new();

    for (group_name, data) in matrices {
        let mut per_skill: BTreeMap<String, f64> = BTreeMap::new();
        let mut flagged: Vec<FlaggedCrossActivation> = Vec::new();
        let mut total_correct: u32 = 0;
        let mut total_incorrect: u32 = 0;

        for expected in &data.skills {
            let Some(row) = data.matrix.get(expected) else {
                continue;
            };
            let row_total: u32 = row.values().sum();
            if row_total == 0 {
                // Reported as 0.0, not omitted, so axes stay complete.
                per_skill.insert(expected.clone(), 0.0);
                continue;
            }

            let correct = row.get(expected).copied().unwrap_or(0);
            let incorrect = row_total - correct;
            total_correct += correct;
            total_incorrect += incorrect;
            per_skill.insert(expected.clone(), round4(incorrect as f64 / row_total as f64));

            for (predicted, &count) in row {
                if predicted == expected || count == 0 {
                    continue;
                }
                let pair_rate = count as f64 / row_total as f64;
                if pair_rate > CROSS_ACTIVATION_FLAG_THRESHOLD {
                    flagged.push(FlaggedCrossActivation {
                        expected: expected.clone(),
                        predicted: predicted.clone(),
                        rate: round4(pair_rate),
                        count,
                        total: row_total,
                    });
                }
            }
        }

        flagged.sort_by(|a, b| {
            b.rate
                .partial_cmp(&a.rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.expected.cmp(&b.expected))
                .then_with(|| a.predicted.cmp(&b.predicted))
        });

        let all_predictions = total_correct + total_incorrect;
        let cross_activation_rate = if all_predictions > 0 {
            round4(total_incorrect as f64 / all_predictions as f64)
        } else {
            0.0
        };

        // Low discrimination: 2+ other handlers drew counts equal to or
        // greater than the correct handler's own cell.
        let mut low_discrimination: Vec<String> = Vec::new();
        for expected in &data.skills {
            let Some(row) = data.matrix.get(expected) else {
                continue;
            };
            let correct = row.get(expected).copied().unwrap_or(0);
            let competitors = row
                .iter()
                .filter(|&(s, &c)| s != expected && c >= correct && c > 0)
                .count();
            if competitors >= 2 {
                low_discrimination.push(expected.clone());
            }
        }
        low_discrimination.sort();

        let out_of_group = data.out_of_group_count;
        let total_predictions = all_predictions + out_of_group;
        let index_violation_rate = if total_predictions > 0 {
            round4(out_of_group as f64 / total_predictions as f64)
        } else {
            0.0
        };

        reports.insert(
            group_name.clone(),
            CrossActivationReport {
                cross_activation_rate,
                index_violation_rate,
                out_of_group_count: out_of_group,
                per_skill_cross_activation: per_skill,
                flagged_cross_activations: flagged,
                low_discrimination_skills: low_discrimination,
            },
        );
    }

    reports
}

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

/// Finding taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    CrossActivation,
    LowDiscriminationSkill,
    LowDiscriminationPrompt,
    NeverActivated,
    HighMultiActivation,
    HighNoActivation,
    IndexViolation,
    NegativeControlFailure,
}

/// One structured finding emitted into the envelope artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub group: String,
    pub kind: FindingKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub example_case_ids: Vec<String>,
}

impl Finding {
    fn new(
        severity: Severity,
        group: &str,
        kind: FindingKind,
        description: String,
    ) -> Self {
        Self {
            severity,
            group: group.to_string(),
            kind,
            description,
            skill: None,
            expected: None,
            predicted: None,
            rate: None,
            example_case_ids: Vec::new(),
        }
    }
}

/// Generates the findings section from matrices and reports.
///
/// Findings are data, not presentation; the list may legitimately be
/// empty when every metric sits within thresholds.
pub fn generate_findings(
    matrices: &BTreeMap<String, ConfusionMatrix>,
    reports: &BTreeMap<String, CrossActivationReport>,
    case_results: &[CaseResult],
    negative_results: &[CaseResult],
) -> Vec<Finding> {
    let mut findings = Vec::new();

    // Flagged handler pairs, with up to three example case ids.
    for (group_name, report) in reports {
        for flag in &report.flagged_cross_activations {
            let example_ids: Vec<String> = case_results
                .iter()
                .filter(|r| {
                    r.group.as_deref() == Some(group_name.as_str())
                        && r.expected_skill == flag.expected
                        && r.classification == Some(Classification::SingleActivation)
                        && r.activated_skills.first() == Some(&flag.predicted)
                })
                .map(|r| r.id.clone())
                .take(3)
                .collect();

            let mut finding = Finding::new(
                Severity::Warning,
                group_name,
                FindingKind::CrossActivation,
                format!(
                    "High cross-activation in group '{}': expected '{}' but predicted '{}' at {:.0}% rate ({}/{} cases)",
                    group_name,
                    flag.expected,
                    flag.predicted,
                    flag.rate * 100.0,
                    flag.count,
                    flag.total
                ),
            );
            finding.expected = Some(flag.expected.clone());
            finding.predicted = Some(flag.predicted.clone());
            finding.rate = Some(flag.rate);
            finding.example_case_ids = example_ids;
            findings.push(finding);
        }
    }

    // Handler-level low discrimination.
    for (group_name, report) in reports {
        for skill in &report.low_discrimination_skills {
            let mut finding = Finding::new(
                Severity::Warning,
                group_name,
                FindingKind::LowDiscriminationSkill,
                format!(
                    "Low discrimination for '{}' in group '{}': 2+ other skills received equal or more activations",
                    skill, group_name
                ),
            );
            finding.skill = Some(skill.clone());
            findings.push(finding);
        }
    }

    // Prompt-level low discrimination: multi-activation cases.
    for result in case_results {
        if result.classification == Some(Classification::MultiActivation) {
            let group = result.group.as_deref().unwrap_or("unknown");
            let mut finding = Finding::new(
                Severity::Info,
                group,
                FindingKind::LowDiscriminationPrompt,
                format!(
                    "Low discrimination prompt '{}' in group '{}': expected '{}', got multiple activations: {:?}",
                    result.id, group, result.expected_skill, result.activated_skills
                ),
            );
            finding.skill = Some(result.expected_skill.clone());
            finding.example_case_ids = vec![result.id.clone()];
            findings.push(finding);
        }
    }

    // Handlers never predicted in any case of their group.
    for (group_name, data) in matrices {
        if data.total_cases == 0 {
            continue;
        }
        for skill in &data.skills {
            let column_sum: u32 = data
                .matrix
                .values()
                .map(|row| row.get(skill).copied().unwrap_or(0))
                .sum();
            if column_sum == 0 {
                let mut finding = Finding::new(
                    Severity::Info,
                    group_name,
                    FindingKind::NeverActivated,
                    format!(
                        "Skill '{}' was never predicted in group '{}' ({} cases)",
                        skill, group_name, data.total_cases
                    ),
                );
                finding.skill = Some(skill.clone());
                findings.push(finding);
            }
        }
    }

    // Elevated multi-activation and no-activation rates.
    for (group_name, data) in matrices {
        let total = data.total_cases;
        if total == 0 {
            continue;
        }
        let multi_rate = data.multi_activation_count as f64 / total as f64;
        if multi_rate > ACTIVATION_RATE_THRESHOLD {
            let mut finding = Finding::new(
                Severity::Info,
                group_name,
                FindingKind::HighMultiActivation,
                format!(
                    "High multi-activation rate in group '{}': {}/{} cases ({:.0}%)",
                    group_name,
                    data.multi_activation_count,
                    total,
                    multi_rate * 100.0
                ),
            );
            finding.rate = Some(round4(multi_rate));
            findings.push(finding);
        }

        let no_rate = data.no_activation_count as f64 / total as f64;
        if no_rate > ACTIVATION_RATE_THRESHOLD {
            let mut finding = Finding::new(
                Severity::Info,
                group_name,
                FindingKind::HighNoActivation,
                format!(
                    "High no-activation rate in group '{}': {}/{} cases ({:.0}%)",
                    group_name,
                    data.no_activation_count,
                    total,
                    no_rate * 100.0
                ),
            );
            finding.rate = Some(round4(no_rate));
            findings.push(finding);
        }
    }

    // Predictions that escaped the group index.
    for (group_name, report) in reports {
        if report.out_of_group_count > 0 {
            let severity = if report.index_violation_rate <= INDEX_VIOLATION_WARN_THRESHOLD {
                Severity::Info
            } else {
                Severity::Warning
            };
            let mut finding = Finding::new(
                severity,
                group_name,
                FindingKind::IndexViolation,
                format!(
                    "Index violations in group '{}': {} prediction(s) outside group index ({:.0}% violation rate)",
                    group_name,
                    report.out_of_group_count,
                    report.index_violation_rate * 100.0
                ),
            );
            finding.rate = Some(report.index_violation_rate);
            findings.push(finding);
        }
    }

    // Negative controls that activated anyway.
    let failures: Vec<&CaseResult> = negative_results.iter().filter(|r| !r.passed).collect();
    if !failures.is_empty() {
        findings.push(Finding::new(
            Severity::Warning,
            "_negative_controls",
            FindingKind::NegativeControlFailure,
            format!(
                "{} of {} negative controls incorrectly activated skills",
                failures.len(),
                negative_results.len()
            ),
        ));
    }

    findings
}
