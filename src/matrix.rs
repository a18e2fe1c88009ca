//! Confusion matrix construction from accumulated case results.
//!
//! Each comparison group gets one square matrix whose axes are the
//! group's statically declared handler set, never the handlers observed
//! in a particular run. Stable axes keep matrices diffable across runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::detect::{Classification, DetectionMethod};

/// One evaluated case. Mutated by the orchestrator as results arrive,
/// immutable once appended to the results set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    /// Case identifier (suffixed with the run index on multi-run evals).
    pub id: String,
    /// Comparison group; absent for negative controls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// The prompt presented to the router.
    pub user_prompt: String,
    /// The handler that should have been selected.
    #[serde(default)]
    pub expected_skill: String,
    /// Alternate handlers that also count as correct.
    #[serde(default)]
    pub acceptable_skills: Vec<String>,
    /// Handlers the model actually selected.
    #[serde(default)]
    pub activated_skills: Vec<String>,
    /// Scoring classification; absent when the invocation itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    /// How the handler list was obtained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_method: Option<DetectionMethod>,
    /// Whether any handler should legitimately activate for this prompt.
    pub should_activate: bool,
    /// Pass/fail verdict.
    pub passed: bool,
    /// Which run iteration produced this result.
    pub run_index: u32,
    /// Cost of the calls this case consumed, in USD.
    pub cost: f64,
    /// UTC timestamp of evaluation.
    pub timestamp: String,
    /// Infrastructure or invocation error, if one terminated the case.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Negative-control category, if this is a negative control.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Per-group confusion matrix with fixed axes and side counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// The declared handler axis, sorted. Identical for rows and columns.
    pub skills: Vec<String>,
    /// Cell counts: expected handler -> predicted handler -> occurrences.
    pub matrix: BTreeMap<String, BTreeMap<String, u32>>,
    /// Cases where more than one handler was selected (excluded from cells).
    pub multi_activation_count: u32,
    /// Cases where no handler was selected (excluded from cells).
    pub no_activation_count: u32,
    /// Single selections of a handler outside the declared axis.
    pub out_of_group_count: u32,
    /// All cases observed for this group, regardless of classification.
    pub total_cases: u32,
}

impl ConfusionMatrix {
    /// Creates a zero-filled matrix over the declared handler set.
    pub fn with_axes(skills: &[String]) -> Self {
        let mut sorted: Vec<String> = skills.to_vec();
        sorted.sort();

        let mut matrix = BTreeMap::new();
        for expected in &sorted {
            let row: BTreeMap<String, u32> =
                sorted.iter().map(|s| (s.clone(), 0)).collect();
            matrix.insert(expected.clone(), row);
        }

        Self {
            skills: sorted,
            matrix,
            multi_activation_count: 0,
            no_activation_count: 0,
            out_of_group_count: 0,
            total_cases: 0,
        }
    }

    /// Returns one cell count.
    pub fn count(&self, expected: &str, predicted: &str) -> u32 {
        self.matrix
            .get(expected)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }
}

/// Builds one confusion matrix per group from accumulated case results.
///
/// `group_axes` maps each group to its statically declared handler set.
/// Classification policy per case: no-activation and multi-activation
/// increment their counters and stay out of the cells (a multi-pick case
/// has no unambiguous column); a single activation lands in
/// `matrix[expected][predicted]`, or in the out-of-group counter when the
/// prediction is not on the declared axis; parse failures and
/// infrastructure errors are dropped from the matrix but remain in the
/// raw results.
pub fn build_confusion_matrices(
    results: &[CaseResult],
    group_axes: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, ConfusionMatrix> {
    let mut grouped: BTreeMap<&str, Vec<&CaseResult>> = BTreeMap::new();
    for result in results {
        if let Some(group) = result.group.as_deref() {
            grouped.entry(group).or_default().push(result);
        }
    }

    let mut matrices = BTreeMap::new();
    for (group_name, group_results) in grouped {
        let axes = group_axes.get(group_name).cloned().unwrap_or_default();
        let mut matrix = ConfusionMatrix::with_axes(&axes);
        matrix.total_cases = group_results.len() as u32;

        for result in group_results {
            match result.classification {
                Some(Classification::NoActivation) => matrix.no_activation_count += 1,
                Some(Classification::MultiActivation) => matrix.multi_activation_count += 1,
                Some(Classification::SingleActivation) => {
                    let Some(predicted) = result.activated_skills.first() else {
                        continue;
                    };
                    let expected = result.expected_skill.as_str();
                    if !matrix.matrix.contains_key(expected) {
                        continue;
                    }
                    match matrix
                        .matrix
                        .get_mut(expected)
                        .and_then(|row| row.get_mut(predicted))
                    {
                        Some(cell) => *cell += 1,
                        // Prediction outside the declared index.
                        None => matrix.out_of_group_count += 1,
                    }
                }
                Some(Classification::ParseFailure) | None => {}
            }
        }

        matrices.insert(group_name.to_string(), matrix);
    }

    matrices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_case(group: &str, expected: &str, predicted: &str) -> CaseResult {
        CaseResult {
            id: format!("{}-{}-{}", group, expected, predicted),
            group: Some(group.to_string()),
            user_prompt: "prompt".to_string(),
            expected_skill: expected.to_string(),
            acceptable_skills: vec![],
            activated_skills: vec![predicted.to_string()],
            classification: Some(Classification::SingleActivation),
            detection_method: Some(DetectionMethod::Structured),
            should_activate: true,
            passed: expected == predicted,
            run_index: 0,
            cost: 0.0,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            error: None,
            category: None,
        }
    }

    fn case_with(group: &str, classification: Classification, activated: &[&str]) -> CaseResult {
        let mut case = single_case(group, "a", activated.first().copied().unwrap_or(""));
        case.activated_skills = activated.iter().map(|s| s.to_string()).collect();
        case.classification = Some(classification);
        case
    }

    fn axes_of(group: &str, skills: &[&str]) -> BTreeMap<String, Vec<String>> {
        let mut axes = BTreeMap::new();
        axes.insert(
            group.to_string(),
            skills.iter().map(|s| s.to_string()).collect(),
        );
        axes
    }

    #[test]
    fn builds_matrix_with_fixed_axes_and_out_of_group_counter() {
        let axes = axes_of("g", &["a", "b", "c"]);
        let results = vec![
            single_case("g", "a", "a"),
            single_case("g", "a", "b"),
            single_case("g", "b", "b"),
            single_case("g", "b", "b"),
            single_case("g", "c", "hallucinated-handler"),
        ];

        let matrices = build_confusion_matrices(&results, &axes);
        let m = &matrices["g"];

        assert_eq!(m.count("a", "a"), 1);
        assert_eq!(m.count("a", "b"), 1);
        assert_eq!(m.count("b", "b"), 2);
        assert_eq!(m.out_of_group_count, 1);
        assert_eq!(m.total_cases, 5);

        // Axes stay fixed even though nothing ever predicted "c".
        assert_eq!(m.skills, vec!["a", "b", "c"]);
        assert_eq!(m.count("c", "c"), 0);
        let zero_cells = m
            .matrix
            .values()
            .flat_map(|row| row.values())
            .filter(|&&c| c == 0)
            .count();
        assert_eq!(zero_cells, 9 - 3);
    }

    #[test]
    fn multi_and_no_activation_stay_out_of_cells() {
        let axes = axes_of("g", &["a", "b"]);
        let results = vec![
            case_with("g", Classification::MultiActivation, &["a", "b"]),
            case_with("g", Classification::NoActivation, &[]),
            single_case("g", "a", "a"),
        ];

        let matrices = build_confusion_matrices(&results, &axes);
        let m = &matrices["g"];

        assert_eq!(m.multi_activation_count, 1);
        assert_eq!(m.no_activation_count, 1);
        assert_eq!(m.count("a", "a"), 1);
        assert_eq!(m.count("a", "b"), 0);
        assert_eq!(m.total_cases, 3);
    }

    #[test]
    fn parse_failures_counted_in_totals_only() {
        let axes = axes_of("g", &["a", "b"]);
        let mut failed = single_case("g", "a", "");
        failed.activated_skills = vec![];
        failed.classification = Some(Classification::ParseFailure);

        let matrices = build_confusion_matrices(&[failed], &axes);
        let m = &matrices["g"];
        assert_eq!(m.total_cases, 1);
        assert_eq!(m.count("a", "a") + m.count("a", "b"), 0);
        assert_eq!(m.out_of_group_count, 0);
    }

    #[test]
    fn negative_controls_without_group_are_excluded() {
        let axes = axes_of("g", &["a"]);
        let mut negative = single_case("g", "a", "a");
        negative.group = None;

        let matrices = build_confusion_matrices(&[negative], &axes);
        assert!(matrices.is_empty());
    }

    #[test]
    fn matrix_round_trips_through_serde() {
        let axes = axes_of("g", &["a", "b", "c"]);
        let results = vec![
            single_case("g", "a", "b"),
            single_case("g", "c", "outside"),
        ];
        let matrices = build_confusion_matrices(&results, &axes);

        let json = serde_json::to_string(&matrices).unwrap();
        let reparsed: BTreeMap<String, ConfusionMatrix> = serde_json::from_str(&json).unwrap();
        assert_eq!(matrices, reparsed);
    }
}
