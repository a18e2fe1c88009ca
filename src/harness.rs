//! The evaluation run loop.
//!
//! Cases are evaluated serially in a fixed, deterministic order so that
//! budget spend and fail-fast state are reproducible for a given dataset
//! and seed. The harness owns the only mutable shared state of a run: the
//! budget totals and the fail-fast tracker.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::analysis::{analyze, generate_findings};
use crate::backend::{Backend, BackendKind};
use crate::config::{EvalConfig, Validate};
use crate::dataset::{DomainGroups, EvalCase};
use crate::detect::{
    classify, detect_activation_fallback, detect_skills_structured, Classification,
    DetectionMethod,
};
use crate::envelope::{
    build_group_summaries, build_negative_summary, Artifacts, ResultsEnvelope, RunMetadata,
    Summary,
};
use crate::error::Result;
use crate::failfast::ConsecutiveFailureTracker;
use crate::invoke::{Invoker, ModelInvoker};
use crate::matrix::{build_confusion_matrices, CaseResult};
use crate::probe::CapabilityProber;
use crate::retry::{run_with_retry, Budget};

const CONFUSION_SYSTEM_PROMPT: &str = "You are a skill router for a development plugin. Given a \
skill index and a developer prompt, determine which skill should be activated.\n\n\
Rules:\n\
- Select ONLY the single most relevant skill from the index.\n\
- If no skill is relevant, return an empty skills list.\n\
- Return your answer as JSON only, with no other text.\n\n\
Required JSON format:\n\
{\"skills\": [\"skill-id\"], \"reasoning\": \"Brief explanation\"}\n\n\
Skill index:\n";

fn system_prompt_for(index: &str) -> String {
    format!("{}{}", CONFUSION_SYSTEM_PROMPT, index)
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Options for one harness run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Label recorded in metadata and the output filename.
    pub eval_type: String,
    /// Independent run iterations over the dataset.
    pub runs: u32,
    /// Seed recorded for reproducibility.
    pub seed: u64,
    /// Overrides the configured results directory.
    pub output_dir: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            eval_type: "confusion".to_string(),
            runs: 1,
            seed: 42,
            output_dir: None,
        }
    }
}

/// Outcome of one harness run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The envelope that was written.
    pub envelope: ResultsEnvelope,
    /// Where the envelope landed.
    pub output_path: PathBuf,
    /// Whether the run was cut short.
    pub aborted: bool,
    /// Whether fail-fast triggered the abort.
    pub fail_fast: bool,
    /// Total backend calls consumed.
    pub total_calls: u32,
    /// Total USD spend.
    pub total_cost: f64,
}

enum CaseDisposition {
    Completed,
    FailFast,
    BudgetExhausted,
}

/// Orchestrates one evaluation run end to end.
pub struct EvalHarness {
    config: EvalConfig,
    groups: DomainGroups,
    invoker: Box<dyn Invoker>,
    judge: Box<dyn Invoker>,
    budget: Budget,
    tracker: ConsecutiveFailureTracker,
}

impl EvalHarness {
    /// Probes the configured backend and builds real invokers.
    pub async fn connect(config: EvalConfig, groups: DomainGroups) -> Result<Self> {
        for warning in config.validate().into_result()? {
            tracing::warn!("config: {}", warning);
        }

        let kind = BackendKind::from_name(&config.backend.0)?;
        let timeout = config.invocation_timeout();

        let mut prober = CapabilityProber::new(timeout);
        let backend = Backend::new(kind).with_model(config.models.generation_model.clone());
        let capability = prober.probe(&backend).await?;
        tracing::info!(
            backend = kind.as_str(),
            transport = ?capability.transport,
            structured = capability.structured_output,
            "backend capability resolved"
        );

        let invoker = ModelInvoker::new(backend, capability, timeout);
        let judge_backend = Backend::new(kind).with_model(config.models.judge_model.clone());
        let judge = ModelInvoker::new(judge_backend, capability, timeout);

        Ok(Self::with_invokers(
            config,
            groups,
            Box::new(invoker),
            Box::new(judge),
        ))
    }

    /// Builds a harness around externally supplied invokers (tests).
    pub fn with_invokers(
        config: EvalConfig,
        groups: DomainGroups,
        invoker: Box<dyn Invoker>,
        judge: Box<dyn Invoker>,
    ) -> Self {
        let budget = config.budget();
        let tracker = ConsecutiveFailureTracker::new(config.fail_fast.consecutive_threshold);
        Self {
            config,
            groups,
            invoker,
            judge,
            budget,
            tracker,
        }
    }

    /// Evaluates all cases and writes the results envelope.
    ///
    /// The envelope is written even when the run aborts early; the abort
    /// cause is recorded in its metadata.
    pub async fn run(
        &mut self,
        cases: &[EvalCase],
        negatives: &[EvalCase],
        options: &RunOptions,
    ) -> Result<RunOutcome> {
        let mut meta = RunMetadata::new(
            options.eval_type.clone(),
            self.config.backend.0.clone(),
            self.config.models.generation_model.clone(),
            self.config.models.judge_model.clone(),
            options.seed,
        );
        tracing::info!(
            run_id = %meta.run_id,
            backend = %meta.backend,
            cases = cases.len(),
            negatives = negatives.len(),
            runs = options.runs,
            "starting eval run"
        );

        let mut group_indices: BTreeMap<String, (String, usize)> = BTreeMap::new();
        for group in self.groups.group_names() {
            let built = self.groups.build_group_index(group);
            group_indices.insert(group.to_string(), built);
        }
        let (full_index, _) = self.groups.build_full_index();
        let negative_system = system_prompt_for(&full_index);

        let mut confusion_results: Vec<CaseResult> = Vec::new();
        let mut negative_results: Vec<CaseResult> = Vec::new();
        let mut aborted = false;
        let mut fail_fast = false;

        'outer: for run_idx in 0..options.runs.max(1) {
            // Failure streaks must not leak across independent iterations.
            self.tracker.reset();

            for case in cases {
                if self.budget.exceeded(0) {
                    tracing::warn!(
                        spent_cost = self.budget.spent_cost,
                        spent_calls = self.budget.spent_calls,
                        "budget exhausted; aborting run"
                    );
                    aborted = true;
                    break 'outer;
                }

                let (result, disposition) = self
                    .evaluate_confusion_case(case, run_idx, options.runs, &group_indices)
                    .await;
                confusion_results.push(result);

                match disposition {
                    CaseDisposition::Completed => {}
                    CaseDisposition::FailFast => {
                        fail_fast = true;
                        aborted = true;
                        break 'outer;
                    }
                    CaseDisposition::BudgetExhausted => {
                        aborted = true;
                        break 'outer;
                    }
                }
            }

            for case in negatives {
                if self.budget.exceeded(0) {
                    aborted = true;
                    break 'outer;
                }

                let (result, disposition) = self
                    .evaluate_negative_case(case, run_idx, options.runs, &negative_system)
                    .await;
                negative_results.push(result);

                match disposition {
                    CaseDisposition::Completed => {}
                    CaseDisposition::FailFast => {
                        fail_fast = true;
                        aborted = true;
                        break 'outer;
                    }
                    CaseDisposition::BudgetExhausted => {
                        aborted = true;
                        break 'outer;
                    }
                }
            }
        }

        let axes = self.groups.axes();
        let matrices = build_confusion_matrices(&confusion_results, &axes);
        let reports = analyze(&matrices);
        let findings =
            generate_findings(&matrices, &reports, &confusion_results, &negative_results);
        let summaries = build_group_summaries(
            &confusion_results,
            &matrices,
            &reports,
            &axes,
            options.runs.max(1),
        );

        meta.total_cost = round6(self.budget.spent_cost);
        meta.total_calls = self.budget.spent_calls;
        meta.aborted = aborted;
        if fail_fast {
            meta.fail_fast_reason = self.tracker.last_fingerprint().map(|fp| fp.to_string());
        }

        let mut all_cases = confusion_results;
        all_cases.extend(negative_results.iter().cloned());

        let envelope = ResultsEnvelope {
            meta,
            summary: Summary {
                groups: summaries,
                negative_controls: build_negative_summary(&negative_results),
            },
            cases: all_cases,
            artifacts: Artifacts {
                confusion_matrices: matrices,
                cross_activation_rates: reports,
                findings,
                domain_groups: axes,
            },
        };

        let output_dir = options
            .output_dir
            .clone()
            .unwrap_or_else(|| self.config.paths.results_dir.clone());
        let output_path = envelope.write(&output_dir)?;

        tracing::info!(
            path = %output_path.display(),
            total_cost = envelope.meta.total_cost,
            total_calls = envelope.meta.total_calls,
            aborted,
            "eval run complete"
        );

        Ok(RunOutcome {
            aborted,
            fail_fast,
            total_calls: envelope.meta.total_calls,
            total_cost: envelope.meta.total_cost,
            output_path,
            envelope,
        })
    }

    async fn evaluate_confusion_case(
        &mut self,
        case: &EvalCase,
        run_idx: u32,
        runs: u32,
        group_indices: &BTreeMap<String, (String, usize)>,
    ) -> (CaseResult, CaseDisposition) {
        let run_case_id = if runs > 1 {
            format!("{}/run-{}", case.id, run_idx)
        } else {
            case.id.clone()
        };
        let group = case.group.clone().unwrap_or_default();

        let mut result = CaseResult {
            id: run_case_id,
            group: Some(group.clone()),
            user_prompt: case.user_prompt.clone(),
            expected_skill: case.expected_skill.clone(),
            acceptable_skills: case.acceptable_skills.clone(),
            activated_skills: vec![],
            classification: None,
            detection_method: None,
            should_activate: case.should_activate,
            passed: false,
            run_index: run_idx,
            cost: 0.0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            error: None,
            category: None,
        };

        let Some((index_text, skill_count)) = group_indices.get(&group) else {
            result.error = Some(format!("no routing index for group '{}'", group));
            return (result, CaseDisposition::Completed);
        };
        if *skill_count == 0 {
            result.error = Some(format!("routing index for group '{}' is empty", group));
            return (result, CaseDisposition::Completed);
        }

        let system_prompt = system_prompt_for(index_text);
        tracing::debug!(case = %result.id, group = %group, "evaluating case");

        let invocation = {
            let invoker = self.invoker.as_ref();
            let budget = self.budget.clone();
            run_with_retry(
                || {
                    invoker.invoke(
                        &system_prompt,
                        &case.user_prompt,
                        self.config.max_output_tokens.0,
                        self.config.temperature,
                    )
                },
                move |pending| budget.exceeded(pending),
                &self.config.retry,
            )
            .await
        };

        let response = match invocation {
            Ok(response) => {
                self.budget.record(response.cost, response.calls);
                self.tracker.record_success();
                result.cost = round6(response.cost);
                response
            }
            Err(retry_err) => {
                self.budget.record(0.0, retry_err.consumed_calls);
                result.error = Some(retry_err.source.to_string());
                if matches!(retry_err.source, crate::error::Error::BudgetExceeded { .. }) {
                    return (result, CaseDisposition::BudgetExhausted);
                }
                let triggered = self.config.fail_fast.enabled
                    && self.tracker.record_failure(&retry_err.source);
                if triggered {
                    tracing::error!(
                        fingerprint = %self.tracker.last_fingerprint().map(|f| f.to_string()).unwrap_or_default(),
                        "fail-fast threshold reached"
                    );
                    return (result, CaseDisposition::FailFast);
                }
                return (result, CaseDisposition::Completed);
            }
        };

        let (skills_opt, mut method) = detect_skills_structured(&response.text);
        let mut classification;
        match skills_opt {
            Some(skills) => {
                classification = classify(&skills);
                result.activated_skills = skills;
            }
            None => classification = Classification::ParseFailure,
        }

        // The judge fallback is only worth a call when a positive outcome
        // was expected and the primary parse failed.
        if classification == Classification::ParseFailure
            && case.should_activate
            && !case.expected_skill.is_empty()
        {
            let fallback = {
                let judge = self.judge.as_ref();
                let budget = self.budget.clone();
                detect_activation_fallback(
                    judge,
                    &response.text,
                    &case.expected_skill,
                    self.config.temperature,
                    move |pending| budget.exceeded(pending),
                    &self.config.retry,
                )
                .await
            };
            match fallback {
                Ok((activated, judge_result)) => {
                    self.budget.record(judge_result.cost, judge_result.calls);
                    result.cost = round6(result.cost + judge_result.cost);
                    if activated {
                        result.activated_skills = vec![case.expected_skill.clone()];
                        classification = Classification::SingleActivation;
                        method = DetectionMethod::Fallback;
                    }
                }
                Err(retry_err) => {
                    self.budget.record(0.0, retry_err.consumed_calls);
                    tracing::warn!(case = %result.id, error = %retry_err, "fallback detection failed");
                }
            }
        }

        result.classification = Some(classification);
        result.detection_method = Some(method);

        // Only an unambiguous single selection can pass a confusion case.
        if classification == Classification::SingleActivation {
            let predicted = result.activated_skills[0].as_str();
            result.passed = predicted == case.expected_skill
                || case.acceptable_skills.iter().any(|s| s == predicted);
        }

        (result, CaseDisposition::Completed)
    }

    async fn evaluate_negative_case(
        &mut self,
        case: &EvalCase,
        run_idx: u32,
        runs: u32,
        negative_system: &str,
    ) -> (CaseResult, CaseDisposition) {
        let run_case_id = if runs > 1 {
            format!("{}/run-{}", case.id, run_idx)
        } else {
            case.id.clone()
        };

        let mut result = CaseResult {
            id: run_case_id,
            group: None,
            user_prompt: case.user_prompt.clone(),
            expected_skill: String::new(),
            acceptable_skills: vec![],
            activated_skills: vec![],
            classification: None,
            detection_method: None,
            should_activate: false,
            passed: false,
            run_index: run_idx,
            cost: 0.0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            error: None,
            category: case.category.clone(),
        };

        let invocation = {
            let invoker = self.invoker.as_ref();
            let budget = self.budget.clone();
            run_with_retry(
                || {
                    invoker.invoke(
                        negative_system,
                        &case.user_prompt,
                        self.config.max_output_tokens.0,
                        self.config.temperature,
                    )
                },
                move |pending| budget.exceeded(pending),
                &self.config.retry,
            )
            .await
        };

        let response = match invocation {
            Ok(response) => {
                self.budget.record(response.cost, response.calls);
                self.tracker.record_success();
                result.cost = round6(response.cost);
                response
            }
            Err(retry_err) => {
                self.budget.record(0.0, retry_err.consumed_calls);
                result.error = Some(retry_err.source.to_string());
                if matches!(retry_err.source, crate::error::Error::BudgetExceeded { .. }) {
                    return (result, CaseDisposition::BudgetExhausted);
                }
                let triggered = self.config.fail_fast.enabled
                    && self.tracker.record_failure(&retry_err.source);
                return (
                    result,
                    if triggered {
                        CaseDisposition::FailFast
                    } else {
                        CaseDisposition::Completed
                    },
                );
            }
        };

        let (skills_opt, method) = detect_skills_structured(&response.text);
        match skills_opt {
            Some(skills) => {
                result.classification = Some(classify(&skills));
                // A negative control passes only when nothing activated.
                result.passed = skills.is_empty();
                result.activated_skills = skills;
            }
            None => {
                result.classification = Some(Classification::ParseFailure);
                result.passed = false;
            }
        }
        result.detection_method = Some(method);

        (result, CaseDisposition::Completed)
    }
}
