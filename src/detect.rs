//! Classification detection from free-form model responses.
//!
//! Models are asked for a machine-readable JSON answer but do not always
//! comply. The primary path digs the first syntactically valid JSON object
//! out of the response (code fences, prose wrapping and trailing commas
//! included); the secondary path asks a fast judge backend a strict yes/no
//! question about one specific handler.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RetryError;
use crate::invoke::{InvocationResult, Invoker};
use crate::retry::{run_with_retry, RetryPolicy};

static CODE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").expect("code fence regex")
});
static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("trailing comma regex"));

/// Longest response prefix forwarded to the fallback judge.
const FALLBACK_RESPONSE_CHARS: usize = 2000;

const FALLBACK_SYSTEM_PROMPT: &str = "You are a JSON classifier. Given a model response and a \
target skill ID, determine if the response indicates the skill should be activated.\n\n\
Answer with ONLY this JSON (no other text):\n\
{\"activated\": true} or {\"activated\": false}";

/// How the predicted handler list was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Parsed from the model's structured JSON answer.
    Structured,
    /// Recovered via the yes/no judge after a parse failure.
    Fallback,
    /// No structured answer could be extracted.
    ParseFailure,
}

/// How a case's predicted handler set is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// The model selected no handler.
    NoActivation,
    /// Exactly one handler selected.
    SingleActivation,
    /// More than one handler selected.
    MultiActivation,
    /// The response never yielded a handler list.
    ParseFailure,
}

/// Classifies a successfully parsed handler list.
pub fn classify(skills: &[String]) -> Classification {
    match skills.len() {
        0 => Classification::NoActivation,
        1 => Classification::SingleActivation,
        _ => Classification::MultiActivation,
    }
}

/// Extracts the first top-level JSON object from response text.
///
/// Tries code-fenced blocks first, then scans for the first parseable
/// object, then rescans with trailing commas stripped.
pub fn extract_json(text: &str) -> Option<Value> {
    for captures in CODE_FENCE_RE.captures_iter(text) {
        if let Some(parsed) = try_parse_object(captures[1].trim()) {
            return Some(parsed);
        }
    }

    if let Some(parsed) = extract_first_object(text) {
        return Some(parsed);
    }

    let cleaned = TRAILING_COMMA_RE.replace_all(text, "$1");
    extract_first_object(&cleaned)
}

/// Scans for the first valid JSON object using a streaming parse, which
/// tolerates trailing prose after the object.
fn extract_first_object(text: &str) -> Option<Value> {
    for (i, ch) in text.char_indices() {
        if ch != '{' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[i..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    None
}

fn try_parse_object(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() {
            return Some(value);
        }
        return None;
    }
    let cleaned = TRAILING_COMMA_RE.replace_all(text, "$1");
    serde_json::from_str::<Value>(&cleaned)
        .ok()
        .filter(Value::is_object)
}

/// Parses a structured response into the selected handler list.
///
/// Valid responses carry a `skills` field holding a list of handler
/// identifier strings.
pub fn detect_skills_structured(response_text: &str) -> (Option<Vec<String>>, DetectionMethod) {
    if let Some(parsed) = extract_json(response_text) {
        if let Some(skills) = parsed.get("skills").and_then(Value::as_array) {
            let mut ids = Vec::with_capacity(skills.len());
            for entry in skills {
                match entry.as_str() {
                    Some(s) => ids.push(s.to_string()),
                    None => return (None, DetectionMethod::ParseFailure),
                }
            }
            return (Some(ids), DetectionMethod::Structured);
        }
    }
    (None, DetectionMethod::ParseFailure)
}

/// Interprets boolean-like JSON values permissively (`true` / `"true"`).
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Asks the judge backend whether a specific handler should apply.
///
/// Invoked only after structured parsing fails on a case where a positive
/// outcome was expected. Runs through the budget-gated retry wrapper; the
/// caller records the returned result's cost and calls.
pub async fn detect_activation_fallback(
    judge: &dyn Invoker,
    response_text: &str,
    target_skill: &str,
    temperature: f64,
    budget_check: impl Fn(u32) -> bool,
    policy: &RetryPolicy,
) -> Result<(bool, InvocationResult), RetryError> {
    let excerpt: String = response_text.chars().take(FALLBACK_RESPONSE_CHARS).collect();
    let user_prompt = format!(
        "Target skill: {}\n\nModel response:\n{}",
        target_skill, excerpt
    );

    let result = run_with_retry(
        || judge.invoke(FALLBACK_SYSTEM_PROMPT, &user_prompt, 100, temperature),
        budget_check,
        policy,
    )
    .await?;

    let activated = extract_json(&result.text)
        .and_then(|parsed| parsed.get("activated").map(|v| truthy(v)))
        .unwrap_or(false);

    Ok((activated, result))
}
