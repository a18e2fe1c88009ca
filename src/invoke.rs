//! Model invocation over probed transports.
//!
//! Builds the command line for the transport the prober confirmed, runs
//! the backend as a subprocess under a hard wall-clock timeout, and parses
//! the response through an ordered ladder of extractor strategies.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::backend::{Backend, TransportMode};
use crate::error::{Error, Result};
use crate::probe::Capability;
use crate::retry::CallAccounting;

/// Largest payload the argument transport guarantees to deliver.
///
/// Payloads at or below this size never raise a configuration error on a
/// confirmed argument transport; above it, argument-only backends cannot
/// structurally carry the call.
pub const ARG_TRANSPORT_MAX_BYTES: usize = 100_000;

/// Outcome of one model invocation. Immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    /// Response text after envelope extraction.
    pub text: String,
    /// Reported or estimated cost of the call in USD.
    pub cost: f64,
    /// Backend calls consumed. Normally 1; the retry wrapper folds in
    /// calls consumed by failed attempts that preceded this success.
    pub calls: u32,
}

impl CallAccounting for InvocationResult {
    fn calls(&self) -> u32 {
        self.calls
    }

    fn add_calls(&mut self, n: u32) {
        self.calls += n;
    }
}

/// Invocation seam so the detector and harness can run against scripted
/// fakes in tests.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Invokes the backend with a system instruction and user prompt.
    async fn invoke(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_output_tokens: u32,
        temperature: f64,
    ) -> Result<InvocationResult>;

    /// Returns the model identifier this invoker calls.
    fn model(&self) -> &str;
}

/// Raw captured output of one subprocess run.
#[derive(Debug)]
pub(crate) struct RawOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs one CLI invocation over the given transport.
///
/// The payload travels as the final argument (argument transport), via a
/// direct stdin write, or via a temporary file streamed through stdin.
/// The temporary file is removed on every exit path when it drops.
pub(crate) async fn run_transport(
    cli_path: &str,
    args: &[String],
    transport: TransportMode,
    payload: &str,
    timeout: Duration,
) -> Result<RawOutput> {
    let mut cmd = Command::new(cli_path);
    let mut _payload_file: Option<NamedTempFile> = None;

    match transport {
        TransportMode::Argument => {
            cmd.args(args).arg(payload).stdin(Stdio::null());
        }
        TransportMode::Stdin => {
            cmd.args(args).stdin(Stdio::piped());
        }
        TransportMode::FilePipe => {
            let mut tmp = NamedTempFile::new()?;
            std::io::Write::write_all(&mut tmp, payload.as_bytes())?;
            let file = tmp.reopen()?;
            cmd.args(args).stdin(Stdio::from(file));
            _payload_file = Some(tmp);
        }
    }

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::MissingExecutable(cli_path.to_string()),
        std::io::ErrorKind::PermissionDenied => {
            Error::Config(format!("cannot execute {}: permission denied", cli_path))
        }
        _ => Error::Transient {
            reason: format!("failed to spawn {}: {}", cli_path, e),
            calls: 0,
        },
    })?;

    let stdin_payload = if transport == TransportMode::Stdin {
        Some(payload.as_bytes().to_vec())
    } else {
        None
    };
    let mut stdin = child.stdin.take();
    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");

    let io_fut = async {
        let write_fut = async {
            if let (Some(mut handle), Some(data)) = (stdin.take(), stdin_payload.as_deref()) {
                handle.write_all(data).await?;
                handle.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        let (w, r1, r2) = tokio::join!(
            write_fut,
            stdout_pipe.read_to_end(&mut out),
            stderr_pipe.read_to_end(&mut err)
        );
        w?;
        r1?;
        r2?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, out, err))
    };

    let (status, stdout, stderr) = match tokio::time::timeout(timeout, io_fut).await {
        Ok(Ok(res)) => res,
        Ok(Err(e)) => {
            return Err(Error::Transient {
                reason: format!("{} IO failure: {}", cli_path, e),
                calls: 1,
            })
        }
        // kill_on_drop reaps the child when it drops below.
        Err(_) => return Err(Error::Timeout {
            seconds: timeout.as_secs(),
        }),
    };

    Ok(RawOutput {
        code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Maps a non-zero exit to the error taxonomy.
///
/// Exit codes 126/127 and permission/not-found stderr markers are
/// infrastructure problems, not test failures; everything else is
/// transient and eligible for retry.
pub(crate) fn classify_exit_failure(cli_path: &str, code: Option<i32>, stderr: &str) -> Error {
    let lowered = stderr.to_lowercase();
    if matches!(code, Some(126) | Some(127))
        || lowered.contains("command not found")
        || lowered.contains("permission denied")
    {
        return Error::Config(format!(
            "{} infrastructure failure (exit {:?}): {}",
            cli_path,
            code,
            truncate(stderr, 200)
        ));
    }
    Error::Transient {
        reason: format!(
            "{} exited with {:?}: {}",
            cli_path,
            code,
            truncate(stderr, 200)
        ),
        calls: 1,
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().take(max_chars).collect()
    }
}

/// Text extracted from a backend response, plus any cost the backend
/// itself reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedResponse {
    pub text: String,
    pub reported_cost: Option<f64>,
}

type Extractor = fn(&str) -> Option<ExtractedResponse>;

/// Response-shape extractors, tried in order. Each either returns the
/// response text or declines.
pub(crate) const RESPONSE_EXTRACTORS: &[(&str, Extractor)] = &[
    ("result_envelope", extract_result_envelope),
    ("message_content", extract_message_content),
    ("jsonl_text", extract_jsonl_text),
];

/// Single JSON object with a top-level `result` string (Claude's
/// `--output-format json` envelope). Picks up the reported cost if present.
fn extract_result_envelope(stdout: &str) -> Option<ExtractedResponse> {
    let value: Value = serde_json::from_str(stdout.trim()).ok()?;
    let obj = value.as_object()?;
    let text = obj.get("result")?.as_str()?.to_string();
    let reported_cost = obj.get("total_cost_usd").and_then(Value::as_f64);
    Some(ExtractedResponse {
        text,
        reported_cost,
    })
}

/// Single JSON object with a `content` block array, either at the top
/// level or nested under `message`.
fn extract_message_content(stdout: &str) -> Option<ExtractedResponse> {
    let value: Value = serde_json::from_str(stdout.trim()).ok()?;
    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| value.get("content"))?
        .as_array()?;

    let mut pieces = Vec::new();
    for item in content {
        if item.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                pieces.push(text);
            }
        }
    }
    if pieces.is_empty() {
        return None;
    }
    Some(ExtractedResponse {
        text: pieces.join(""),
        reported_cost: None,
    })
}

/// JSON-lines event stream; the response is the last agent message event
/// (Codex's `--json` output).
fn extract_jsonl_text(stdout: &str) -> Option<ExtractedResponse> {
    let mut last: Option<String> = None;
    for line in stdout.lines() {
        let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        if let Some(item) = value.get("item") {
            if item.get("type").and_then(Value::as_str) == Some("agent_message") {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    last = Some(text.to_string());
                }
            }
        }
        if let Some(msg) = value.get("msg") {
            if msg.get("type").and_then(Value::as_str) == Some("agent_message") {
                if let Some(text) = msg.get("message").and_then(Value::as_str) {
                    last = Some(text.to_string());
                }
            }
        }
    }
    last.map(|text| ExtractedResponse {
        text,
        reported_cost: None,
    })
}

/// Per-token USD rates for one model.
#[derive(Debug, Clone, Copy)]
pub struct TokenRates {
    /// USD per million input tokens.
    pub input_per_mtok: f64,
    /// USD per million output tokens.
    pub output_per_mtok: f64,
}

/// Cost estimation for backends that do not report usage.
///
/// Token counts are approximated at four characters per token; backends
/// that report a cost in their structured envelope are used verbatim.
#[derive(Debug, Clone)]
pub struct CostModel {
    rates: HashMap<String, TokenRates>,
    default_rates: TokenRates,
}

impl Default for CostModel {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "claude-haiku-4-20250514".to_string(),
            TokenRates {
                input_per_mtok: 0.80,
                output_per_mtok: 4.00,
            },
        );
        rates.insert(
            "claude-sonnet-4-20250514".to_string(),
            TokenRates {
                input_per_mtok: 3.00,
                output_per_mtok: 15.00,
            },
        );
        Self {
            rates,
            default_rates: TokenRates {
                input_per_mtok: 1.00,
                output_per_mtok: 5.00,
            },
        }
    }
}

impl CostModel {
    /// Estimates the USD cost of one call from payload and response sizes.
    pub fn estimate(
        &self,
        model: &str,
        input_chars: usize,
        output_chars: usize,
        max_output_tokens: u32,
    ) -> f64 {
        let rates = self.rates.get(model).copied().unwrap_or(self.default_rates);
        let input_tokens = (input_chars / 4) as f64;
        let output_tokens = ((output_chars / 4) as f64).min(max_output_tokens as f64);
        (input_tokens * rates.input_per_mtok + output_tokens * rates.output_per_mtok) / 1_000_000.0
    }
}

/// Invokes one backend over its probed capability.
pub struct ModelInvoker {
    backend: Backend,
    capability: Capability,
    timeout: Duration,
    cost_model: CostModel,
    model_name: String,
    warned: Mutex<HashSet<String>>,
}

impl ModelInvoker {
    /// Creates an invoker for a backend whose capability has been probed.
    pub fn new(backend: Backend, capability: Capability, timeout: Duration) -> Self {
        let model_name = backend
            .model
            .clone()
            .unwrap_or_else(|| backend.kind.as_str().to_string());
        Self {
            backend,
            capability,
            timeout,
            cost_model: CostModel::default(),
            model_name,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Replaces the cost model.
    pub fn with_cost_model(mut self, cost_model: CostModel) -> Self {
        self.cost_model = cost_model;
        self
    }

    fn warn_once(&self, key: String, message: &str) {
        let mut warned = self.warned.lock().expect("warn set poisoned");
        if warned.insert(key) {
            tracing::warn!(backend = %self.backend.kind.as_str(), "{}", message);
        }
    }

    /// Runs the extractor ladder over raw stdout.
    fn extract_response(&self, stdout: &str) -> ExtractedResponse {
        for (name, extractor) in RESPONSE_EXTRACTORS {
            if let Some(extracted) = extractor(stdout) {
                tracing::debug!(strategy = name, "response extracted");
                return extracted;
            }
        }
        self.warn_once(
            format!("raw_text_fallback:{}", self.backend.kind.as_str()),
            "no response envelope matched; falling back to raw text",
        );
        ExtractedResponse {
            text: stdout.trim().to_string(),
            reported_cost: None,
        }
    }
}

#[async_trait]
impl Invoker for ModelInvoker {
    async fn invoke(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_output_tokens: u32,
        temperature: f64,
    ) -> Result<InvocationResult> {
        if !self.capability.available {
            return Err(Error::MissingExecutable(
                self.backend.kind.command_name().to_string(),
            ));
        }
        let transport = self.capability.transport.ok_or_else(|| {
            Error::Config(format!(
                "backend {} has no usable transport",
                self.backend.kind.as_str()
            ))
        })?;

        let payload = format!("{}\n\n{}", system_prompt, user_prompt);
        if transport == TransportMode::Argument && payload.len() > ARG_TRANSPORT_MAX_BYTES {
            return Err(Error::Config(format!(
                "payload of {} bytes exceeds the {} byte argument transport guarantee",
                payload.len(),
                ARG_TRANSPORT_MAX_BYTES
            )));
        }

        let args = self
            .backend
            .build_args(transport, self.capability.structured_output);

        tracing::debug!(
            backend = %self.backend.kind.as_str(),
            transport = transport.as_str(),
            max_output_tokens,
            temperature,
            payload_bytes = payload.len(),
            "invoking backend"
        );

        let raw = run_transport(
            &self.backend.cli_path,
            &args,
            transport,
            &payload,
            self.timeout,
        )
        .await?;

        if raw.code != Some(0) {
            return Err(classify_exit_failure(
                &self.backend.cli_path,
                raw.code,
                &raw.stderr,
            ));
        }

        let extracted = self.extract_response(&raw.stdout);
        let cost = extracted.reported_cost.unwrap_or_else(|| {
            self.cost_model.estimate(
                &self.model_name,
                payload.len(),
                extracted.text.len(),
                max_output_tokens,
            )
        });

        Ok(InvocationResult {
            text: extracted.text,
            cost,
            calls: 1,
        })
    }

    fn model(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    fn invoker_with(transport: Option<TransportMode>, structured: bool) -> ModelInvoker {
        let backend = Backend::new(BackendKind::Claude).with_cli_path("/nonexistent/claude");
        let capability = Capability {
            available: transport.is_some(),
            transport,
            structured_output: structured,
        };
        ModelInvoker::new(backend, capability, Duration::from_secs(5))
    }

    #[test]
    fn result_envelope_extracts_text_and_cost() {
        let stdout = r#"{"type":"result","result":"hello there","total_cost_usd":0.0123}"#;
        let extracted = extract_result_envelope(stdout).unwrap();
        assert_eq!(extracted.text, "hello there");
        assert_eq!(extracted.reported_cost, Some(0.0123));
    }

    #[test]
    fn result_envelope_declines_non_envelope() {
        assert!(extract_result_envelope("plain text").is_none());
        assert!(extract_result_envelope(r#"{"no_result":true}"#).is_none());
    }

    #[test]
    fn message_content_extracts_text_blocks() {
        let stdout = r#"{"message":{"content":[{"type":"text","text":"part one "},{"type":"text","text":"part two"}]}}"#;
        let extracted = extract_message_content(stdout).unwrap();
        assert_eq!(extracted.text, "part one part two");

        let top_level = r#"{"content":[{"type":"text","text":"top"}]}"#;
        assert_eq!(extract_message_content(top_level).unwrap().text, "top");
    }

    #[test]
    fn jsonl_text_takes_last_agent_message() {
        let stdout = concat!(
            r#"{"type":"item.started","item":{"type":"command_execution"}}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"first"}}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"second"}}"#,
        );
        let extracted = extract_jsonl_text(stdout).unwrap();
        assert_eq!(extracted.text, "second");
    }

    #[test]
    fn jsonl_text_handles_msg_shape() {
        let stdout = r#"{"id":"1","msg":{"type":"agent_message","message":"from msg"}}"#;
        assert_eq!(extract_jsonl_text(stdout).unwrap().text, "from msg");
    }

    #[test]
    fn extractor_ladder_falls_back_to_raw_text() {
        let invoker = invoker_with(Some(TransportMode::Argument), false);
        let extracted = invoker.extract_response("  just plain text  ");
        assert_eq!(extracted.text, "just plain text");
        assert_eq!(extracted.reported_cost, None);
    }

    #[test]
    fn exit_127_is_infrastructure_error() {
        let err = classify_exit_failure("claude", Some(127), "claude: command not found");
        assert!(err.is_config());
    }

    #[test]
    fn nonzero_exit_is_transient() {
        let err = classify_exit_failure("claude", Some(1), "rate limited");
        assert!(!err.is_config());
        assert_eq!(err.calls_consumed(), 1);
    }

    #[test]
    fn signal_death_is_transient() {
        let err = classify_exit_failure("claude", None, "");
        assert!(!err.is_config());
    }

    #[test]
    fn cost_model_uses_known_rates() {
        let model = CostModel::default();
        // 4000 input chars = 1000 tokens, 400 output chars = 100 tokens.
        let cost = model.estimate("claude-haiku-4-20250514", 4000, 400, 512);
        let expected = (1000.0 * 0.80 + 100.0 * 4.00) / 1_000_000.0;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn cost_model_caps_output_at_max_tokens() {
        let model = CostModel::default();
        let capped = model.estimate("unknown-model", 0, 40_000, 10);
        let expected = 10.0 * 5.00 / 1_000_000.0;
        assert!((capped - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn oversized_argument_payload_is_config_error() {
        let invoker = invoker_with(Some(TransportMode::Argument), false);
        let big = "x".repeat(ARG_TRANSPORT_MAX_BYTES + 1);
        let err = invoker.invoke("system", &big, 512, 0.0).await.unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn unavailable_backend_is_missing_executable() {
        let invoker = invoker_with(None, false);
        let err = invoker.invoke("system", "user", 512, 0.0).await.unwrap_err();
        assert!(matches!(err, Error::MissingExecutable(_)));
    }
}
