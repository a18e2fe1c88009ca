//! Backend identities for the supported CLI model tools.
//!
//! Each backend is an external command-line tool invoked as a subprocess.
//! The tables here describe what each tool can mechanically do: which
//! prompt transports it accepts (in preference order), whether it can emit
//! a machine-parseable response object, and how its command line is shaped.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Known backend identifiers, in the order they are documented.
pub const KNOWN_BACKENDS: &[&str] = &["claude", "codex", "copilot"];

/// The mechanical means of delivering a prompt to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Prompt appended to the command line as a plain argument.
    Argument,
    /// Prompt written to the child's standard input.
    Stdin,
    /// Prompt written to a temporary file that is streamed through stdin.
    FilePipe,
}

impl TransportMode {
    /// Stable lowercase label for logs and serialized capabilities.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Argument => "argument",
            TransportMode::Stdin => "stdin",
            TransportMode::FilePipe => "file_pipe",
        }
    }
}

/// One of the supported CLI model tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Claude Code CLI.
    Claude,
    /// Codex CLI.
    Codex,
    /// Copilot CLI.
    Copilot,
}

impl BackendKind {
    /// Resolves a backend name to its kind.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "claude" => Ok(BackendKind::Claude),
            "codex" => Ok(BackendKind::Codex),
            "copilot" => Ok(BackendKind::Copilot),
            other => Err(Error::Config(format!(
                "unknown backend '{}', expected one of: {}",
                other,
                KNOWN_BACKENDS.join(", ")
            ))),
        }
    }

    /// The executable name looked up on PATH.
    pub fn command_name(&self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Codex => "codex",
            BackendKind::Copilot => "copilot",
        }
    }

    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        self.command_name()
    }

    /// Transport modes this tool accepts, most preferred first.
    ///
    /// Codex consumes its prompt from standard input only, so its list
    /// has no argument mode and the prober treats a total stream failure
    /// for it as fatal.
    pub fn transport_preference(&self) -> &'static [TransportMode] {
        match self {
            BackendKind::Claude => &[
                TransportMode::Argument,
                TransportMode::Stdin,
                TransportMode::FilePipe,
            ],
            BackendKind::Codex => &[TransportMode::Stdin, TransportMode::FilePipe],
            BackendKind::Copilot => &[
                TransportMode::Argument,
                TransportMode::Stdin,
                TransportMode::FilePipe,
            ],
        }
    }

    /// Whether this tool only works with stream-based transports.
    pub fn requires_stream(&self) -> bool {
        !self
            .transport_preference()
            .contains(&TransportMode::Argument)
    }

    /// Whether this tool is expected to support structured output.
    pub fn expects_structured_output(&self) -> bool {
        matches!(self, BackendKind::Claude | BackendKind::Codex)
    }

    /// Extra arguments requesting a machine-parseable response object.
    pub fn structured_output_args(&self) -> &'static [&'static str] {
        match self {
            BackendKind::Claude => &["--output-format", "json"],
            BackendKind::Codex => &["--json"],
            BackendKind::Copilot => &[],
        }
    }

    /// Base arguments for a one-shot, non-interactive invocation.
    pub fn base_args(&self) -> &'static [&'static str] {
        match self {
            BackendKind::Claude => &["-p"],
            BackendKind::Codex => &["exec"],
            BackendKind::Copilot => &["-p"],
        }
    }

    /// The flag that selects a model, if the tool has one.
    pub fn model_flag(&self) -> &'static str {
        "--model"
    }
}

/// A backend resolved for use: kind, configured model, executable path.
///
/// The executable path defaults to the bare command name (resolved via
/// PATH); tests override it to point at stub scripts.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Which CLI tool this is.
    pub kind: BackendKind,
    /// Model identifier passed to the tool, if any.
    pub model: Option<String>,
    /// Path or name of the executable.
    pub cli_path: String,
}

impl Backend {
    /// Creates a backend using the tool's default command name.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            model: None,
            cli_path: kind.command_name().to_string(),
        }
    }

    /// Sets the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Overrides the executable path (used by tests with stub scripts).
    pub fn with_cli_path(mut self, cli_path: impl Into<String>) -> Self {
        self.cli_path = cli_path.into();
        self
    }

    /// Builds the argument list for one invocation over `transport`.
    ///
    /// The payload itself is not included here; argument transport appends
    /// it as the final argument, stream transports deliver it via stdin.
    pub fn build_args(&self, transport: TransportMode, structured: bool) -> Vec<String> {
        let mut args: Vec<String> = self
            .kind
            .base_args()
            .iter()
            .map(|s| s.to_string())
            .collect();

        if structured {
            args.extend(
                self.kind
                    .structured_output_args()
                    .iter()
                    .map(|s| s.to_string()),
            );
        }

        if let Some(model) = &self.model {
            args.push(self.kind.model_flag().to_string());
            args.push(model.clone());
        }

        // Stream transports leave the prompt slot empty; the tools read
        // stdin when no prompt argument is given.
        let _ = transport;

        args
    }
}
