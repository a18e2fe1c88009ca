//! Capability probing for CLI backends.
//!
//! Before a backend is used, the prober determines which prompt transport
//! actually works and whether structured output is supported. Results are
//! cached per backend for the life of the process; the cache is an owned,
//! injectable object so tests can start from a clean slate.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{Backend, BackendKind, TransportMode};
use crate::error::{Error, Result};
use crate::invoke::run_transport;

/// Deterministic probe prompt; the reply must contain [`PROBE_TOKEN`].
const PROBE_PROMPT: &str = "Reply with exactly CAPROBE_OK and nothing else.";
const PROBE_TOKEN: &str = "CAPROBE_OK";

/// Probed capabilities of one backend. Resolved once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Whether the executable was located at all.
    pub available: bool,
    /// The confirmed (or degraded-to) transport mode.
    pub transport: Option<TransportMode>,
    /// Whether a structured-output probe succeeded.
    pub structured_output: bool,
}

impl Capability {
    /// Capability for a backend whose executable is missing.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            transport: None,
            structured_output: false,
        }
    }
}

/// Locates an executable, either as an explicit path or on PATH.
pub fn locate_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(name);
        if is_executable(&full) {
            return Some(full);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Probes and caches backend capabilities.
pub struct CapabilityProber {
    cache: HashMap<BackendKind, Capability>,
    warned: HashSet<String>,
    timeout: Duration,
}

impl CapabilityProber {
    /// Creates a prober with the given per-probe timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            cache: HashMap::new(),
            warned: HashSet::new(),
            timeout,
        }
    }

    /// Emits a diagnostic once per distinct reason per process lifetime.
    fn warn_once(&mut self, reason: String) {
        if self.warned.insert(reason.clone()) {
            tracing::warn!("{}", reason);
        }
    }

    /// Probes a backend, returning the cached result on repeat calls.
    pub async fn probe(&mut self, backend: &Backend) -> Result<Capability> {
        if let Some(capability) = self.cache.get(&backend.kind) {
            return Ok(*capability);
        }
        let capability = self.probe_uncached(backend).await?;
        self.cache.insert(backend.kind, capability);
        Ok(capability)
    }

    async fn probe_uncached(&mut self, backend: &Backend) -> Result<Capability> {
        let name = backend.kind.as_str();

        // Missing executable is deterministic; no probing, no retries.
        if locate_executable(&backend.cli_path).is_none() {
            self.warn_once(format!("backend '{}' executable not found on PATH", name));
            return Ok(Capability::unavailable());
        }

        let mut confirmed: Option<TransportMode> = None;
        for &mode in backend.kind.transport_preference() {
            match self.try_transport(backend, mode).await {
                Ok(true) => {
                    tracing::info!(backend = name, transport = mode.as_str(), "transport confirmed");
                    confirmed = Some(mode);
                    break;
                }
                Ok(false) => {
                    self.warn_once(format!(
                        "backend '{}' did not echo the probe token over {} transport",
                        name,
                        mode.as_str()
                    ));
                }
                Err(e) => {
                    self.warn_once(format!(
                        "backend '{}' probe failed over {} transport: {}",
                        name,
                        mode.as_str(),
                        e
                    ));
                }
            }
        }

        let transport = match confirmed {
            Some(mode) => mode,
            None if backend.kind.requires_stream() => {
                return Err(Error::Config(format!(
                    "backend '{}' requires stream transport but no stream mode responded",
                    name
                )));
            }
            None => {
                let fallback = backend.kind.transport_preference()[0];
                self.warn_once(format!(
                    "backend '{}' failed all transport probes; degrading to {} transport",
                    name,
                    fallback.as_str()
                ));
                fallback
            }
        };

        let structured_output = if backend.kind.expects_structured_output() {
            match self.try_structured(backend, transport).await {
                Ok(true) => true,
                Ok(false) => {
                    self.warn_once(format!(
                        "backend '{}' structured output probe did not parse; using text extraction",
                        name
                    ));
                    false
                }
                Err(e) => {
                    self.warn_once(format!(
                        "backend '{}' structured output probe failed: {}",
                        name, e
                    ));
                    false
                }
            }
        } else {
            false
        };

        Ok(Capability {
            available: true,
            transport: Some(transport),
            structured_output,
        })
    }

    /// Sends the probe prompt over one transport and checks for the token.
    async fn try_transport(&self, backend: &Backend, mode: TransportMode) -> Result<bool> {
        let args = backend.build_args(mode, false);
        let raw = run_transport(&backend.cli_path, &args, mode, PROBE_PROMPT, self.timeout).await?;
        Ok(raw.code == Some(0) && raw.stdout.contains(PROBE_TOKEN))
    }

    /// Probes structured output over the already-confirmed transport.
    ///
    /// Success requires the full stdout to parse as a single JSON object.
    async fn try_structured(&self, backend: &Backend, mode: TransportMode) -> Result<bool> {
        let args = backend.build_args(mode, true);
        let raw = run_transport(&backend.cli_path, &args, mode, PROBE_PROMPT, self.timeout).await?;
        if raw.code != Some(0) {
            return Ok(false);
        }
        Ok(serde_json::from_str::<Value>(raw.stdout.trim())
            .map(|v| v.is_object())
            .unwrap_or(false))
    }
}
