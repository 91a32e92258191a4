//! Configuration structures for weh.
//!
//! This module defines configuration options for the two halves of an
//! embedding:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Engine selection and resource limits (fuel, epochs)
//! - [`HostConfig`]: Guest-visible environment (args, env, filesystem sandbox)

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// It can be loaded from files (TOML, JSON) or assembled from CLI flags.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Embedder host configuration.
    #[serde(default)]
    pub host: HostConfig,
}

/// Which engine adapter executes the module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Cranelift-based JIT engine (two-phase linking).
    #[default]
    Wasmtime,
    /// Bytecode interpreter.
    Wasmi,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Wasmtime => write!(f, "wasmtime"),
            EngineKind::Wasmi => write!(f, "wasmi"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wasmtime" => Ok(Self::Wasmtime),
            "wasmi" => Ok(Self::Wasmi),
            other => Err(format!("unknown engine '{other}' (expected wasmtime or wasmi)")),
        }
    }
}

/// Engine configuration.
///
/// Resource limits are optional; an unset limit means the guest runs until
/// it returns, exits, or traps.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Engine used to execute modules.
    #[serde(default)]
    pub kind: EngineKind,

    /// Fuel budget per execution. `None` disables fuel metering.
    #[serde(default)]
    pub fuel: Option<u64>,

    /// Enable epoch-based interruption (wasmtime only).
    ///
    /// The embedder must tick the engine epoch once per millisecond for
    /// `timeout_ms` to mean wall-clock milliseconds.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Execution timeout in milliseconds, counted in epoch ticks.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            fuel: None,
            epoch_interruption: defaults::epoch_interruption(),
            timeout_ms: defaults::timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Guest-visible environment of the embedder host.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HostConfig {
    /// Command-line arguments; the first one is the program name.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables exposed to the guest.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Expose the embedding process environment in addition to `env`.
    #[serde(default)]
    pub inherit_env: bool,

    /// Filesystem sandbox.
    #[serde(default)]
    pub filesystem: FilesystemConfig,
}

/// Filesystem sandbox posture.
///
/// Exactly one posture applies: a list of preopened directories, or
/// unrestricted access to the host filesystem rooted at `/`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilesystemConfig {
    /// Preopened directories, in guest fd order starting at 3.
    #[serde(default)]
    pub preopens: Vec<PreopenEntry>,

    /// Allow access to the whole host filesystem.
    #[serde(default)]
    pub unrestricted: bool,

    /// How symlinks met during path resolution are treated.
    #[serde(default)]
    pub symlinks: SymlinkPolicy,

    /// Working directory reported to Emscripten guests (`getcwd`).
    #[serde(default)]
    pub current_working_directory: Option<String>,
}

impl FilesystemConfig {
    /// Returns `true` if the guest has no filesystem access at all.
    pub fn is_empty(&self) -> bool {
        self.preopens.is_empty() && !self.unrestricted
    }
}

/// A host directory exposed to the guest under a mount name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PreopenEntry {
    /// Directory on the host.
    pub host_path: String,

    /// Name the guest sees (e.g. `/data` or `.`).
    pub guest_path: String,
}

impl PreopenEntry {
    /// Create a new preopen entry.
    pub fn new(host_path: impl Into<String>, guest_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            guest_path: guest_path.into(),
        }
    }
}

impl FromStr for PreopenEntry {
    type Err = String;

    /// Parse `HOST::GUEST`, or a bare `DIR` mounted under the same name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("::") {
            Some((host, guest)) if !host.is_empty() && !guest.is_empty() => {
                Ok(Self::new(host, guest))
            }
            Some(_) => Err(format!("invalid preopen '{s}' (expected HOST::GUEST)")),
            None if s.is_empty() => Err("empty preopen".to_string()),
            None => Ok(Self::new(s, s)),
        }
    }
}

/// Symlink handling during path resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkPolicy {
    /// Refuse every symlink encountered.
    Deny,
    /// Follow symlinks whose canonical target stays inside the preopen.
    #[default]
    WithinRoot,
}

/// Default value functions for serde.
mod defaults {
    pub const fn epoch_interruption() -> bool {
        false
    }

    pub const fn timeout_ms() -> u64 {
        30_000
    }
}
