//! Configuration file structures for weh.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ModuleEntry`]: The module to run and its entry point

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// kind = "wasmi"
/// fuel = 10_000_000
///
/// [runtime.host]
/// args = ["hello", "--verbose"]
///
/// [runtime.host.env]
/// RUST_BACKTRACE = "1"
///
/// [runtime.host.filesystem]
/// symlinks = "deny"
///
/// [[runtime.host.filesystem.preopens]]
/// host_path = "./sandbox"
/// guest_path = "/data"
///
/// [module]
/// path = "./hello.wasm"
/// entry = "main"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine + host settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Module to run when none is given on the command line.
    #[serde(default)]
    pub module: Option<ModuleEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// The module to run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Path to the WebAssembly module file (binary or text format).
    pub path: String,

    /// Exported function to call: `_start` for WASI commands, `main` for
    /// Emscripten-style modules, or any other nullary export.
    #[serde(default = "defaults::entry")]
    pub entry: String,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn entry() -> String {
        "_start".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineKind, SymlinkPolicy};

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(config.module.is_none());
        assert_eq!(config.runtime.engine.kind, EngineKind::Wasmtime);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [module]
            path = "./hello.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();
        let module = config.module.unwrap();

        assert_eq!(module.path, "./hello.wasm");
        // Defaults applied
        assert_eq!(module.entry, "_start");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.engine]
            kind = "wasmi"
            fuel = 5_000_000
            timeout_ms = 50

            [runtime.host]
            args = ["prog", "-v"]
            inherit_env = false

            [runtime.host.env]
            HOME = "/home/guest"

            [runtime.host.filesystem]
            symlinks = "deny"
            current_working_directory = "/data"

            [[runtime.host.filesystem.preopens]]
            host_path = "./sandbox"
            guest_path = "/data"

            [[runtime.host.filesystem.preopens]]
            host_path = "./tmp"
            guest_path = "/tmp"

            [module]
            path = "./app.wasm"
            entry = "main"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.runtime.engine.kind, EngineKind::Wasmi);
        assert_eq!(config.runtime.engine.fuel, Some(5_000_000));
        assert_eq!(config.runtime.engine.timeout_ms, 50);
        assert_eq!(config.runtime.host.args, vec!["prog", "-v"]);
        assert_eq!(
            config.runtime.host.env.get("HOME").map(String::as_str),
            Some("/home/guest")
        );

        let fs = &config.runtime.host.filesystem;
        assert_eq!(fs.symlinks, SymlinkPolicy::Deny);
        assert_eq!(fs.current_working_directory.as_deref(), Some("/data"));
        assert_eq!(fs.preopens.len(), 2);
        assert_eq!(fs.preopens[1].guest_path, "/tmp");

        let module = config.module.unwrap();
        assert_eq!(module.entry, "main");
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/nonexistent/weh.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
