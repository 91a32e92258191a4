//! Wasmtime engine configuration and creation.
//!
//! The [`WasmtimeEngine`] is shared by every module and store it creates. It is:
//! - Thread-safe and cheap to clone
//! - Set up with fuel metering and epoch interruption when the
//!   [`EngineConfig`] asks for them

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, OptLevel};

use weh_common::{EngineConfig, RuntimeError};

/// Thread-safe Wasmtime engine wrapper.
///
/// # Example
///
/// ```ignore
/// use weh_common::EngineConfig;
/// use weh_wasmtime::WasmtimeEngine;
///
/// let engine = WasmtimeEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmtimeEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmtimeEngine {
    /// Create a new engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid.
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        if config.fuel.is_some() {
            wasmtime_config.consume_fuel(true);
        }
        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }
        wasmtime_config.cranelift_opt_level(OptLevel::Speed);

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            fuel = ?config.fuel,
            epoch_interruption = config.epoch_interruption,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    ///
    /// Call this once per millisecond so `timeout_ms` is wall-clock time.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Returns `true` if stores from this engine get a fuel budget.
    pub fn is_fuel_enabled(&self) -> bool {
        self.config.fuel.is_some()
    }
}

impl std::fmt::Debug for WasmtimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeEngine")
            .field("fuel", &self.config.fuel)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("timeout_ms", &self.config.timeout_ms)
            .finish_non_exhaustive()
    }
}
