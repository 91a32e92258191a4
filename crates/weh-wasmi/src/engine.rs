//! wasmi engine configuration.
//!
//! The interpreter has no epoch interruption; fuel is the only way to bound
//! execution.

use tracing::{info, warn};
use wasmi::{Config, Engine};

use weh_common::EngineConfig;

/// wasmi engine plus the configuration it was built from.
///
/// Cloning is cheap; the wasmi engine is reference counted.
#[derive(Clone)]
pub struct WasmiEngine {
    engine: Engine,
    config: EngineConfig,
}

impl WasmiEngine {
    /// Create a new engine with the given configuration.
    pub fn new(config: &EngineConfig) -> Self {
        let mut wasmi_config = Config::default();
        if config.fuel.is_some() {
            wasmi_config.consume_fuel(true);
        }
        if config.epoch_interruption {
            warn!("Epoch interruption is not supported by wasmi; use fuel to bound execution");
        }

        info!(fuel = ?config.fuel, "wasmi engine initialized");
        Self {
            engine: Engine::new(&wasmi_config),
            config: config.clone(),
        }
    }

    /// Get a reference to the inner wasmi engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl std::fmt::Debug for WasmiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmiEngine")
            .field("fuel", &self.config.fuel)
            .finish_non_exhaustive()
    }
}
