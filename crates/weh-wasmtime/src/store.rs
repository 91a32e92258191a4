//! Per-instance store state.

use wasmtime::{Memory, Store, Table};

use weh_core::HostContext;

/// Data owned by every `Store` this adapter creates.
///
/// Host functions reach it through [`wasmtime::Caller`]. `memory` and `table`
/// are set as soon as they are known: imported ones before instantiation,
/// exported ones right after.
pub struct StoreData {
    /// The engine-neutral host context.
    pub ctx: HostContext,

    /// Linear memory of the instance.
    pub(crate) memory: Option<Memory>,

    /// Indirect function table of the instance.
    pub(crate) table: Option<Table>,
}

impl StoreData {
    /// Wrap a host context; memory and table are attached later.
    pub fn new(ctx: HostContext) -> Self {
        Self {
            ctx,
            memory: None,
            table: None,
        }
    }
}

impl std::fmt::Debug for StoreData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreData")
            .field("ctx", &self.ctx)
            .field("has_memory", &self.memory.is_some())
            .field("has_table", &self.table.is_some())
            .finish()
    }
}

/// Get remaining fuel from a store.
///
/// Returns `None` if fuel metering is not enabled.
pub fn get_remaining_fuel<T>(store: &Store<T>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed since `initial_fuel`.
pub fn calculate_fuel_consumed<T>(initial_fuel: u64, store: &Store<T>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
