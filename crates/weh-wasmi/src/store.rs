//! Per-instance store state.

use wasmi::{Memory, Table};

use weh_core::HostContext;

/// Data owned by every `Store` this adapter creates.
pub struct StoreData {
    /// The engine-neutral host context.
    pub ctx: HostContext,
    pub(crate) memory: Option<Memory>,
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
