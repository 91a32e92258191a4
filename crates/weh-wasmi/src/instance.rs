//! Guest views over wasmi instances.

use tracing::warn;
use wasmi::{AsContextMut, Caller, Extern, Func, Instance, Memory, Store, Table};

use weh_common::{GuestTrap, Interrupt};
use weh_core::{GuestEnv, GuestInstance, HostContext, MEMORY_IMPORT, MemoryView, Signature, TABLE_IMPORT, WasmValue};

use crate::linker::{from_val, interrupt_from_error, is_out_of_fuel, to_val, zero_val};
use crate::module::signature;
use crate::store::StoreData;

/// A host function's view of the calling instance.
pub(crate) struct CallerEnv<'a, 'c> {
    caller: &'a mut Caller<'c, StoreData>,
}

impl<'a, 'c> CallerEnv<'a, 'c> {
    pub(crate) fn new(caller: &'a mut Caller<'c, StoreData>) -> Self {
        Self { caller }
    }

    fn func(&self, name: &str) -> Option<Func> {
        self.caller.get_export(name).and_then(Extern::into_func)
    }

    // Host calls from a start function run before the exports are recorded.
    fn linear_memory(&self) -> Option<Memory> {
        self.caller
            .data()
            .memory
            .or_else(|| self.caller.get_export(MEMORY_IMPORT).and_then(Extern::into_memory))
    }

    fn table(&self) -> Option<Table> {
        self.caller
            .data()
            .table
            .or_else(|| self.caller.get_export(TABLE_IMPORT).and_then(Extern::into_table))
    }
}

impl GuestEnv for CallerEnv<'_, '_> {
    fn context(&mut self) -> &mut HostContext {
        &mut self.caller.data_mut().ctx
    }

    fn memory(&mut self) -> Result<(&mut HostContext, MemoryView<'_>), GuestTrap> {
        let memory = self.linear_memory().ok_or(GuestTrap::MissingMemory)?;
        let (data, store) = memory.data_and_store_mut(&mut *self.caller);
        Ok((&mut store.ctx, MemoryView::new(data)))
    }

    fn grow_memory(&mut self, delta_pages: u64) -> Result<Option<u64>, GuestTrap> {
        let memory = self.linear_memory().ok_or(GuestTrap::MissingMemory)?;
        Ok(grow(&mut *self.caller, memory, delta_pages))
    }

    fn has_export(&mut self, name: &str) -> bool {
        self.func(name).is_some()
    }

    fn call_export(&mut self, name: &str, args: &[WasmValue]) -> Result<Option<WasmValue>, Interrupt> {
        let func = self.func(name).ok_or_else(|| missing_export(name))?;
        call_func(&mut *self.caller, &func, args)
    }

    fn call_indirect(&mut self, index: u32, args: &[WasmValue]) -> Result<Option<WasmValue>, Interrupt> {
        let table = self.table().ok_or_else(|| missing_export(TABLE_IMPORT))?;
        call_table(&mut *self.caller, table, index, args)
    }
}

/// A live module instance and the store that owns it.
pub struct WasmiInstance {
    store: Store<StoreData>,
    instance: Instance,
    initial_fuel: Option<u64>,
}

impl WasmiInstance {
    pub(crate) fn new(mut store: Store<StoreData>, instance: Instance) -> Self {
        if store.data().memory.is_none() {
            store.data_mut().memory = instance.get_memory(&store, MEMORY_IMPORT);
        }
        if store.data().table.is_none() {
            store.data_mut().table = instance.get_table(&store, TABLE_IMPORT);
        }
        let initial_fuel = store.get_fuel().ok();
        Self {
            store,
            instance,
            initial_fuel,
        }
    }

    /// Fuel consumed since instantiation, if fuel metering is enabled.
    pub fn fuel_consumed(&self) -> Option<u64> {
        let initial = self.initial_fuel?;
        let remaining = self.store.get_fuel().ok()?;
        Some(initial.saturating_sub(remaining))
    }

    fn func(&self, name: &str) -> Option<Func> {
        self.instance.get_func(&self.store, name)
    }
}

impl GuestEnv for WasmiInstance {
    fn context(&mut self) -> &mut HostContext {
        &mut self.store.data_mut().ctx
    }

    fn memory(&mut self) -> Result<(&mut HostContext, MemoryView<'_>), GuestTrap> {
        let memory = self.store.data().memory.ok_or(GuestTrap::MissingMemory)?;
        let (data, store) = memory.data_and_store_mut(&mut self.store);
        Ok((&mut store.ctx, MemoryView::new(data)))
    }

    fn grow_memory(&mut self, delta_pages: u64) -> Result<Option<u64>, GuestTrap> {
        let memory = self.store.data().memory.ok_or(GuestTrap::MissingMemory)?;
        Ok(grow(&mut self.store, memory, delta_pages))
    }

    fn has_export(&mut self, name: &str) -> bool {
        self.func(name).is_some()
    }

    fn call_export(&mut self, name: &str, args: &[WasmValue]) -> Result<Option<WasmValue>, Interrupt> {
        let func = self.func(name).ok_or_else(|| missing_export(name))?;
        call_func(&mut self.store, &func, args)
    }

    fn call_indirect(&mut self, index: u32, args: &[WasmValue]) -> Result<Option<WasmValue>, Interrupt> {
        let table = self.store.data().table.ok_or_else(|| missing_export(TABLE_IMPORT))?;
        call_table(&mut self.store, table, index, args)
    }
}

impl GuestInstance for WasmiInstance {
    fn engine_name(&self) -> &'static str {
        "wasmi"
    }

    fn export_signature(&mut self, name: &str) -> Option<Signature> {
        let func = self.func(name)?;
        signature(&func.ty(&self.store))
    }
}

impl std::fmt::Debug for WasmiInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmiInstance")
            .field("data", self.store.data())
            .field("fuel_consumed", &self.fuel_consumed())
            .finish_non_exhaustive()
    }
}

fn missing_export(name: &str) -> Interrupt {
    GuestTrap::Engine {
        message: format!("instance has no export named {name}"),
        code: None,
    }
    .into()
}

fn grow(mut store: impl AsContextMut, memory: Memory, delta_pages: u64) -> Option<u64> {
    let Ok(delta) = delta_pages.try_into() else {
        warn!(delta_pages, "Memory growth refused: delta too large");
        return None;
    };
    match memory.grow(&mut store, delta) {
        Ok(previous) => Some(u64::from(previous)),
        Err(e) => {
            warn!(delta_pages, error = %e, "Memory growth refused");
            None
        }
    }
}

fn call_func(
    mut store: impl AsContextMut,
    func: &Func,
    args: &[WasmValue],
) -> Result<Option<WasmValue>, Interrupt> {
    let ty = func.ty(&store);
    let params: Vec<_> = args.iter().copied().map(to_val).collect();
    let mut results: Vec<_> = ty.results().iter().map(zero_val).collect();

    if let Err(error) = func.call(&mut store, &params, &mut results) {
        if is_out_of_fuel(&error) {
            warn!("Execution terminated: fuel exhausted");
        }
        return Err(interrupt_from_error(&error));
    }
    Ok(results.first().and_then(from_val))
}

fn call_table(
    mut store: impl AsContextMut,
    table: Table,
    index: u32,
    args: &[WasmValue],
) -> Result<Option<WasmValue>, Interrupt> {
    let func = match table.get(&store, index.into()) {
        Some(entry) => match entry.funcref().and_then(|r| r.func().copied()) {
            Some(func) => func,
            None => {
                return Err(GuestTrap::Engine {
                    message: format!("uninitialized element {index}"),
                    code: Some("IndirectCallToNull".to_string()),
                }
                .into());
            }
        },
        None => {
            return Err(GuestTrap::Engine {
                message: format!("undefined element: out of bounds table access at {index}"),
                code: Some("TableOutOfBounds".to_string()),
            }
            .into());
        }
    };
    call_func(&mut store, &func, args)
}
