//! Guest views over Wasmtime instances.
//!
//! - [`CallerEnv`]: what a host function sees while the guest is calling it
//! - [`WasmtimeInstance`]: a live instance driven from outside the guest
//!
//! Both implement [`GuestEnv`]; memory and table handles live in
//! [`StoreData`] so imported and exported ones are found the same way.

use tracing::warn;
use wasmtime::{AsContextMut, Caller, Extern, Func, Instance, Memory, Ref, Store, Table};

use weh_common::{GuestTrap, Interrupt};
use weh_core::{GuestEnv, GuestInstance, HostContext, MEMORY_IMPORT, MemoryView, Signature, TABLE_IMPORT, WasmValue};

use crate::linker::{from_val, interrupt_from_error, is_out_of_fuel, to_val, zero_val};
use crate::module::signature;
use crate::store::{StoreData, calculate_fuel_consumed, get_remaining_fuel};

/// A host function's view of the calling instance.
pub(crate) struct CallerEnv<'a, 'c> {
    caller: &'a mut Caller<'c, StoreData>,
}

impl<'a, 'c> CallerEnv<'a, 'c> {
    pub(crate) fn new(caller: &'a mut Caller<'c, StoreData>) -> Self {
        Self { caller }
    }

    fn func(&mut self, name: &str) -> Option<Func> {
        self.caller.get_export(name).and_then(Extern::into_func)
    }

    /// The instance memory, looked up by export name while it is not yet
    /// recorded (host calls from a start function).
    fn linear_memory(&mut self) -> Option<Memory> {
        self.caller
            .data()
            .memory
            .or_else(|| self.caller.get_export(MEMORY_IMPORT).and_then(Extern::into_memory))
    }

    fn table(&mut self) -> Option<Table> {
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
pub struct WasmtimeInstance {
    store: Store<StoreData>,
    instance: Instance,
    initial_fuel: Option<u64>,
}

impl WasmtimeInstance {
    pub(crate) fn new(mut store: Store<StoreData>, instance: Instance) -> Self {
        if store.data().memory.is_none() {
            store.data_mut().memory = instance.get_memory(&mut store, MEMORY_IMPORT);
        }
        if store.data().table.is_none() {
            store.data_mut().table = instance.get_table(&mut store, TABLE_IMPORT);
        }
        let initial_fuel = get_remaining_fuel(&store);
        Self {
            store,
            instance,
            initial_fuel,
        }
    }

    /// Fuel consumed since instantiation, if fuel metering is enabled.
    pub fn fuel_consumed(&self) -> Option<u64> {
        self.initial_fuel
            .map(|initial| calculate_fuel_consumed(initial, &self.store))
    }

    /// The underlying store.
    pub fn store(&self) -> &Store<StoreData> {
        &self.store
    }

    fn func(&mut self, name: &str) -> Option<Func> {
        self.instance.get_func(&mut self.store, name)
    }
}

impl GuestEnv for WasmtimeInstance {
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

impl GuestInstance for WasmtimeInstance {
    fn engine_name(&self) -> &'static str {
        "wasmtime"
    }

    fn export_signature(&mut self, name: &str) -> Option<Signature> {
        let func = self.func(name)?;
        signature(&func.ty(&self.store))
    }
}

impl std::fmt::Debug for WasmtimeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeInstance")
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

fn grow(mut store: impl AsContextMut<Data = StoreData>, memory: Memory, delta_pages: u64) -> Option<u64> {
    match memory.grow(&mut store, delta_pages) {
        Ok(previous) => Some(previous),
        Err(e) => {
            warn!(delta_pages, error = %e, "Memory growth refused");
            None
        }
    }
}

/// Call `func`, translating values and interrupts.
fn call_func(
    mut store: impl AsContextMut<Data = StoreData>,
    func: &Func,
    args: &[WasmValue],
) -> Result<Option<WasmValue>, Interrupt> {
    let ty = func.ty(&store);
    let params: Vec<_> = args.iter().copied().map(to_val).collect();
    let mut results: Vec<_> = ty.results().map(|t| zero_val(&t)).collect();

    if let Err(error) = func.call(&mut store, &params, &mut results) {
        if is_out_of_fuel(&error) {
            warn!("Execution terminated: fuel exhausted");
        }
        return Err(interrupt_from_error(&error));
    }
    Ok(results.first().and_then(from_val))
}

fn call_table(
    mut store: impl AsContextMut<Data = StoreData>,
    table: Table,
    index: u32,
    args: &[WasmValue],
) -> Result<Option<WasmValue>, Interrupt> {
    let func = match table.get(&mut store, u64::from(index)) {
        Some(Ref::Func(Some(func))) => func,
        Some(_) => {
            return Err(GuestTrap::Engine {
                message: format!("uninitialized element {index}"),
                code: Some("IndirectCallToNull".to_string()),
            }
            .into());
        }
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
