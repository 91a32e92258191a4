//! [`EngineAdapter`] implementation for Wasmtime.
//!
//! Linking is two-phase: [`install`](EngineAdapter::install) builds a
//! `Linker` with no host attached, [`bind`](EngineAdapter::bind) creates the
//! store that owns the host context, defines the `env` memory and table the
//! module asks for, and instantiates.

use tracing::{debug, info, instrument};
use wasmtime::{ExternType, Memory, Ref, Store, Table};
use wasmtime_wasi::I32Exit;

use weh_common::abi::EMSCRIPTEN_MODULE;
use weh_common::{GuestTrap, RuntimeError};
use weh_core::{EngineAdapter, HostContext, HostFunctionDescriptor, ImportSpec, MEMORY_IMPORT, TABLE_IMPORT};

use crate::instance::WasmtimeInstance;
use crate::linker::{self, WasmtimeImports, interrupt_from_error};
use crate::module::CompiledModule;
use crate::store::StoreData;
use crate::engine::WasmtimeEngine;

/// Runs modules on Wasmtime.
#[derive(Debug, Clone)]
pub struct WasmtimeAdapter {
    engine: WasmtimeEngine,
}

impl WasmtimeAdapter {
    /// Create an adapter over `engine`.
    pub fn new(engine: WasmtimeEngine) -> Self {
        Self { engine }
    }

    /// The engine modules are compiled with.
    pub fn engine(&self) -> &WasmtimeEngine {
        &self.engine
    }

    fn new_store(&self, context: HostContext) -> Result<Store<StoreData>, RuntimeError> {
        let config = self.engine.config();
        let mut store = Store::new(self.engine.inner(), StoreData::new(context));

        if let Some(fuel) = config.fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
        }
        if config.epoch_interruption {
            store.set_epoch_deadline(config.timeout_ms);
            store.epoch_deadline_trap();
        }
        Ok(store)
    }
}

impl EngineAdapter for WasmtimeAdapter {
    type Module = CompiledModule;
    type Imports = WasmtimeImports;
    type Instance = WasmtimeInstance;

    fn name(&self) -> &'static str {
        "wasmtime"
    }

    fn compile(&self, bytes: &[u8]) -> Result<CompiledModule, RuntimeError> {
        CompiledModule::compile(self.engine.inner(), bytes)
    }

    fn imports(&self, module: &CompiledModule) -> Vec<ImportSpec> {
        module.imports()
    }

    fn install(&self, functions: &[HostFunctionDescriptor]) -> Result<WasmtimeImports, RuntimeError> {
        linker::install(self.engine.inner(), functions)
    }

    #[instrument(skip_all, fields(module = %module.content_hash()))]
    fn bind(
        &self,
        imports: WasmtimeImports,
        module: &CompiledModule,
        context: HostContext,
    ) -> Result<WasmtimeInstance, RuntimeError> {
        let mut linker = imports.linker;
        let mut store = self.new_store(context)?;

        for import in module.as_module().imports() {
            let (name, module_name) = (import.name(), import.module());
            if module_name != EMSCRIPTEN_MODULE {
                continue;
            }
            let linkage = |e: anyhow::Error| RuntimeError::linkage(module_name, name, e.to_string());
            match import.ty() {
                ExternType::Memory(ty) if name == MEMORY_IMPORT => {
                    let memory = Memory::new(&mut store, ty).map_err(linkage)?;
                    linker.define(&store, module_name, name, memory).map_err(linkage)?;
                    store.data_mut().memory = Some(memory);
                    debug!("Created imported memory");
                }
                ExternType::Table(ty) if name == TABLE_IMPORT => {
                    let table = Table::new(&mut store, ty, Ref::Func(None)).map_err(linkage)?;
                    linker.define(&store, module_name, name, table).map_err(linkage)?;
                    store.data_mut().table = Some(table);
                    debug!("Created imported table");
                }
                _ => {}
            }
        }

        // Name the offending import before anything is instantiated.
        for import in module.as_module().imports() {
            if linker.get_by_import(&mut store, &import).is_none() {
                return Err(RuntimeError::linkage(
                    import.module(),
                    import.name(),
                    "not defined in the linker",
                ));
            }
        }

        let instance = linker.instantiate(&mut store, module.as_module()).map_err(|e| {
            if e.is::<wasmtime::Trap>() || e.is::<I32Exit>() || e.is::<GuestTrap>() {
                RuntimeError::startup("start function", interrupt_from_error(&e))
            } else {
                RuntimeError::compilation_failed(format!("Instantiation failed: {e}"))
            }
        })?;

        info!("Module instantiated");
        Ok(WasmtimeInstance::new(store, instance))
    }
}
