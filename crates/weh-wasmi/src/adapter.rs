//! [`EngineAdapter`] implementation for wasmi.

use tracing::{debug, info, instrument};
use wasmi::{ExternType, FuncRef, Memory, Store, Table, Val};

use weh_common::RuntimeError;
use weh_common::abi::EMSCRIPTEN_MODULE;
use weh_core::{EngineAdapter, HostContext, HostFunctionDescriptor, ImportSpec, MEMORY_IMPORT, TABLE_IMPORT};

use crate::engine::WasmiEngine;
use crate::instance::WasmiInstance;
use crate::linker::{self, WasmiImports, interrupt_from_error};
use crate::module::WasmiModule;
use crate::store::StoreData;

/// Runs modules on the wasmi interpreter.
#[derive(Debug, Clone)]
pub struct WasmiAdapter {
    engine: WasmiEngine,
}

impl WasmiAdapter {
    /// Create an adapter over `engine`.
    pub fn new(engine: WasmiEngine) -> Self {
        Self { engine }
    }

    /// The engine modules are compiled with.
    pub fn engine(&self) -> &WasmiEngine {
        &self.engine
    }
}

impl EngineAdapter for WasmiAdapter {
    type Module = WasmiModule;
    type Imports = WasmiImports;
    type Instance = WasmiInstance;

    fn name(&self) -> &'static str {
        "wasmi"
    }

    fn compile(&self, bytes: &[u8]) -> Result<WasmiModule, RuntimeError> {
        WasmiModule::compile(self.engine.inner(), bytes)
    }

    fn imports(&self, module: &WasmiModule) -> Vec<ImportSpec> {
        module.imports()
    }

    fn install(&self, functions: &[HostFunctionDescriptor]) -> Result<WasmiImports, RuntimeError> {
        linker::install(self.engine.inner(), functions)
    }

    #[instrument(skip_all, fields(module = %module.content_hash()))]
    fn bind(&self, imports: WasmiImports, module: &WasmiModule, context: HostContext) -> Result<WasmiInstance, RuntimeError> {
        let mut linker = imports.linker;
        let mut store = Store::new(self.engine.inner(), StoreData::new(context));
        if let Some(fuel) = self.engine.config().fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
        }

        for import in module.as_module().imports() {
            let (name, module_name) = (import.name(), import.module());
            if module_name != EMSCRIPTEN_MODULE {
                continue;
            }
            let linkage = |reason: String| RuntimeError::linkage(module_name, name, reason);
            match import.ty() {
                ExternType::Memory(ty) if name == MEMORY_IMPORT => {
                    let memory = Memory::new(&mut store, *ty).map_err(|e| linkage(e.to_string()))?;
                    linker
                        .define(module_name, name, memory)
                        .map_err(|e| linkage(e.to_string()))?;
                    store.data_mut().memory = Some(memory);
                    debug!("Created imported memory");
                }
                ExternType::Table(ty) if name == TABLE_IMPORT => {
                    let table = Table::new(&mut store, *ty, Val::FuncRef(FuncRef::null()))
                        .map_err(|e| linkage(e.to_string()))?;
                    linker
                        .define(module_name, name, table)
                        .map_err(|e| linkage(e.to_string()))?;
                    store.data_mut().table = Some(table);
                    debug!("Created imported table");
                }
                _ => {}
            }
        }

        for import in module.as_module().imports() {
            if linker.get(&store, import.module(), import.name()).is_none() {
                return Err(RuntimeError::linkage(
                    import.module(),
                    import.name(),
                    "not defined in the linker",
                ));
            }
        }

        let pre = linker
            .instantiate(&mut store, module.as_module())
            .map_err(|e| RuntimeError::compilation_failed(format!("Instantiation failed: {e}")))?;
        let instance = pre
            .start(&mut store)
            .map_err(|e| RuntimeError::startup("start function", interrupt_from_error(&e)))?;

        info!("Module instantiated");
        Ok(WasmiInstance::new(store, instance))
    }
}
