//! Host function descriptors and the import link check.
//!
//! The WASI table and the Emscripten shim both produce
//! [`HostFunctionDescriptor`]s. Engine adapters consume them without knowing
//! which component produced them. [`check_imports`] matches a module's
//! declared imports against the descriptors before anything is instantiated.

use std::fmt;
use std::sync::Arc;

use tracing::warn;
use weh_common::abi::EMSCRIPTEN_MODULE;
use weh_common::{Interrupt, RuntimeError};

use crate::context::GuestEnv;
use crate::value::{Signature, WasmValue};

/// Import name of the linear memory an Emscripten module may import.
pub const MEMORY_IMPORT: &str = "memory";

/// Import name of the indirect function table an Emscripten module may import.
pub const TABLE_IMPORT: &str = "__indirect_function_table";

/// Result of a host function: at most one value, or an interrupt.
pub type HostResult = Result<Option<WasmValue>, Interrupt>;

/// Engine-neutral host function implementation.
pub type HostCallback = Arc<dyn Fn(&mut dyn GuestEnv, &[WasmValue]) -> HostResult + Send + Sync>;

/// One host import: namespace, field name, signature and implementation.
///
/// Immutable once constructed; cloning shares the implementation.
#[derive(Clone)]
pub struct HostFunctionDescriptor {
    module: String,
    name: String,
    signature: Signature,
    callback: HostCallback,
}

impl HostFunctionDescriptor {
    /// Create a descriptor.
    pub fn new<F>(module: impl Into<String>, name: impl Into<String>, signature: Signature, callback: F) -> Self
    where
        F: Fn(&mut dyn GuestEnv, &[WasmValue]) -> HostResult + Send + Sync + 'static,
    {
        Self {
            module: module.into(),
            name: name.into(),
            signature,
            callback: Arc::new(callback),
        }
    }

    /// Import namespace.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Import field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Function signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Shared handle to the implementation.
    pub fn callback(&self) -> HostCallback {
        Arc::clone(&self.callback)
    }

    /// Invoke the implementation.
    pub fn call(&self, env: &mut dyn GuestEnv, args: &[WasmValue]) -> HostResult {
        (self.callback)(env, args)
    }
}

impl fmt::Debug for HostFunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunctionDescriptor")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Kind of a module import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportKind {
    /// A function with the given signature.
    Function(Signature),
    /// A linear memory.
    Memory,
    /// A table.
    Table,
    /// A global.
    Global,
    /// Anything the host ABI cannot express (tags, `v128` or reference
    /// typed functions), described for diagnostics.
    Other(String),
}

impl fmt::Display for ImportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportKind::Function(sig) => write!(f, "func {sig}"),
            ImportKind::Memory => f.write_str("memory"),
            ImportKind::Table => f.write_str("table"),
            ImportKind::Global => f.write_str("global"),
            ImportKind::Other(description) => f.write_str(description),
        }
    }
}

/// An import declared by a compiled module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    /// Import namespace.
    pub module: String,
    /// Import field name.
    pub name: String,
    /// What is imported.
    pub kind: ImportKind,
}

impl ImportSpec {
    /// Create an import spec.
    pub fn new(module: impl Into<String>, name: impl Into<String>, kind: ImportKind) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            kind,
        }
    }

    /// Returns `true` if this is the Emscripten memory import.
    pub fn is_env_memory(&self) -> bool {
        self.module == EMSCRIPTEN_MODULE && self.name == MEMORY_IMPORT && self.kind == ImportKind::Memory
    }

    /// Returns `true` if this is the Emscripten function table import.
    pub fn is_env_table(&self) -> bool {
        self.module == EMSCRIPTEN_MODULE && self.name == TABLE_IMPORT && self.kind == ImportKind::Table
    }
}

/// Check that every declared import is satisfied.
///
/// Functions must be provided by a descriptor with an identical signature.
/// `env.memory` and `env.__indirect_function_table` are created by the
/// adapter. Anything else is a linkage failure naming the import.
pub fn check_imports(imports: &[ImportSpec], functions: &[HostFunctionDescriptor]) -> Result<(), RuntimeError> {
    for import in imports {
        let result = match &import.kind {
            ImportKind::Function(declared) => {
                match functions
                    .iter()
                    .find(|f| f.module() == import.module && f.name() == import.name)
                {
                    None => Err("no host function provides it".to_string()),
                    Some(provided) if provided.signature() != declared => Err(format!(
                        "signature mismatch: host provides {}, module declares {declared}",
                        provided.signature()
                    )),
                    Some(_) => Ok(()),
                }
            }
            ImportKind::Memory if import.is_env_memory() => Ok(()),
            ImportKind::Table if import.is_env_table() => Ok(()),
            kind => Err(format!("unsupported {kind} import")),
        };

        if let Err(reason) = result {
            warn!(module = %import.module, name = %import.name, reason = %reason, "Unsatisfied import");
            return Err(RuntimeError::linkage(&import.module, &import.name, reason));
        }
    }
    Ok(())
}
