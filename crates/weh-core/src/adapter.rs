//! The engine capability interface.
//!
//! Every engine adapter implements [`EngineAdapter`]. The contract is split
//! the way engines that fix host identity late need it:
//!
//! 1. [`compile`](EngineAdapter::compile) the module bytes
//! 2. [`install`](EngineAdapter::install) host function descriptors into an
//!    engine-native import set, without any host attached
//! 3. [`bind`](EngineAdapter::bind) the import set and a [`HostContext`] into
//!    a live instance
//!
//! The Emscripten finalize step then runs against the returned
//! [`GuestInstance`]. Engine types never cross this boundary.

use weh_common::RuntimeError;

use crate::context::{GuestInstance, HostContext};
use crate::descriptor::{HostFunctionDescriptor, ImportSpec};

/// One WebAssembly engine behind the engine-neutral host ABI.
pub trait EngineAdapter {
    /// A compiled module.
    type Module;

    /// Host functions registered in the engine's native form.
    type Imports;

    /// A live instance bound to one host context.
    type Instance: GuestInstance;

    /// Engine name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Compile a binary (or, where supported, text) module.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::CompilationFailed`] if the engine rejects the
    /// bytes.
    fn compile(&self, bytes: &[u8]) -> Result<Self::Module, RuntimeError>;

    /// The imports `module` declares, in declaration order.
    fn imports(&self, module: &Self::Module) -> Vec<ImportSpec>;

    /// Register `functions` as native host imports.
    ///
    /// Values are marshalled between the engine's representation and
    /// [`WasmValue`](crate::WasmValue) bit for bit. An
    /// [`Interrupt::Exit`](weh_common::Interrupt::Exit) leaves the guest
    /// through the engine's native exit mechanism.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Linkage`] if two descriptors collide.
    fn install(&self, functions: &[HostFunctionDescriptor]) -> Result<Self::Imports, RuntimeError>;

    /// Instantiate `module` against `imports`, owned by `context`.
    ///
    /// Memory and table imports under `env` are created from the module's
    /// declared types. The module's start function, if any, runs here.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Linkage`] if the engine rejects an import, or
    /// [`RuntimeError::Startup`] if the start function exits or traps.
    fn bind(
        &self,
        imports: Self::Imports,
        module: &Self::Module,
        context: HostContext,
    ) -> Result<Self::Instance, RuntimeError>;
}
