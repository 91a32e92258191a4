//! wasmi interpreter adapter for weh.
//!
//! Same contract as the Wasmtime adapter, for hosts where a JIT is not an
//! option:
//! - [`WasmiEngine`]: interpreter engine with optional fuel metering
//! - [`WasmiModule`]: validated module (binary or WAT input)
//! - [`WasmiAdapter`]: [`weh_core::EngineAdapter`] implementation
//! - [`WasmiInstance`]: live instance driven by the executor
//!
//! `proc_exit` surfaces as wasmi's native `i32_exit` error. Other guest
//! interrupts travel as a host error and are recovered by downcast.

mod adapter;
pub mod engine;
mod instance;
mod linker;
pub mod module;
pub mod store;

pub use adapter::WasmiAdapter;
pub use engine::WasmiEngine;
pub use instance::WasmiInstance;
pub use linker::WasmiImports;
pub use module::WasmiModule;
pub use store::StoreData;
