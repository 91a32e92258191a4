//! Engine-agnostic host ABI for weh.
//!
//! This crate provides everything between an embedder host and a
//! WebAssembly engine, without naming any engine type:
//! - [`MemoryView`]: bounds-checked access to guest linear memory
//! - [`HostFunctionDescriptor`]: one host import, produced by the WASI table
//!   and the Emscripten shim, consumed by engine adapters
//! - [`wasi`]: the WASI Preview 1 function table
//! - [`emscripten`]: the Emscripten `env` imports and start-up state machine
//! - [`EngineAdapter`]: the capability interface each engine implements
//! - [`ModuleExecutor`]: compile, link, start up and run a module
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     EmbedderHost                        │
//! │  (One per execution, closed on every exit path)         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        WASI table + Emscripten shim descriptors         │
//! │  (Engine-neutral; see `check_imports`)                  │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    EngineAdapter                        │
//! │  install → bind → GuestInstance                         │
//! │  - Native value marshalling                             │
//! │  - Native exit and trap propagation                     │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         EmscriptenShim finalize + main thread init      │
//! │  then the entry point (`_start` or `main`)              │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod context;
pub mod descriptor;
pub mod emscripten;
pub mod executor;
pub mod memory;
pub mod value;
pub mod wasi;

#[cfg(test)]
mod testing;

pub use adapter::EngineAdapter;
pub use context::{GuestEnv, GuestInstance, HostContext, StackBounds};
pub use descriptor::{
    HostCallback, HostFunctionDescriptor, HostResult, ImportKind, ImportSpec, MEMORY_IMPORT, TABLE_IMPORT,
    check_imports,
};
pub use emscripten::{EmscriptenRuntime, EmscriptenShim, ShimPhase};
pub use executor::{EntryPoint, ExecutionOutcome, ExecutionReport, ModuleExecutor};
pub use memory::MemoryView;
pub use value::{Args, Signature, ValueType, WasmValue};
