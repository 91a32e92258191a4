//! Wasmtime engine adapter for weh.
//!
//! This crate runs modules through the engine-neutral host ABI of `weh-core`:
//! - [`WasmtimeEngine`]: Configured Wasmtime engine (fuel, epochs)
//! - [`CompiledModule`]: Compiled WebAssembly module wrapper
//! - [`WasmtimeAdapter`]: [`weh_core::EngineAdapter`] implementation
//! - [`WasmtimeInstance`]: Live instance driven by the executor
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    WasmtimeEngine                       │
//! │  (Shared, thread-safe; ticked for epoch deadlines)      │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │           Linker<StoreData>  (install)                  │
//! │  - One func_new per host function descriptor            │
//! │  - proc_exit surfaces as wasmtime_wasi::I32Exit         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            Store<StoreData> + Instance  (bind)          │
//! │  - env.memory / env.__indirect_function_table           │
//! │  - Missing imports rejected before instantiation        │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod adapter;
pub mod engine;
mod instance;
mod linker;
pub mod module;
pub mod store;

pub use adapter::WasmtimeAdapter;
pub use engine::WasmtimeEngine;
pub use instance::WasmtimeInstance;
pub use linker::WasmtimeImports;
pub use module::CompiledModule;
pub use store::StoreData;
