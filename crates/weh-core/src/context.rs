//! State reachable from host functions, and the engine-facing guest view.
//!
//! Host functions never see engine types. An adapter hands them a
//! `&mut dyn GuestEnv` that exposes:
//! - the [`HostContext`] (embedder host plus Emscripten runtime state)
//! - a [`MemoryView`] over the calling instance's linear memory
//! - re-entrant calls into exported and table functions

use weh_common::{GuestTrap, Interrupt};
use weh_host::EmbedderHost;

use crate::memory::MemoryView;
use crate::value::{Signature, WasmValue};

/// Shadow stack bounds reported by an Emscripten module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Highest stack address; the stack grows down from here.
    pub base: u32,
    /// Lowest usable stack address.
    pub end: u32,
}

impl StackBounds {
    /// Returns `true` if `sp` lies within the stack.
    pub fn contains(&self, sp: u32) -> bool {
        sp >= self.end && sp <= self.base
    }
}

/// Per-instance state owned by the engine store.
#[derive(Debug)]
pub struct HostContext {
    /// The sandbox this instance runs against.
    pub host: EmbedderHost,
    /// Stack bounds recorded when the Emscripten runtime was finalized.
    pub stack: Option<StackBounds>,
}

impl HostContext {
    /// Wrap an embedder host.
    pub fn new(host: EmbedderHost) -> Self {
        Self { host, stack: None }
    }
}

/// The calling guest, as seen by a host function.
///
/// Implemented by each engine adapter over its native caller or store.
pub trait GuestEnv {
    /// The per-instance host context.
    fn context(&mut self) -> &mut HostContext;

    /// The host context together with a view of linear memory.
    ///
    /// Fails with [`GuestTrap::MissingMemory`] if the instance has none.
    fn memory(&mut self) -> Result<(&mut HostContext, MemoryView<'_>), GuestTrap>;

    /// Grow linear memory by `delta_pages` 64 KiB pages.
    ///
    /// Returns the previous size in pages, or `None` if the engine refused.
    fn grow_memory(&mut self, delta_pages: u64) -> Result<Option<u64>, GuestTrap>;

    /// Returns `true` if the instance exports a function called `name`.
    fn has_export(&mut self, name: &str) -> bool;

    /// Call an exported function.
    fn call_export(&mut self, name: &str, args: &[WasmValue]) -> Result<Option<WasmValue>, Interrupt>;

    /// Call entry `index` of the indirect function table.
    fn call_indirect(&mut self, index: u32, args: &[WasmValue]) -> Result<Option<WasmValue>, Interrupt>;
}

/// A live module instance, driven from outside any guest call.
pub trait GuestInstance: GuestEnv {
    /// Name of the engine behind this instance, for diagnostics.
    fn engine_name(&self) -> &'static str;

    /// Signature of the exported function `name`, if there is one.
    fn export_signature(&mut self, name: &str) -> Option<Signature>;
}
