//! Emscripten runtime shim.
//!
//! Modules built with Emscripten expect extra `env` imports and a start-up
//! sequence the JavaScript glue would normally run. The shim provides both
//! and tracks them as an explicit state machine:
//!
//! ```text
//! Uninstalled ─register─▶ ImportsRegistered ─instantiated─▶ Instantiated
//!     ─finalize─▶ Finalized ─init_main_thread─▶ MainThreadInitialized
//! ```
//!
//! Each step checks the current phase and fails with
//! [`RuntimeError::ShimOrder`] when called out of order. `finalize` needs a
//! live instance and yields an [`EmscriptenRuntime`] handle that
//! `init_main_thread` consumes, so the start-up routine runs at most once.

mod env;
mod invoke;
mod syscall;

use std::fmt;

use tracing::{debug, info, instrument};
use weh_common::abi::EMSCRIPTEN_MODULE;
use weh_common::{GuestTrap, Interrupt, RuntimeError};

use crate::context::{GuestEnv, StackBounds};
use crate::descriptor::{HostFunctionDescriptor, ImportSpec};
use crate::value::WasmValue;

pub use env::MAX_HEAP_SIZE;
pub use invoke::parse_signature;
pub use syscall::{AT_FDCWD, STAT_SIZE};

/// First stack cookie word, written at the lowest stack address.
pub const STACK_COOKIE_LOW: u32 = 0x0213_5467;
/// Second stack cookie word, written right after the first.
pub const STACK_COOKIE_HIGH: u32 = 0x89BA_CDFE;
/// Marker written at address 0 to catch null-pointer writes.
pub const NULL_COOKIE: u32 = 1_668_509_029;

const STACK_INIT: &str = "emscripten_stack_init";
const STACK_GET_BASE: &str = "emscripten_stack_get_base";
const STACK_GET_END: &str = "emscripten_stack_get_end";
const SET_STACK_LIMITS: &str = "__set_stack_limits";
const CALL_CTORS: &str = "__wasm_call_ctors";
const START: &str = "_start";

/// Lifecycle phase of the shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimPhase {
    /// Nothing has happened yet.
    Uninstalled,
    /// The `env` imports were added to the import set.
    ImportsRegistered,
    /// The engine instantiated the module against the import set.
    Instantiated,
    /// Stack exports were read from the live instance.
    Finalized,
    /// Stack setup and global constructors ran; user exports may be called.
    MainThreadInitialized,
}

impl fmt::Display for ShimPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShimPhase::Uninstalled => "Uninstalled",
            ShimPhase::ImportsRegistered => "ImportsRegistered",
            ShimPhase::Instantiated => "Instantiated",
            ShimPhase::Finalized => "Finalized",
            ShimPhase::MainThreadInitialized => "MainThreadInitialized",
        };
        f.write_str(name)
    }
}

/// What `finalize` learned about the instance; consumed by `init_main_thread`.
#[derive(Debug)]
#[must_use]
pub struct EmscriptenRuntime {
    stack: Option<StackBounds>,
    has_stack_init: bool,
    has_stack_limits: bool,
    has_ctors: bool,
    has_start: bool,
}

impl EmscriptenRuntime {
    /// Stack bounds reported at finalize time, if the module exports them.
    pub fn stack(&self) -> Option<StackBounds> {
        self.stack
    }

    /// Returns `true` if `init_main_thread` will run global constructors.
    ///
    /// WASI command modules run them from `_start` themselves.
    pub fn runs_ctors(&self) -> bool {
        self.has_ctors && !self.has_start
    }
}

/// The Emscripten shim and its lifecycle.
#[derive(Debug)]
pub struct EmscriptenShim {
    phase: ShimPhase,
    history: Vec<ShimPhase>,
}

impl Default for EmscriptenShim {
    fn default() -> Self {
        Self::new()
    }
}

impl EmscriptenShim {
    /// A shim in [`ShimPhase::Uninstalled`].
    pub fn new() -> Self {
        Self {
            phase: ShimPhase::Uninstalled,
            history: vec![ShimPhase::Uninstalled],
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ShimPhase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn history(&self) -> &[ShimPhase] {
        &self.history
    }

    fn expect(&self, expected: ShimPhase) -> Result<(), RuntimeError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(RuntimeError::shim_order(expected, self.phase))
        }
    }

    fn enter(&mut self, next: ShimPhase) {
        info!(from = %self.phase, to = %next, "Emscripten shim transition");
        self.phase = next;
        self.history.push(next);
    }

    /// Produce the `env` imports for a module declaring `imports`.
    ///
    /// The fixed runtime imports are always provided; one trampoline is
    /// generated for every `invoke_<sig>` import with a valid signature.
    pub fn register(&mut self, imports: &[ImportSpec]) -> Result<Vec<HostFunctionDescriptor>, RuntimeError> {
        self.expect(ShimPhase::Uninstalled)?;

        let mut functions = env::functions();
        functions.extend(syscall::functions());
        for import in imports.iter().filter(|i| i.module == EMSCRIPTEN_MODULE) {
            if let Some(signature) = invoke::parse_signature(&import.name) {
                functions.push(invoke::trampoline(&import.name, signature));
            }
        }
        debug!(count = functions.len(), "Emscripten imports registered");

        self.enter(ShimPhase::ImportsRegistered);
        Ok(functions)
    }

    /// Record that the engine instantiated the module.
    pub fn instantiated(&mut self) -> Result<(), RuntimeError> {
        self.expect(ShimPhase::ImportsRegistered)?;
        self.enter(ShimPhase::Instantiated);
        Ok(())
    }

    /// Inspect the live instance and record its stack bounds.
    #[instrument(skip_all)]
    pub fn finalize(&mut self, guest: &mut dyn GuestEnv) -> Result<EmscriptenRuntime, RuntimeError> {
        self.expect(ShimPhase::Instantiated)?;

        let stack = read_stack_bounds(guest).map_err(|i| RuntimeError::startup("finalize", i))?;
        if stack.is_some() {
            guest.context().stack = stack;
        }
        let runtime = EmscriptenRuntime {
            stack,
            has_stack_init: guest.has_export(STACK_INIT),
            has_stack_limits: guest.has_export(SET_STACK_LIMITS),
            has_ctors: guest.has_export(CALL_CTORS),
            has_start: guest.has_export(START),
        };
        debug!(?runtime, "Emscripten runtime finalized");

        self.enter(ShimPhase::Finalized);
        Ok(runtime)
    }

    /// Run the runtime's start-up routine.
    ///
    /// 1. `emscripten_stack_init`, then the stack cookie
    /// 2. `__set_stack_limits(base, end)`
    /// 3. `__wasm_call_ctors`, unless the module has `_start`
    /// 4. Stack cookie check
    ///
    /// An exit or trap from guest code here is reported as
    /// [`RuntimeError::Startup`]; the shim stays in `Finalized`.
    #[instrument(skip_all)]
    pub fn init_main_thread(
        &mut self,
        runtime: EmscriptenRuntime,
        guest: &mut dyn GuestEnv,
    ) -> Result<(), RuntimeError> {
        self.expect(ShimPhase::Finalized)?;

        if runtime.has_stack_init {
            call(guest, STACK_INIT, &[]).map_err(|i| RuntimeError::startup("stack init", i))?;
        }
        let stack = read_stack_bounds(guest)
            .map_err(|i| RuntimeError::startup("stack init", i))?
            .or(runtime.stack);
        if stack.is_some() {
            guest.context().stack = stack;
        }

        let cookie = match stack {
            Some(bounds) => Some(write_stack_cookie(guest, bounds).map_err(|t| RuntimeError::startup("stack init", t.into()))?),
            None => None,
        };

        if runtime.has_stack_limits {
            if let Some(bounds) = stack {
                call(guest, SET_STACK_LIMITS, &[i32_value(bounds.base), i32_value(bounds.end)])
                    .map_err(|i| RuntimeError::startup("stack limits", i))?;
            }
        }

        if runtime.runs_ctors() {
            call(guest, CALL_CTORS, &[]).map_err(|i| RuntimeError::startup("global constructors", i))?;
        }

        if let Some(addr) = cookie {
            check_stack_cookie(guest, addr).map_err(|t| RuntimeError::startup("stack check", t.into()))?;
        }

        self.enter(ShimPhase::MainThreadInitialized);
        Ok(())
    }

    /// Fail unless start-up has completed and user exports may run.
    pub fn ensure_ready(&self) -> Result<(), RuntimeError> {
        self.expect(ShimPhase::MainThreadInitialized)
    }
}

#[allow(clippy::cast_possible_wrap)]
fn i32_value(value: u32) -> WasmValue {
    WasmValue::I32(value as i32)
}

fn call(guest: &mut dyn GuestEnv, name: &str, args: &[WasmValue]) -> Result<Option<WasmValue>, Interrupt> {
    debug!(export = name, "Calling runtime export");
    guest.call_export(name, args)
}

#[allow(clippy::cast_sign_loss)]
fn call_u32(guest: &mut dyn GuestEnv, name: &str) -> Result<u32, Interrupt> {
    match call(guest, name, &[])? {
        Some(WasmValue::I32(value)) => Ok(value as u32),
        other => Err(GuestTrap::invalid_argument(format!("{name} returned {other:?}")).into()),
    }
}

/// Stack bounds from the stack exports; `None` if not exported or not yet set.
fn read_stack_bounds(guest: &mut dyn GuestEnv) -> Result<Option<StackBounds>, Interrupt> {
    if !guest.has_export(STACK_GET_BASE) || !guest.has_export(STACK_GET_END) {
        return Ok(None);
    }
    let base = call_u32(guest, STACK_GET_BASE)?;
    let end = call_u32(guest, STACK_GET_END)?;
    Ok((base != 0 || end != 0).then_some(StackBounds { base, end }))
}

/// Write the overflow cookie at the low end of the stack; returns its address.
fn write_stack_cookie(guest: &mut dyn GuestEnv, bounds: StackBounds) -> Result<u32, GuestTrap> {
    let addr = if bounds.end == 0 { 4 } else { bounds.end };
    let (_, mut memory) = guest.memory()?;
    memory.write_u32(addr, STACK_COOKIE_LOW)?;
    memory.write_u32(addr + 4, STACK_COOKIE_HIGH)?;
    memory.write_u32(0, NULL_COOKIE)?;
    Ok(addr)
}

fn check_stack_cookie(guest: &mut dyn GuestEnv, addr: u32) -> Result<(), GuestTrap> {
    let (_, memory) = guest.memory()?;
    let low = memory.read_u32(addr)?;
    let high = memory.read_u32(addr + 4)?;
    if low != STACK_COOKIE_LOW || high != STACK_COOKIE_HIGH {
        return Err(GuestTrap::abort(format!(
            "Stack overflow! Stack cookie has been overwritten at {addr:#x}, expected hex dwords \
             0x89BACDFE and 0x2135467, but received {high:#x} {low:#x}"
        )));
    }
    if memory.read_u32(0)? != NULL_COOKIE {
        return Err(GuestTrap::abort("Runtime error: The application has corrupted its heap memory area (address zero)!"));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
