//! Host function installation.
//!
//! Each [`HostFunctionDescriptor`] becomes one `Linker::func_new` entry. The
//! closure:
//! 1. Converts `wasmtime::Val` arguments into [`WasmValue`]s bit for bit
//! 2. Runs the engine-neutral callback against a [`CallerEnv`]
//! 3. Writes the result back, or turns the [`Interrupt`] into an error:
//!    `Exit(n)` becomes `wasmtime_wasi::I32Exit(n)`, a trap carries the
//!    [`GuestTrap`] itself so it can be recovered by downcast

use anyhow::anyhow;
use tracing::{debug, instrument};
use wasmtime::{Caller, Engine, FuncType, Linker, Trap, Val, ValType};
use wasmtime_wasi::I32Exit;

use weh_common::{GuestTrap, Interrupt, RuntimeError};
use weh_core::{HostFunctionDescriptor, WasmValue};

use crate::instance::CallerEnv;
use crate::module::val_type;
use crate::store::StoreData;

/// Host functions registered with a Wasmtime linker, not yet bound to a store.
pub struct WasmtimeImports {
    pub(crate) linker: Linker<StoreData>,
}

impl std::fmt::Debug for WasmtimeImports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeImports").finish_non_exhaustive()
    }
}

/// Register every descriptor with a fresh linker.
#[instrument(skip_all, fields(count = functions.len()))]
pub(crate) fn install(engine: &Engine, functions: &[HostFunctionDescriptor]) -> Result<WasmtimeImports, RuntimeError> {
    let mut linker = Linker::new(engine);

    for function in functions {
        let signature = function.signature();
        let ty = FuncType::new(
            engine,
            signature.params().iter().copied().map(val_type),
            signature.results().iter().copied().map(val_type),
        );
        let callback = function.callback();

        linker
            .func_new(
                function.module(),
                function.name(),
                ty,
                move |mut caller: Caller<'_, StoreData>, params: &[Val], results: &mut [Val]| {
                    let args = params
                        .iter()
                        .map(|val| from_val(val).ok_or_else(|| anyhow!("unsupported argument type {val:?}")))
                        .collect::<anyhow::Result<Vec<_>>>()?;

                    let mut env = CallerEnv::new(&mut caller);
                    match callback(&mut env, &args) {
                        Ok(value) => write_result(value, results),
                        Err(interrupt) => Err(error_from_interrupt(interrupt)),
                    }
                },
            )
            .map_err(|e| RuntimeError::linkage(function.module(), function.name(), e.to_string()))?;
    }

    debug!("Host functions installed");
    Ok(WasmtimeImports { linker })
}

fn write_result(value: Option<WasmValue>, results: &mut [Val]) -> anyhow::Result<()> {
    match (value, results) {
        (None, []) => Ok(()),
        (Some(value), [slot]) => {
            *slot = to_val(value);
            Ok(())
        }
        (value, results) => Err(anyhow::Error::new(GuestTrap::invalid_argument(format!(
            "host function produced {value:?} for {} result slot(s)",
            results.len()
        )))),
    }
}

pub(crate) fn to_val(value: WasmValue) -> Val {
    match value {
        WasmValue::I32(v) => Val::I32(v),
        WasmValue::I64(v) => Val::I64(v),
        WasmValue::F32(v) => Val::F32(v.to_bits()),
        WasmValue::F64(v) => Val::F64(v.to_bits()),
    }
}

pub(crate) fn from_val(val: &Val) -> Option<WasmValue> {
    match val {
        Val::I32(v) => Some(WasmValue::I32(*v)),
        Val::I64(v) => Some(WasmValue::I64(*v)),
        Val::F32(bits) => Some(WasmValue::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Some(WasmValue::F64(f64::from_bits(*bits))),
        _ => None,
    }
}

/// Placeholder for a result slot of type `ty`.
pub(crate) fn zero_val(ty: &ValType) -> Val {
    match ty {
        ValType::I64 => Val::I64(0),
        ValType::F32 => Val::F32(0),
        ValType::F64 => Val::F64(0),
        _ => Val::I32(0),
    }
}

/// Wasmtime's native form of an interrupt.
pub(crate) fn error_from_interrupt(interrupt: Interrupt) -> anyhow::Error {
    match interrupt {
        Interrupt::Exit(code) => anyhow::Error::new(I32Exit(code)),
        Interrupt::Trap(trap) => anyhow::Error::new(trap),
    }
}

/// Classify an error returned by a Wasmtime call.
pub(crate) fn interrupt_from_error(error: &anyhow::Error) -> Interrupt {
    if let Some(exit) = error.downcast_ref::<I32Exit>() {
        return Interrupt::Exit(exit.0);
    }
    if let Some(trap) = error.downcast_ref::<GuestTrap>() {
        return Interrupt::Trap(trap.clone());
    }

    let (message, code) = extract_trap_info(error);
    Interrupt::Trap(GuestTrap::Engine { message, code })
}

/// Extract human-readable trap information.
fn extract_trap_info(error: &anyhow::Error) -> (String, Option<String>) {
    let message = error.root_cause().to_string();
    let code = error.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"));
    (message, code)
}

/// Check if an error is due to fuel exhaustion.
pub(crate) fn is_out_of_fuel(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}
