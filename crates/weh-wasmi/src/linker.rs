//! Host function installation for wasmi.
//!
//! wasmi has its own native exit (`Error::i32_exit`); every other interrupt
//! travels as a host error wrapping the [`GuestTrap`].

use std::fmt;

use tracing::{debug, instrument};
use wasmi::core::{F32, F64, HostError, TrapCode};
use wasmi::core::ValType;
use wasmi::{Caller, Engine, FuncType, Linker, Val};

use weh_common::{GuestTrap, Interrupt, RuntimeError};
use weh_core::{HostFunctionDescriptor, WasmValue};

use crate::instance::CallerEnv;
use crate::module::val_type;
use crate::store::StoreData;

/// A [`GuestTrap`] raised by a host function.
#[derive(Debug)]
pub(crate) struct HostTrap(pub(crate) GuestTrap);

impl fmt::Display for HostTrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl HostError for HostTrap {}

/// Host functions registered with a wasmi linker.
pub struct WasmiImports {
    pub(crate) linker: Linker<StoreData>,
}

impl fmt::Debug for WasmiImports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmiImports").finish_non_exhaustive()
    }
}

/// Register every descriptor with a fresh linker.
#[instrument(skip_all, fields(count = functions.len()))]
pub(crate) fn install(engine: &Engine, functions: &[HostFunctionDescriptor]) -> Result<WasmiImports, RuntimeError> {
    let mut linker = Linker::new(engine);

    for function in functions {
        let signature = function.signature();
        let ty = FuncType::new(
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
                        .map(|val| {
                            from_val(val).ok_or_else(|| {
                                host_error(GuestTrap::invalid_argument(format!("unsupported argument type {val:?}")))
                            })
                        })
                        .collect::<Result<Vec<_>, wasmi::Error>>()?;

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
    Ok(WasmiImports { linker })
}

fn write_result(value: Option<WasmValue>, results: &mut [Val]) -> Result<(), wasmi::Error> {
    match (value, results) {
        (None, []) => Ok(()),
        (Some(value), [slot]) => {
            *slot = to_val(value);
            Ok(())
        }
        (value, results) => Err(host_error(GuestTrap::invalid_argument(format!(
            "host function produced {value:?} for {} result slot(s)",
            results.len()
        )))),
    }
}

fn host_error(trap: GuestTrap) -> wasmi::Error {
    wasmi::Error::host(HostTrap(trap))
}

pub(crate) fn to_val(value: WasmValue) -> Val {
    match value {
        WasmValue::I32(v) => Val::I32(v),
        WasmValue::I64(v) => Val::I64(v),
        WasmValue::F32(v) => Val::F32(F32::from_bits(v.to_bits())),
        WasmValue::F64(v) => Val::F64(F64::from_bits(v.to_bits())),
    }
}

pub(crate) fn from_val(val: &Val) -> Option<WasmValue> {
    match val {
        Val::I32(v) => Some(WasmValue::I32(*v)),
        Val::I64(v) => Some(WasmValue::I64(*v)),
        Val::F32(v) => Some(WasmValue::F32(f32::from_bits(v.to_bits()))),
        Val::F64(v) => Some(WasmValue::F64(f64::from_bits(v.to_bits()))),
        _ => None,
    }
}

/// Placeholder for a result slot of type `ty`.
pub(crate) fn zero_val(ty: &ValType) -> Val {
    match ty {
        ValType::I64 => Val::I64(0),
        ValType::F32 => Val::F32(F32::from_bits(0)),
        ValType::F64 => Val::F64(F64::from_bits(0)),
        _ => Val::I32(0),
    }
}

/// wasmi's native form of an interrupt.
pub(crate) fn error_from_interrupt(interrupt: Interrupt) -> wasmi::Error {
    match interrupt {
        Interrupt::Exit(code) => wasmi::Error::i32_exit(code),
        Interrupt::Trap(trap) => host_error(trap),
    }
}

/// Classify an error returned by a wasmi call.
pub(crate) fn interrupt_from_error(error: &wasmi::Error) -> Interrupt {
    if let Some(code) = error.i32_exit_status() {
        return Interrupt::Exit(code);
    }
    if let Some(HostTrap(trap)) = error.downcast_ref::<HostTrap>() {
        return Interrupt::Trap(trap.clone());
    }
    Interrupt::Trap(GuestTrap::Engine {
        message: error.to_string(),
        code: error.as_trap_code().map(|code| format!("{code:?}")),
    })
}

/// Check if an error is due to fuel exhaustion.
pub(crate) fn is_out_of_fuel(error: &wasmi::Error) -> bool {
    error.as_trap_code() == Some(TrapCode::OutOfFuel)
}
