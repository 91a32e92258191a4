//! `invoke_<sig>` dynamic-call trampolines.
//!
//! Emscripten routes indirect calls that may `longjmp` through imports such
//! as `invoke_iii(index, a, b)`. The trampoline calls table entry `index`; if
//! the callee unwinds with [`GuestTrap::Longjmp`] and the module exports
//! `setThrew`, the stack pointer is restored, the throw is recorded, and the
//! trampoline returns a zero value so the guest's setjmp handler runs.
//! Every other trap, and every exit, propagates.

use weh_common::abi::EMSCRIPTEN_MODULE;
use weh_common::{GuestTrap, Interrupt};

use crate::descriptor::HostFunctionDescriptor;
use crate::value::{Args, Signature, ValueType, WasmValue};

pub(super) const STACK_GET_CURRENT: &str = "emscripten_stack_get_current";
const STACK_RESTORE: &str = "_emscripten_stack_restore";
const SET_THREW: &str = "setThrew";

/// Decode the signature of an `invoke_` import name.
///
/// The first letter is the result (`v` for none), the rest are parameters;
/// the leading table index is implicit.
pub fn parse_signature(name: &str) -> Option<Signature> {
    let letters = name.strip_prefix("invoke_")?;
    let mut chars = letters.chars();

    let results = match chars.next()? {
        'v' => Vec::new(),
        c => vec![ValueType::from_sig_char(c)?],
    };
    let mut params = vec![ValueType::I32];
    for c in chars {
        params.push(ValueType::from_sig_char(c)?);
    }
    Some(Signature::new(params, results))
}

/// Build the trampoline for `name`.
pub(super) fn trampoline(name: &str, signature: Signature) -> HostFunctionDescriptor {
    let result = signature.results().first().copied();

    HostFunctionDescriptor::new(EMSCRIPTEN_MODULE, name, signature, move |env, raw| {
        env.context().host.ensure_open()?;
        let index = Args::new(raw).u32(0)?;

        let saved_sp = if env.has_export(STACK_GET_CURRENT) {
            env.call_export(STACK_GET_CURRENT, &[])?
        } else {
            None
        };

        match env.call_indirect(index, &raw[1..]) {
            Ok(value) => Ok(value.or_else(|| result.map(ValueType::zero))),
            Err(Interrupt::Trap(GuestTrap::Longjmp)) if env.has_export(SET_THREW) => {
                if let Some(sp) = saved_sp {
                    if env.has_export(STACK_RESTORE) {
                        env.call_export(STACK_RESTORE, &[sp])?;
                    }
                }
                env.call_export(SET_THREW, &[WasmValue::I32(1), WasmValue::I32(0)])?;
                Ok(result.map(ValueType::zero))
            }
            Err(interrupt) => Err(interrupt),
        }
    })
}
