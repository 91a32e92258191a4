//! Fixed `env` imports of the Emscripten runtime.

use chrono::{DateTime, Datelike, Timelike};
use tracing::{debug, error, info};
use weh_common::abi::{EMSCRIPTEN_MODULE, WASM_PAGE_SIZE};
use weh_common::{GuestTrap, Interrupt};
use weh_host::{ClockId, ConsoleLevel};

use crate::context::GuestEnv;
use crate::descriptor::{HostFunctionDescriptor, HostResult};
use crate::memory::MemoryView;
use crate::value::{Args, Signature, ValueType, WasmValue};

/// Largest heap `emscripten_resize_heap` will grow to (2 GiB).
pub const MAX_HEAP_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Time zone name reported by `_tzset_js`.
const TZ_NAME: &[u8] = b"UTC\0";

/// `struct tm` fields written by `_localtime_js`, up to `tm_gmtoff`.
const TM_SIZE: u32 = 40;

const I32: ValueType = ValueType::I32;
const I64: ValueType = ValueType::I64;
const F64: ValueType = ValueType::F64;

type EnvFn = fn(&mut dyn GuestEnv, Args<'_>) -> HostResult;

/// Every fixed `env` import.
pub(super) fn functions() -> Vec<HostFunctionDescriptor> {
    let table: &[(&'static str, &[ValueType], &[ValueType], EnvFn)] = &[
        ("_abort_js", &[], &[], abort),
        ("abort", &[], &[], abort),
        ("__assert_fail", &[I32, I32, I32, I32], &[], assert_fail),
        ("exit", &[I32], &[], exit),
        ("emscripten_notify_memory_growth", &[I32], &[], notify_memory_growth),
        ("emscripten_resize_heap", &[I32], &[I32], resize_heap),
        ("emscripten_get_now", &[], &[F64], get_now),
        ("emscripten_date_now", &[], &[F64], date_now),
        ("_emscripten_get_now_is_monotonic", &[], &[I32], get_now_is_monotonic),
        ("emscripten_console_log", &[I32], &[], console_log),
        ("emscripten_console_warn", &[I32], &[], console_warn),
        ("emscripten_console_error", &[I32], &[], console_error),
        ("emscripten_check_blocking_allowed", &[], &[], check_blocking_allowed),
        ("getentropy", &[I32, I32], &[I32], getentropy),
        ("__handle_stack_overflow", &[I32], &[], handle_stack_overflow),
        ("_emscripten_throw_longjmp", &[], &[], throw_longjmp),
        ("_tzset_js", &[I32, I32, I32, I32], &[], tzset_js),
        ("_localtime_js", &[I64, I32], &[], localtime_js),
        ("emscripten_exit_with_live_runtime", &[], &[], exit_with_live_runtime),
        ("emscripten_asm_const_int", &[I32, I32, I32], &[I32], asm_const_int),
    ];

    table
        .iter()
        .map(|(name, params, results, f)| {
            let f = *f;
            HostFunctionDescriptor::new(
                EMSCRIPTEN_MODULE,
                *name,
                Signature::new(params.to_vec(), results.to_vec()),
                move |env, raw| {
                    env.context().host.ensure_open()?;
                    f(env, Args::new(raw))
                },
            )
        })
        .collect()
}

fn abort(_env: &mut dyn GuestEnv, _args: Args<'_>) -> HostResult {
    error!("Guest called abort");
    Err(GuestTrap::abort("native code called abort()").into())
}

fn assert_fail(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    let (ctx, memory) = env.memory()?;
    let or_unknown = |ptr: u32, fallback: &str| -> Result<String, GuestTrap> {
        if ptr == 0 {
            Ok(fallback.to_string())
        } else {
            memory.read_c_string(ptr)
        }
    };

    let condition = or_unknown(args.u32(0)?, "")?;
    let file = or_unknown(args.u32(1)?, "unknown filename")?;
    let line = args.i32(2)?;
    let function = or_unknown(args.u32(3)?, "unknown function")?;

    let message = format!("Assertion failed: {condition}, at: {file},{line},{function}");
    ctx.host.console_mut().log(ConsoleLevel::Error, &message);
    Err(GuestTrap::abort(message).into())
}

fn exit(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    let code = args.i32(0)?;
    env.context().host.record_exit(code);
    Err(Interrupt::Exit(code))
}

fn notify_memory_growth(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    let index = args.u32(0)?;
    let (_, memory) = env.memory()?;
    debug!(index, size = memory.size(), "Guest memory grew");
    Ok(None)
}

/// Grow memory to the page boundary covering `requested` bytes.
///
/// Returns 1 on success, 0 if the request is over the heap limit or the
/// engine refuses to grow.
fn resize_heap(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    let requested = u64::from(args.u32(0)?);
    let (_, memory) = env.memory()?;
    let current = memory.size() as u64;

    if requested <= current {
        return Ok(Some(WasmValue::I32(1)));
    }
    if requested > MAX_HEAP_SIZE {
        debug!(requested, "Heap resize over the limit");
        return Ok(Some(WasmValue::I32(0)));
    }

    let delta = requested.div_ceil(WASM_PAGE_SIZE) - current / WASM_PAGE_SIZE;
    let grown = env.grow_memory(delta)?.is_some();
    debug!(requested, delta_pages = delta, grown, "Heap resize");
    Ok(Some(WasmValue::I32(i32::from(grown))))
}

fn clock_millis(env: &mut dyn GuestEnv, id: ClockId) -> HostResult {
    let nanos = env
        .context()
        .host
        .clock()
        .now(id)
        .map_err(|errno| GuestTrap::abort(format!("clock unavailable: {errno}")))?;
    #[allow(clippy::cast_precision_loss)]
    Ok(Some(WasmValue::F64(nanos as f64 / 1_000_000.0)))
}

fn get_now(env: &mut dyn GuestEnv, _args: Args<'_>) -> HostResult {
    clock_millis(env, ClockId::Monotonic)
}

fn date_now(env: &mut dyn GuestEnv, _args: Args<'_>) -> HostResult {
    clock_millis(env, ClockId::Realtime)
}

fn get_now_is_monotonic(_env: &mut dyn GuestEnv, _args: Args<'_>) -> HostResult {
    Ok(Some(WasmValue::I32(1)))
}

fn console(env: &mut dyn GuestEnv, args: Args<'_>, level: ConsoleLevel) -> HostResult {
    let (ctx, memory) = env.memory()?;
    let message = memory.read_c_string(args.u32(0)?)?;
    ctx.host.console_mut().log(level, &message);
    Ok(None)
}

fn console_log(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    console(env, args, ConsoleLevel::Log)
}

fn console_warn(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    console(env, args, ConsoleLevel::Warn)
}

fn console_error(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    console(env, args, ConsoleLevel::Error)
}

fn check_blocking_allowed(_env: &mut dyn GuestEnv, _args: Args<'_>) -> HostResult {
    Ok(None)
}

fn getentropy(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    let buf = args.u32(0)?;
    let len = args.u32(1)?;
    let (ctx, mut memory) = env.memory()?;
    let target = memory.slice_mut(buf, len)?;

    let rc = match ctx.host.fill_random(target) {
        Ok(()) => 0,
        Err(errno) => errno.raw(),
    };
    Ok(Some(WasmValue::I32(rc)))
}

fn handle_stack_overflow(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    let sp = args.u32(0)?;
    let stack = env.context().stack;
    error!(sp, ?stack, "Guest stack overflow");
    Err(GuestTrap::StackOverflow { addr: u64::from(sp) }.into())
}

fn throw_longjmp(_env: &mut dyn GuestEnv, _args: Args<'_>) -> HostResult {
    Err(GuestTrap::Longjmp.into())
}

/// The guest always runs in UTC.
fn tzset_js(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    let timezone = args.u32(0)?;
    let daylight = args.u32(1)?;
    let std_name = args.u32(2)?;
    let dst_name = args.u32(3)?;
    let (_, mut memory) = env.memory()?;

    write_tz(&mut memory, timezone, daylight, std_name, dst_name)?;
    Ok(None)
}

fn write_tz(memory: &mut MemoryView<'_>, timezone: u32, daylight: u32, std_name: u32, dst_name: u32) -> Result<(), GuestTrap> {
    memory.write_i32(timezone, 0)?;
    memory.write_i32(daylight, 0)?;
    memory.write_bytes(std_name, TZ_NAME)?;
    memory.write_bytes(dst_name, TZ_NAME)
}

/// Break `time` down into a `struct tm` in UTC.
fn localtime_js(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    let time = args.i64(0)?;
    let tm = args.u32(1)?;
    let date = DateTime::from_timestamp(time, 0)
        .ok_or_else(|| GuestTrap::invalid_argument(format!("time {time} is out of range")))?;
    let (_, mut memory) = env.memory()?;

    memory.check(tm, TM_SIZE)?;
    memory.write_u32(tm, date.second())?;
    memory.write_u32(tm + 4, date.minute())?;
    memory.write_u32(tm + 8, date.hour())?;
    memory.write_u32(tm + 12, date.day())?;
    memory.write_u32(tm + 16, date.month0())?;
    memory.write_i32(tm + 20, date.year() - 1900)?;
    memory.write_u32(tm + 24, date.weekday().num_days_from_sunday())?;
    memory.write_u32(tm + 28, date.ordinal0())?;
    // tm_isdst, tm_gmtoff
    memory.write_i32(tm + 32, 0)?;
    memory.write_i32(tm + 36, 0)?;
    Ok(None)
}

/// There is no event loop to keep the runtime alive for, so the unwind
/// ends the run with status 0.
fn exit_with_live_runtime(_env: &mut dyn GuestEnv, _args: Args<'_>) -> HostResult {
    info!("Guest asked to keep the runtime alive; no event loop, finishing");
    Err(Interrupt::Exit(0))
}

/// `EM_ASM` snippets are JavaScript source.
fn asm_const_int(env: &mut dyn GuestEnv, args: Args<'_>) -> HostResult {
    let code = args.u32(0)?;
    let (_, memory) = env.memory()?;
    let snippet = memory.read_c_string(code)?;
    error!(snippet, "Guest used EM_ASM");
    Err(GuestTrap::abort(format!("EM_ASM is not supported: {snippet}")).into())
}
