use weh_common::abi::{EMSCRIPTEN_MODULE, WASM_PAGE_SIZE};
use weh_common::{Errno, GuestTrap, Interrupt, RuntimeError};
use weh_host::ConsoleLevel;

use super::*;
use crate::descriptor::{HostFunctionDescriptor, HostResult, ImportKind};
use crate::testing::{MockEnv, MockFunc, MockState, host};
use crate::value::{Signature, ValueType};

fn invoke_import(name: &str) -> ImportSpec {
    let signature = parse_signature(name).unwrap();
    ImportSpec::new(EMSCRIPTEN_MODULE, name, ImportKind::Function(signature))
}

fn returns(value: i32) -> impl FnMut(&mut MockState, &[WasmValue]) -> HostResult + Send + 'static {
    move |_, _| Ok(Some(WasmValue::I32(value)))
}

fn unit() -> impl FnMut(&mut MockState, &[WasmValue]) -> HostResult + Send + 'static {
    |_, _| Ok(None)
}

fn entry(func: impl FnMut(&mut MockState, &[WasmValue]) -> HostResult + Send + 'static) -> MockFunc {
    Box::new(func)
}

fn env() -> MockEnv {
    MockEnv::new(host(None).0)
}

/// A guest exporting the usual Emscripten stack helpers.
fn emscripten_env() -> MockEnv {
    let mut env = env();
    env.export("emscripten_stack_init", unit());
    env.export("emscripten_stack_get_base", returns(0x8000));
    env.export("emscripten_stack_get_end", returns(0x4000));
    env.export("__set_stack_limits", unit());
    env.export("__wasm_call_ctors", unit());
    env
}

fn call(env: &mut MockEnv, functions: &[HostFunctionDescriptor], name: &str, args: &[WasmValue]) -> HostResult {
    env.call(functions, EMSCRIPTEN_MODULE, name, args)
}

fn start(shim: &mut EmscriptenShim, env: &mut MockEnv) -> Result<(), RuntimeError> {
    shim.register(&[])?;
    shim.instantiated()?;
    let runtime = shim.finalize(env)?;
    shim.init_main_thread(runtime, env)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_full_lifecycle() {
    let mut shim = EmscriptenShim::new();
    let mut env = emscripten_env();

    start(&mut shim, &mut env).unwrap();

    assert_eq!(shim.phase(), ShimPhase::MainThreadInitialized);
    assert_eq!(
        shim.history(),
        &[
            ShimPhase::Uninstalled,
            ShimPhase::ImportsRegistered,
            ShimPhase::Instantiated,
            ShimPhase::Finalized,
            ShimPhase::MainThreadInitialized,
        ]
    );
    assert!(shim.ensure_ready().is_ok());
    assert_eq!(env.ctx.stack, Some(StackBounds { base: 0x8000, end: 0x4000 }));
}

#[test]
fn test_finalize_before_instantiation_fails() {
    let mut shim = EmscriptenShim::new();
    let mut env = emscripten_env();

    let err = shim.finalize(&mut env).unwrap_err();
    assert!(matches!(err, RuntimeError::ShimOrder { .. }));
    assert_eq!(
        err.to_string(),
        "Emscripten shim out of order: expected Instantiated, found Uninstalled"
    );

    shim.register(&[]).unwrap();
    assert!(shim.finalize(&mut env).is_err());
    assert_eq!(shim.phase(), ShimPhase::ImportsRegistered);
    assert!(env.state.calls.is_empty());
}

#[test]
fn test_register_twice_fails() {
    let mut shim = EmscriptenShim::new();
    shim.register(&[]).unwrap();
    assert!(matches!(shim.register(&[]), Err(RuntimeError::ShimOrder { .. })));
}

#[test]
fn test_not_ready_until_main_thread_initialized() {
    let mut shim = EmscriptenShim::new();
    let mut env = emscripten_env();

    assert!(shim.ensure_ready().is_err());
    shim.register(&[]).unwrap();
    shim.instantiated().unwrap();
    let runtime = shim.finalize(&mut env).unwrap();
    assert!(shim.ensure_ready().is_err());

    shim.init_main_thread(runtime, &mut env).unwrap();
    assert!(shim.ensure_ready().is_ok());
}

#[test]
fn test_init_main_thread_call_order() {
    let mut shim = EmscriptenShim::new();
    let mut env = emscripten_env();
    start(&mut shim, &mut env).unwrap();

    let calls: Vec<&str> = env.state.calls.iter().map(String::as_str).collect();
    assert_eq!(
        calls,
        &[
            "emscripten_stack_get_base",
            "emscripten_stack_get_end",
            "emscripten_stack_init",
            "emscripten_stack_get_base",
            "emscripten_stack_get_end",
            "__set_stack_limits",
            "__wasm_call_ctors",
        ]
    );
}

#[test]
fn test_ctors_skipped_when_start_exported() {
    let mut shim = EmscriptenShim::new();
    let mut env = emscripten_env();
    env.export("_start", unit());

    start(&mut shim, &mut env).unwrap();
    assert!(!env.state.calls.iter().any(|c| c == "__wasm_call_ctors"));
    assert!(!env.state.calls.iter().any(|c| c == "_start"));
}

#[test]
fn test_plain_module_needs_no_stack_exports() {
    let mut shim = EmscriptenShim::new();
    let mut env = env();

    start(&mut shim, &mut env).unwrap();
    assert_eq!(shim.phase(), ShimPhase::MainThreadInitialized);
    assert_eq!(env.ctx.stack, None);
    assert!(env.state.calls.is_empty());
}

#[test]
fn test_stack_cookie_written() {
    let mut shim = EmscriptenShim::new();
    let mut env = emscripten_env();
    start(&mut shim, &mut env).unwrap();

    let view = env.view();
    assert_eq!(view.read_u32(0x4000).unwrap(), STACK_COOKIE_LOW);
    assert_eq!(view.read_u32(0x4004).unwrap(), STACK_COOKIE_HIGH);
    assert_eq!(view.read_u32(0).unwrap(), NULL_COOKIE);
}

#[test]
fn test_constructor_smashing_cookie_is_startup_trap() {
    let mut shim = EmscriptenShim::new();
    let mut env = emscripten_env();
    env.export("__wasm_call_ctors", |state: &mut MockState, _: &[WasmValue]| {
        state.writes.push((0x4000, 0xdead_beef));
        Ok(None)
    });

    let err = start(&mut shim, &mut env).unwrap_err();
    match err {
        RuntimeError::Startup { phase, interrupt } => {
            assert_eq!(phase, "stack check");
            assert!(matches!(interrupt, Interrupt::Trap(GuestTrap::Abort { .. })));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(shim.phase(), ShimPhase::Finalized);
}

#[test]
fn test_exit_during_constructors() {
    let mut shim = EmscriptenShim::new();
    let mut env = emscripten_env();
    env.export("__wasm_call_ctors", |_: &mut MockState, _: &[WasmValue]| Err(Interrupt::Exit(4)));

    let err = start(&mut shim, &mut env).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Startup {
            interrupt: Interrupt::Exit(4),
            ..
        }
    ));
    assert!(shim.ensure_ready().is_err());
}

// ============================================================================
// Registration and invoke trampolines
// ============================================================================

#[test]
fn test_register_generates_invoke_trampolines() {
    let mut shim = EmscriptenShim::new();
    let imports = [
        invoke_import("invoke_ii"),
        invoke_import("invoke_vi"),
        ImportSpec::new("env", "invoke_bogus", ImportKind::Function(Signature::new([], []))),
    ];
    let functions = shim.register(&imports).unwrap();

    let ii = functions.iter().find(|f| f.name() == "invoke_ii").unwrap();
    assert_eq!(ii.signature(), &Signature::new([ValueType::I32, ValueType::I32], [ValueType::I32]));
    assert!(functions.iter().any(|f| f.name() == "invoke_vi"));
    assert!(!functions.iter().any(|f| f.name() == "invoke_bogus"));
    assert!(functions.iter().all(|f| f.module() == EMSCRIPTEN_MODULE));
}

#[test]
fn test_invoke_calls_table_entry() {
    let mut shim = EmscriptenShim::new();
    let functions = shim.register(&[invoke_import("invoke_iii")]).unwrap();
    let mut env = env();
    env.table.push(entry(returns(0)));
    env.table.push(entry(|_: &mut MockState, args: &[WasmValue]| {
        let sum = args[0].as_i32().unwrap() + args[1].as_i32().unwrap();
        Ok(Some(WasmValue::I32(sum)))
    }));

    let result = call(
        &mut env,
        &functions,
        "invoke_iii",
        &[WasmValue::I32(1), WasmValue::I32(20), WasmValue::I32(22)],
    )
    .unwrap();
    assert_eq!(result, Some(WasmValue::I32(42)));
    assert_eq!(env.state.calls, vec!["table[1]".to_string()]);
}

#[test]
fn test_invoke_catches_longjmp() {
    let mut shim = EmscriptenShim::new();
    let functions = shim.register(&[invoke_import("invoke_ii")]).unwrap();
    let mut env = env();
    env.export("emscripten_stack_get_current", |state: &mut MockState, _: &[WasmValue]| {
        Ok(Some(WasmValue::I32(state.stack_pointer)))
    });
    env.export("_emscripten_stack_restore", |state: &mut MockState, args: &[WasmValue]| {
        state.stack_pointer = args[0].as_i32().unwrap();
        Ok(None)
    });
    env.export("setThrew", |state: &mut MockState, args: &[WasmValue]| {
        state.threw = Some((args[0].as_i32().unwrap(), args[1].as_i32().unwrap()));
        Ok(None)
    });
    env.state.stack_pointer = 0x7000;
    env.table.push(entry(|state: &mut MockState, _: &[WasmValue]| {
        state.stack_pointer = 0x6f00;
        Err(GuestTrap::Longjmp.into())
    }));

    let result = call(&mut env, &functions, "invoke_ii", &[WasmValue::I32(0), WasmValue::I32(5)]).unwrap();
    assert_eq!(result, Some(WasmValue::I32(0)));
    assert_eq!(env.state.threw, Some((1, 0)));
    assert_eq!(env.state.stack_pointer, 0x7000);
}

#[test]
fn test_invoke_propagates_other_traps_and_exits() {
    let mut shim = EmscriptenShim::new();
    let functions = shim.register(&[invoke_import("invoke_v")]).unwrap();
    let mut env = env();
    env.export("setThrew", unit());
    env.table.push(entry(|_: &mut MockState, _: &[WasmValue]| Err(GuestTrap::abort("boom").into())));
    env.table.push(entry(|_: &mut MockState, _: &[WasmValue]| Err(Interrupt::Exit(9))));

    let err = call(&mut env, &functions, "invoke_v", &[WasmValue::I32(0)]).unwrap_err();
    assert_eq!(err, Interrupt::Trap(GuestTrap::abort("boom")));

    let err = call(&mut env, &functions, "invoke_v", &[WasmValue::I32(1)]).unwrap_err();
    assert_eq!(err, Interrupt::Exit(9));
    assert!(!env.state.calls.iter().any(|c| c == "setThrew"));
}

#[test]
fn test_longjmp_without_set_threw_propagates() {
    let mut shim = EmscriptenShim::new();
    let functions = shim.register(&[invoke_import("invoke_v")]).unwrap();
    let mut env = env();
    env.table.push(entry(|_: &mut MockState, _: &[WasmValue]| Err(GuestTrap::Longjmp.into())));

    let err = call(&mut env, &functions, "invoke_v", &[WasmValue::I32(0)]).unwrap_err();
    assert_eq!(err, Interrupt::Trap(GuestTrap::Longjmp));
}

// ============================================================================
// Runtime imports
// ============================================================================

#[test]
fn test_resize_heap() {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    let mut env = env();
    let page = WASM_PAGE_SIZE as i32;

    let r = call(&mut env, &functions, "emscripten_resize_heap", &[WasmValue::I32(page)]).unwrap();
    assert_eq!(r, Some(WasmValue::I32(1)));
    assert_eq!(env.memory.len(), WASM_PAGE_SIZE as usize);

    let r = call(&mut env, &functions, "emscripten_resize_heap", &[WasmValue::I32(3 * page + 1)]).unwrap();
    assert_eq!(r, Some(WasmValue::I32(1)));
    assert_eq!(env.memory.len(), 4 * WASM_PAGE_SIZE as usize);

    let r = call(&mut env, &functions, "emscripten_resize_heap", &[WasmValue::I32(64 * page)]).unwrap();
    assert_eq!(r, Some(WasmValue::I32(0)));
    assert_eq!(env.memory.len(), 4 * WASM_PAGE_SIZE as usize);
}

#[test]
fn test_getcwd() {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    let mut env = env();

    let r = call(&mut env, &functions, "__syscall_getcwd", &[WasmValue::I32(64), WasmValue::I32(16)]).unwrap();
    assert_eq!(r, Some(WasmValue::I32(2)));
    assert_eq!(env.view().read_c_string(64).unwrap(), "/");

    let r = call(&mut env, &functions, "__syscall_getcwd", &[WasmValue::I32(64), WasmValue::I32(1)]).unwrap();
    assert_eq!(r, Some(WasmValue::I32(-Errno::Range.raw())));

    let r = call(&mut env, &functions, "__syscall_getcwd", &[WasmValue::I32(64), WasmValue::I32(0)]).unwrap();
    assert_eq!(r, Some(WasmValue::I32(-Errno::Inval.raw())));
}

#[test]
fn test_assert_fail_logs_and_traps() {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    let mut env = env();
    {
        let mut view = env.view();
        view.write_bytes(100, b"x > 0\0").unwrap();
        view.write_bytes(200, b"main.c\0").unwrap();
        view.write_bytes(300, b"check\0").unwrap();
    }

    let args = [WasmValue::I32(100), WasmValue::I32(200), WasmValue::I32(12), WasmValue::I32(300)];
    let err = call(&mut env, &functions, "__assert_fail", &args).unwrap_err();
    assert_eq!(
        err,
        Interrupt::Trap(GuestTrap::abort("Assertion failed: x > 0, at: main.c,12,check"))
    );

    let entries = env.ctx.host.console().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].level, ConsoleLevel::Error);
    assert!(entries[0].message.starts_with("Assertion failed"));
}

#[test]
fn test_console_log_levels() {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    let mut env = env();
    env.view().write_bytes(16, b"hello\0").unwrap();

    call(&mut env, &functions, "emscripten_console_log", &[WasmValue::I32(16)]).unwrap();
    call(&mut env, &functions, "emscripten_console_warn", &[WasmValue::I32(16)]).unwrap();

    let levels: Vec<_> = env.ctx.host.console().entries().iter().map(|e| e.level).collect();
    assert_eq!(levels, vec![ConsoleLevel::Log, ConsoleLevel::Warn]);
}

#[test]
fn test_tzset_reports_utc() {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    let mut env = env();
    env.view().write_i32(0, -1).unwrap();

    let args = [WasmValue::I32(0), WasmValue::I32(4), WasmValue::I32(8), WasmValue::I32(16)];
    call(&mut env, &functions, "_tzset_js", &args).unwrap();

    let view = env.view();
    assert_eq!(view.read_u32(0).unwrap(), 0);
    assert_eq!(view.read_u32(4).unwrap(), 0);
    assert_eq!(view.read_c_string(8).unwrap(), "UTC");
    assert_eq!(view.read_c_string(16).unwrap(), "UTC");
}

#[test]
fn test_exit_records_code() {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    let mut env = env();

    let err = call(&mut env, &functions, "exit", &[WasmValue::I32(3)]).unwrap_err();
    assert_eq!(err, Interrupt::Exit(3));
    assert_eq!(env.ctx.host.exit_code(), Some(3));
}

#[test]
fn test_longjmp_and_stack_overflow_trap() {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    let mut env = env();

    let err = call(&mut env, &functions, "_emscripten_throw_longjmp", &[]).unwrap_err();
    assert_eq!(err, Interrupt::Trap(GuestTrap::Longjmp));

    let err = call(&mut env, &functions, "__handle_stack_overflow", &[WasmValue::I32(0x10)]).unwrap_err();
    assert_eq!(err, Interrupt::Trap(GuestTrap::StackOverflow { addr: 0x10 }));
}

#[test]
fn test_closed_host_fails_fast() {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    let mut env = env();
    env.ctx.host.close();

    let err = call(&mut env, &functions, "emscripten_get_now", &[]).unwrap_err();
    assert_eq!(err, Interrupt::Trap(GuestTrap::HostClosed));
}

// ============================================================================
// File syscalls
// ============================================================================

const O_RDONLY: i32 = 0;
const O_WRONLY: i32 = 0o1;
const O_RDWR: i32 = 0o2;
const O_CREAT: i32 = 0o100;
const O_EXCL: i32 = 0o200;
const O_APPEND: i32 = 0o2000;
const O_NONBLOCK: i32 = 0o4000;
const O_NOFOLLOW: i32 = 0o400_000;
const AT_SYMLINK_NOFOLLOW: i32 = 0x100;
const AT_REMOVEDIR: i32 = 0x200;
const AT_EMPTY_PATH: i32 = 0x1000;
const S_IFMT: u32 = 0o170_000;

/// A guest with `dir` preopened as `/data`, which is also the working directory.
fn sandboxed(dir: &std::path::Path) -> (MockEnv, Vec<HostFunctionDescriptor>) {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    (MockEnv::new(host(Some(dir)).0), functions)
}

/// Store a C string at `addr` and return the pointer argument.
fn cstr(env: &mut MockEnv, addr: u32, text: &str) -> WasmValue {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    env.view().write_bytes(addr, &bytes).unwrap();
    WasmValue::I32(addr as i32)
}

fn i32s(values: &[i32]) -> Vec<WasmValue> {
    values.iter().copied().map(WasmValue::I32).collect()
}

fn rc(result: HostResult) -> i32 {
    result.unwrap().and_then(|v| v.as_i32()).unwrap()
}

fn errno(errno: Errno) -> i32 {
    -errno.raw()
}

fn openat(env: &mut MockEnv, functions: &[HostFunctionDescriptor], dirfd: i32, path: &str, flags: i32) -> i32 {
    let path = cstr(env, 100, path);
    let args = [WasmValue::I32(dirfd), path, WasmValue::I32(flags), WasmValue::I32(0)];
    rc(call(env, functions, "__syscall_openat", &args))
}

#[test]
fn test_openat_reads_inside_the_preopen() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
    let (mut env, functions) = sandboxed(dir.path());

    assert_eq!(openat(&mut env, &functions, AT_FDCWD, "notes.txt", O_RDONLY), 4);
    assert_eq!(openat(&mut env, &functions, AT_FDCWD, "/data/notes.txt", O_RDONLY), 5);
    assert_eq!(openat(&mut env, &functions, 3, "./notes.txt", O_RDONLY), 6);

    let mut buf = [0u8; 8];
    let n = env.ctx.host.fs_mut().read(4, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(env.ctx.host.fs_mut().write(4, b"x"), Err(Errno::NotCapable));

    assert_eq!(openat(&mut env, &functions, AT_FDCWD, "missing.txt", O_RDONLY), errno(Errno::NoEnt));
    assert_eq!(openat(&mut env, &functions, 42, "notes.txt", O_RDONLY), errno(Errno::Badf));
    assert_eq!(openat(&mut env, &functions, AT_FDCWD, "notes.txt", 3), errno(Errno::Inval));
}

#[test]
fn test_openat_refuses_dotdot_escapes() {
    let outer = tempfile::tempdir().unwrap();
    let inner = outer.path().join("inner");
    std::fs::create_dir(&inner).unwrap();
    std::fs::write(outer.path().join("secret.txt"), "secret").unwrap();
    let (mut env, functions) = sandboxed(&inner);

    for path in ["../secret.txt", "/data/../secret.txt", "/secret.txt", "a/../../secret.txt"] {
        assert_eq!(
            openat(&mut env, &functions, AT_FDCWD, path, O_RDONLY),
            errno(Errno::NotCapable),
            "{path}"
        );
    }
    assert_eq!(
        openat(&mut env, &functions, 3, "../secret.txt", O_RDONLY),
        errno(Errno::NotCapable)
    );
    assert_eq!(
        openat(&mut env, &functions, AT_FDCWD, "../secret.txt", O_WRONLY | O_CREAT),
        errno(Errno::NotCapable)
    );
    assert!(!inner.join("secret.txt").exists());
}

#[cfg(unix)]
#[test]
fn test_openat_keeps_symlinks_inside_the_preopen() {
    let outer = tempfile::tempdir().unwrap();
    let inner = outer.path().join("inner");
    std::fs::create_dir(&inner).unwrap();
    std::fs::write(outer.path().join("secret.txt"), "secret").unwrap();
    std::fs::write(inner.join("own.txt"), "own").unwrap();
    std::os::unix::fs::symlink(outer.path().join("secret.txt"), inner.join("escape")).unwrap();
    std::os::unix::fs::symlink("own.txt", inner.join("alias")).unwrap();
    let (mut env, functions) = sandboxed(&inner);

    assert_eq!(
        openat(&mut env, &functions, AT_FDCWD, "escape", O_RDONLY),
        errno(Errno::NotCapable)
    );
    assert_eq!(openat(&mut env, &functions, 3, "escape", O_RDWR), errno(Errno::NotCapable));
    assert_eq!(
        openat(&mut env, &functions, AT_FDCWD, "escape", O_RDONLY | O_NOFOLLOW),
        errno(Errno::Loop)
    );
    assert_eq!(openat(&mut env, &functions, AT_FDCWD, "alias", O_RDONLY), 4);

    let path = cstr(&mut env, 100, "escape");
    let r = rc(call(&mut env, &functions, "__syscall_stat64", &[path, WasmValue::I32(256)]));
    assert_eq!(r, errno(Errno::NotCapable));
    let r = rc(call(&mut env, &functions, "__syscall_lstat64", &[path, WasmValue::I32(256)]));
    assert_eq!(r, 0);
    assert_eq!(env.view().read_u32(260).unwrap() & S_IFMT, 0o120_000);

    let args = [WasmValue::I32(AT_FDCWD), path, WasmValue::I32(0), WasmValue::I32(AT_SYMLINK_NOFOLLOW)];
    let r = rc(call(&mut env, &functions, "__syscall_utimensat", &args));
    assert_eq!(r, errno(Errno::Loop));
    assert_eq!(std::fs::read_to_string(outer.path().join("secret.txt")).unwrap(), "secret");
}

#[cfg(unix)]
#[test]
fn test_openat_creates_with_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let (mut env, functions) = sandboxed(dir.path());
    env.view().write_u32(500, 0o600).unwrap();

    let path = cstr(&mut env, 100, "new.txt");
    let flags = O_WRONLY | O_CREAT | O_EXCL;
    let args = [WasmValue::I32(AT_FDCWD), path, WasmValue::I32(flags), WasmValue::I32(500)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_openat", &args)), 4);
    assert_eq!(env.ctx.host.fs_mut().write(4, b"abc"), Ok(3));

    let meta = std::fs::metadata(dir.path().join("new.txt")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    assert_eq!(meta.len(), 3);

    let r = rc(call(&mut env, &functions, "__syscall_openat", &args));
    assert_eq!(r, errno(Errno::Exist));
}

#[test]
fn test_stat_layout() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
    let (mut env, functions) = sandboxed(dir.path());

    let path = cstr(&mut env, 100, "notes.txt");
    assert_eq!(rc(call(&mut env, &functions, "__syscall_stat64", &[path, WasmValue::I32(256)])), 0);
    {
        let view = env.view();
        assert_eq!(view.read_u32(256 + 4).unwrap() & S_IFMT, 0o100_000);
        assert_eq!(view.read_u64(256 + 24).unwrap(), 5);
        assert_eq!(view.read_u32(256 + 32).unwrap(), 4096);
        assert!(view.read_u64(256 + 56).unwrap() > 0);
        assert!(view.read_u32(256 + 64).unwrap() < 1_000_000_000);
    }

    let fd = openat(&mut env, &functions, AT_FDCWD, "notes.txt", O_RDONLY);
    assert_eq!(rc(call(&mut env, &functions, "__syscall_fstat64", &i32s(&[fd, 512]))), 0);
    let view = env.view();
    assert_eq!(view.read_u64(512 + 24).unwrap(), 5);
    assert_eq!(view.read_u64(512 + 88).unwrap(), view.read_u64(256 + 88).unwrap());

    let empty = cstr(&mut env, 100, "");
    let args = [WasmValue::I32(3), empty, WasmValue::I32(768), WasmValue::I32(AT_EMPTY_PATH)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_newfstatat", &args)), 0);
    assert_eq!(env.view().read_u32(768 + 4).unwrap() & S_IFMT, 0o040_000);

    let args = [WasmValue::I32(3), empty, WasmValue::I32(768), WasmValue::I32(0)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_newfstatat", &args)), errno(Errno::NoEnt));

    let err = call(&mut env, &functions, "__syscall_fstat64", &i32s(&[fd, 0x1_0000 - 8])).unwrap_err();
    assert!(matches!(err, Interrupt::Trap(GuestTrap::OutOfBounds { .. })));

    let r = rc(call(&mut env, &functions, "__syscall_stat64", &i32s(&[0, 256])));
    assert_eq!(r, errno(Errno::Fault));
    let r = rc(call(&mut env, &functions, "__syscall_fstat64", &i32s(&[99, 256])));
    assert_eq!(r, errno(Errno::Badf));
}

#[test]
fn test_directory_syscalls() {
    let dir = tempfile::tempdir().unwrap();
    let (mut env, functions) = sandboxed(dir.path());

    let sub = cstr(&mut env, 100, "sub");
    let args = [WasmValue::I32(AT_FDCWD), sub, WasmValue::I32(0o755)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_mkdirat", &args)), 0);
    assert!(dir.path().join("sub").is_dir());
    assert_eq!(rc(call(&mut env, &functions, "__syscall_mkdirat", &args)), errno(Errno::Exist));

    std::fs::write(dir.path().join("sub/file.txt"), "x").unwrap();
    let args = [WasmValue::I32(AT_FDCWD), sub, WasmValue::I32(0)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_unlinkat", &args)), errno(Errno::IsDir));

    let file = cstr(&mut env, 200, "/data/sub/file.txt");
    let args = [WasmValue::I32(AT_FDCWD), file, WasmValue::I32(0)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_unlinkat", &args)), 0);
    assert!(!dir.path().join("sub/file.txt").exists());

    let args = [WasmValue::I32(3), sub, WasmValue::I32(AT_REMOVEDIR)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_unlinkat", &args)), 0);
    assert!(!dir.path().join("sub").exists());

    std::fs::create_dir(dir.path().join("gone")).unwrap();
    let gone = cstr(&mut env, 100, "gone");
    assert_eq!(rc(call(&mut env, &functions, "__syscall_rmdir", &[gone])), 0);
    assert_eq!(rc(call(&mut env, &functions, "__syscall_rmdir", &[gone])), errno(Errno::NoEnt));

    let up = cstr(&mut env, 100, "..");
    assert_eq!(rc(call(&mut env, &functions, "__syscall_rmdir", &[up])), errno(Errno::NotCapable));
}

#[cfg(unix)]
#[test]
fn test_readlinkat_truncates() {
    let dir = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink("target.txt", dir.path().join("link")).unwrap();
    let (mut env, functions) = sandboxed(dir.path());

    let link = cstr(&mut env, 100, "link");
    let args = [WasmValue::I32(AT_FDCWD), link, WasmValue::I32(600), WasmValue::I32(64)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_readlinkat", &args)), 10);
    assert_eq!(env.view().read_bytes(600, 10).unwrap(), b"target.txt");

    let args = [WasmValue::I32(3), link, WasmValue::I32(700), WasmValue::I32(6)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_readlinkat", &args)), 6);
    assert_eq!(env.view().read_bytes(700, 6).unwrap(), b"target");

    let args = [WasmValue::I32(AT_FDCWD), link, WasmValue::I32(600), WasmValue::I32(0)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_readlinkat", &args)), errno(Errno::Inval));
}

#[cfg(unix)]
#[test]
fn test_access_and_permission_syscalls() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "hello").unwrap();
    std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).unwrap();
    let (mut env, functions) = sandboxed(dir.path());

    let path = cstr(&mut env, 100, "notes.txt");
    let access = |env: &mut MockEnv, amode: i32| {
        let args = [WasmValue::I32(AT_FDCWD), WasmValue::I32(100), WasmValue::I32(amode), WasmValue::I32(0)];
        rc(call(env, &functions, "__syscall_faccessat", &args))
    };
    assert_eq!(access(&mut env, 0), 0);
    assert_eq!(access(&mut env, 4 | 2), 0);
    assert_eq!(access(&mut env, 1), errno(Errno::Acces));
    assert_eq!(access(&mut env, 8), errno(Errno::Inval));

    assert_eq!(rc(call(&mut env, &functions, "__syscall_chmod", &[path, WasmValue::I32(0o444)])), 0);
    assert_eq!(std::fs::metadata(&file).unwrap().permissions().mode() & 0o777, 0o444);
    assert_eq!(access(&mut env, 2), errno(Errno::Acces));

    let fd = openat(&mut env, &functions, AT_FDCWD, "notes.txt", O_RDONLY);
    assert_eq!(rc(call(&mut env, &functions, "__syscall_fchmod", &i32s(&[fd, 0o755]))), 0);
    assert_eq!(std::fs::metadata(&file).unwrap().permissions().mode() & 0o777, 0o755);
    assert_eq!(access(&mut env, 1), 0);

    assert_eq!(rc(call(&mut env, &functions, "__syscall_fchown32", &i32s(&[fd, -1, -1]))), 0);
    assert_eq!(rc(call(&mut env, &functions, "__syscall_fchmod", &i32s(&[1, 0o600]))), errno(Errno::NotCapable));

    cstr(&mut env, 100, "missing.txt");
    assert_eq!(access(&mut env, 0), errno(Errno::NoEnt));
}

#[test]
fn test_utimensat_sets_times() {
    use std::time::{Duration, UNIX_EPOCH};

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "hello").unwrap();
    let (mut env, functions) = sandboxed(dir.path());

    let path = cstr(&mut env, 100, "notes.txt");
    {
        let mut view = env.view();
        view.write_u64(700, 1_000_000).unwrap();
        view.write_u32(708, 0).unwrap();
        view.write_u64(716, 2_000_000).unwrap();
        view.write_u32(724, 500).unwrap();
    }
    let args = [WasmValue::I32(AT_FDCWD), path, WasmValue::I32(700), WasmValue::I32(0)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_utimensat", &args)), 0);
    let expected = UNIX_EPOCH + Duration::new(2_000_000, 500);
    assert_eq!(std::fs::metadata(&file).unwrap().modified().unwrap(), expected);

    // Touch only the access time; the modification time stays.
    {
        let mut view = env.view();
        view.write_u32(708, 0x3fff_ffff).unwrap();
        view.write_u32(724, 0x3fff_fffe).unwrap();
    }
    assert_eq!(rc(call(&mut env, &functions, "__syscall_utimensat", &args)), 0);
    assert_eq!(std::fs::metadata(&file).unwrap().modified().unwrap(), expected);

    env.view().write_u32(724, 1_000_000_000).unwrap();
    assert_eq!(rc(call(&mut env, &functions, "__syscall_utimensat", &args)), errno(Errno::Inval));

    let fd = openat(&mut env, &functions, AT_FDCWD, "notes.txt", O_RDWR);
    let args = [WasmValue::I32(fd), WasmValue::I32(0), WasmValue::I32(0), WasmValue::I32(0)];
    assert_eq!(rc(call(&mut env, &functions, "__syscall_utimensat", &args)), 0);
    assert!(std::fs::metadata(&file).unwrap().modified().unwrap() > expected);
}

#[test]
fn test_truncate_and_sync() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "hello").unwrap();
    let (mut env, functions) = sandboxed(dir.path());

    let fd = openat(&mut env, &functions, AT_FDCWD, "notes.txt", O_RDWR);
    let truncate = |env: &mut MockEnv, fd: i32, len: i64| {
        rc(call(env, &functions, "__syscall_ftruncate64", &[WasmValue::I32(fd), WasmValue::I64(len)]))
    };
    assert_eq!(truncate(&mut env, fd, 2), 0);
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "he");
    assert_eq!(truncate(&mut env, fd, -1), errno(Errno::Inval));
    assert_eq!(rc(call(&mut env, &functions, "__syscall_fdatasync", &i32s(&[fd]))), 0);

    let read_only = openat(&mut env, &functions, AT_FDCWD, "notes.txt", O_RDONLY);
    assert_eq!(truncate(&mut env, read_only, 0), errno(Errno::NotCapable));
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "he");
}

#[test]
fn test_fcntl_and_ioctl() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
    let (mut env, functions) = sandboxed(dir.path());
    let fd = openat(&mut env, &functions, AT_FDCWD, "notes.txt", O_RDWR | O_APPEND);
    let fcntl = |env: &mut MockEnv, fd: i32, cmd: i32| rc(call(env, &functions, "__syscall_fcntl64", &i32s(&[fd, cmd, 800])));

    assert_eq!(fcntl(&mut env, fd, 3), O_RDWR | O_APPEND);
    env.view().write_u32(800, O_NONBLOCK as u32).unwrap();
    assert_eq!(fcntl(&mut env, fd, 4), 0);
    assert_eq!(fcntl(&mut env, fd, 3), O_RDWR | O_NONBLOCK);
    assert_eq!(fcntl(&mut env, fd, 1), 0);

    // Locks are always granted; F_GETLK reports the range unlocked.
    {
        let mut view = env.view();
        view.write_u32(800, 900).unwrap();
        view.write_u16(900, 1).unwrap();
    }
    assert_eq!(fcntl(&mut env, fd, 6), 0);
    assert_eq!(fcntl(&mut env, fd, 5), 0);
    assert_eq!(env.view().read_u16(900).unwrap(), 2);

    assert_eq!(fcntl(&mut env, fd, 0), errno(Errno::Inval));
    assert_eq!(fcntl(&mut env, 99, 3), errno(Errno::Badf));

    let ioctl = |env: &mut MockEnv, fd: i32| rc(call(env, &functions, "__syscall_ioctl", &i32s(&[fd, 0x5401, 0])));
    assert_eq!(ioctl(&mut env, 1), errno(Errno::NotTy));
    assert_eq!(ioctl(&mut env, 99), errno(Errno::Badf));
}

#[test]
fn test_mmap_reads_and_munmap_writes_back() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("data.bin");
    std::fs::write(&file, "abcdef").unwrap();
    let (mut env, functions) = sandboxed(dir.path());
    let fd = openat(&mut env, &functions, AT_FDCWD, "data.bin", O_RDWR);

    let mmap_args = |shared: i32| {
        vec![
            WasmValue::I32(6),
            WasmValue::I32(3),
            WasmValue::I32(shared),
            WasmValue::I32(fd),
            WasmValue::I64(0),
            WasmValue::I32(800),
            WasmValue::I32(804),
        ]
    };
    let r = rc(call(&mut env, &functions, "_mmap_js", &mmap_args(1)));
    assert_eq!(r, errno(Errno::NoMem));

    env.export("emscripten_builtin_memalign", returns(4096));
    assert_eq!(rc(call(&mut env, &functions, "_mmap_js", &mmap_args(1))), 0);
    assert_eq!(env.state.calls, ["emscripten_builtin_memalign"]);
    {
        let mut view = env.view();
        assert_eq!(view.read_u32(800).unwrap(), 1);
        assert_eq!(view.read_u32(804).unwrap(), 4096);
        assert_eq!(view.read_bytes(4096, 6).unwrap(), b"abcdef");
        view.write_u8(4096, b'X').unwrap();
    }

    let munmap_args = |flags: i32| {
        vec![
            WasmValue::I32(4096),
            WasmValue::I32(6),
            WasmValue::I32(3),
            WasmValue::I32(flags),
            WasmValue::I32(fd),
            WasmValue::I64(0),
        ]
    };
    assert_eq!(rc(call(&mut env, &functions, "_munmap_js", &munmap_args(2))), 0);
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "abcdef");
    assert_eq!(rc(call(&mut env, &functions, "_munmap_js", &munmap_args(1))), 0);
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "Xbcdef");

    let mut args = munmap_args(1);
    args[4] = WasmValue::I32(99);
    assert_eq!(rc(call(&mut env, &functions, "_munmap_js", &args)), errno(Errno::Badf));
}

#[test]
fn test_localtime_is_utc() {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    let mut env = env();

    // 2023-11-14T22:13:20Z, a Tuesday.
    let args = [WasmValue::I64(1_700_000_000), WasmValue::I32(900)];
    assert_eq!(call(&mut env, &functions, "_localtime_js", &args).unwrap(), None);

    let view = env.view();
    let fields: Vec<u32> = (0..10).map(|i| view.read_u32(900 + 4 * i).unwrap()).collect();
    assert_eq!(fields, [20, 13, 22, 14, 10, 123, 2, 317, 0, 0]);

    let args = [WasmValue::I64(i64::MAX), WasmValue::I32(900)];
    let err = call(&mut env, &functions, "_localtime_js", &args).unwrap_err();
    assert!(matches!(err, Interrupt::Trap(_)));
}

#[test]
fn test_asm_const_traps_and_live_runtime_exits() {
    let functions = EmscriptenShim::new().register(&[]).unwrap();
    let mut env = env();
    let code = cstr(&mut env, 100, "alert(1)");

    let err = call(&mut env, &functions, "emscripten_asm_const_int", &[code, WasmValue::I32(0), WasmValue::I32(0)])
        .unwrap_err();
    assert_eq!(err, Interrupt::Trap(GuestTrap::abort("EM_ASM is not supported: alert(1)")));

    let err = call(&mut env, &functions, "emscripten_exit_with_live_runtime", &[]).unwrap_err();
    assert_eq!(err, Interrupt::Exit(0));
    assert_eq!(env.ctx.host.exit_code(), None);
}
