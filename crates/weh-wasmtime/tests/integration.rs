//! Integration tests for weh-wasmtime.
//!
//! These tests run whole modules through the executor:
//! - WAT compilation and linking against the WASI table and Emscripten shim
//! - Emscripten start-up before `main`
//! - Preopened directories
//! - `proc_exit` as a distinguished exit
//! - Linkage failures before any guest code runs

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use weh_common::{EngineConfig, RuntimeError};
use weh_core::{EntryPoint, ExecutionOutcome, ExecutionReport, ModuleExecutor, ShimPhase};
use weh_host::{CapturedOutput, EmbedderHost};
use weh_wasmtime::{CompiledModule, WasmtimeAdapter, WasmtimeEngine};

fn executor(config: &EngineConfig) -> ModuleExecutor<WasmtimeAdapter> {
    let engine = WasmtimeEngine::new(config).unwrap();
    ModuleExecutor::new(WasmtimeAdapter::new(engine))
}

fn run(wat: &str, host: EmbedderHost, entry: &EntryPoint) -> Result<ExecutionReport, RuntimeError> {
    executor(&EngineConfig::default()).run(wat.as_bytes(), host, entry)
}

fn captured_host() -> (EmbedderHost, CapturedOutput) {
    let stdout = CapturedOutput::new();
    let host = EmbedderHost::builder().stdout(stdout.clone()).build().unwrap();
    (host, stdout)
}

/// Host with the whole filesystem mapped at `/`.
fn unrestricted_host() -> (EmbedderHost, CapturedOutput) {
    let stdout = CapturedOutput::new();
    let host = EmbedderHost::builder()
        .unrestricted()
        .stdout(stdout.clone())
        .build()
        .unwrap();
    assert_eq!(host.open_preopened("/"), Some(3));
    (host, stdout)
}

// ============================================================================
// Test: Emscripten main
// ============================================================================

const EMSCRIPTEN_MAIN: &str = r#"
    (module
        (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (memory (export "memory") 1)
        (global $base (mut i32) (i32.const 0))
        (global $end (mut i32) (i32.const 0))
        (global $ctors (mut i32) (i32.const 0))
        (data (i32.const 1024) "hello from main\n")

        (func (export "emscripten_stack_init")
            (global.set $base (i32.const 65536))
            (global.set $end (i32.const 49152)))
        (func (export "emscripten_stack_get_base") (result i32) (global.get $base))
        (func (export "emscripten_stack_get_end") (result i32) (global.get $end))
        (func (export "__wasm_call_ctors")
            (global.set $ctors (i32.add (global.get $ctors) (i32.const 1))))

        (func (export "main") (param $argc i32) (param $argv i32) (result i32)
            (i32.store (i32.const 16) (i32.const 1024))
            (i32.store (i32.const 20) (i32.const 16))
            (drop (call $fd_write (i32.const 1) (i32.const 16) (i32.const 1) (i32.const 32)))
            ;; 40 + constructor runs + argc
            (i32.add (i32.add (i32.const 40) (global.get $ctors)) (local.get $argc)))
    )
"#;

#[test]
fn test_main_returns_status_after_startup() {
    let (host, stdout) = unrestricted_host();
    let report = run(EMSCRIPTEN_MAIN, host, &EntryPoint::main()).unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Returned(Some(41)));
    assert_eq!(report.outcome.exit_code(), 41);
    assert_eq!(
        report.phases,
        vec![
            ShimPhase::Uninstalled,
            ShimPhase::ImportsRegistered,
            ShimPhase::Instantiated,
            ShimPhase::Finalized,
            ShimPhase::MainThreadInitialized,
        ]
    );
    assert_eq!(stdout.to_string_lossy(), "hello from main\n");
}

#[test]
fn test_auto_entry_finds_main() {
    let (host, _) = unrestricted_host();
    let report = run(EMSCRIPTEN_MAIN, host, &EntryPoint::Auto).unwrap();
    assert_eq!(report.outcome, ExecutionOutcome::Returned(Some(41)));
}

#[test]
fn test_main_receives_argc() {
    let (host, _) = captured_host();
    let report = run(EMSCRIPTEN_MAIN, host, &EntryPoint::Main { argc: 2, argv: 0 }).unwrap();
    assert_eq!(report.outcome, ExecutionOutcome::Returned(Some(43)));
}

#[test]
fn test_stack_cookie_smash_is_reported() {
    let wat = r#"
        (module
            (memory (export "memory") 1)
            (func (export "emscripten_stack_get_base") (result i32) (i32.const 65536))
            (func (export "emscripten_stack_get_end") (result i32) (i32.const 49152))
            (func (export "__wasm_call_ctors")
                (i32.store (i32.const 49152) (i32.const 0)))
            (func (export "main") (result i32) (i32.const 0))
        )
    "#;
    let (host, _) = captured_host();
    let report = run(wat, host, &EntryPoint::main()).unwrap();

    match report.outcome {
        ExecutionOutcome::Trapped { message, .. } => assert!(message.contains("Stack overflow"), "{message}"),
        other => panic!("expected trap, got {other:?}"),
    }
    assert_eq!(report.phases.last(), Some(&ShimPhase::Finalized));
}

// ============================================================================
// Test: Preopened Directories
// ============================================================================

#[test]
fn test_preopened_file_is_readable() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), b"remember the milk").unwrap();

    // Opens /data/notes.txt through fd 3, reads it and echoes it to stdout.
    let wat = r#"
        (module
            (import "wasi_snapshot_preview1" "path_open"
                (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 3000) "/data/notes.txt")

            (func (export "_start")
                (local $fd i32)
                (local $rc i32)
                (local.set $rc (call $path_open
                    (i32.const 3) (i32.const 0) (i32.const 3000) (i32.const 15)
                    (i32.const 0) (i64.const 2) (i64.const 0) (i32.const 0) (i32.const 3100)))
                (if (local.get $rc) (then unreachable))
                (local.set $fd (i32.load (i32.const 3100)))

                (i32.store (i32.const 1024) (i32.const 4096))
                (i32.store (i32.const 1028) (i32.const 64))
                (local.set $rc (call $fd_read (local.get $fd) (i32.const 1024) (i32.const 1) (i32.const 3200)))
                (if (local.get $rc) (then unreachable))

                (i32.store (i32.const 1028) (i32.load (i32.const 3200)))
                (drop (call $fd_write (i32.const 1) (i32.const 1024) (i32.const 1) (i32.const 3300))))
        )
    "#;

    let stdout = CapturedOutput::new();
    let host = EmbedderHost::builder()
        .stdout(stdout.clone())
        .preopen(dir.path(), "/data")
        .build()
        .unwrap();
    let report = run(wat, host, &EntryPoint::Auto).unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Returned(None));
    assert_eq!(stdout.to_string_lossy(), "remember the milk");
}

// ============================================================================
// Test: Process Exit
// ============================================================================

const EXIT_FROM_START: &str = r#"
    (module
        (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
        (memory (export "memory") 1)
        (func (export "_start")
            (call $proc_exit (i32.const 2))
            unreachable)
    )
"#;

#[test]
fn test_proc_exit_is_not_a_trap() {
    let code = Arc::new(AtomicI32::new(-1));
    let seen = Arc::clone(&code);
    let host = EmbedderHost::builder()
        .on_exit(move |c| seen.store(c, Ordering::SeqCst))
        .build()
        .unwrap();

    let report = run(EXIT_FROM_START, host, &EntryPoint::Start).unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Exited(2));
    assert!(!report.outcome.is_trap());
    assert_eq!(report.outcome.exit_code(), 2);
    assert_eq!(code.load(Ordering::SeqCst), 2);
}

#[test]
fn test_proc_exit_in_start_function() {
    let wat = r#"
        (module
            (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
            (import "env" "emscripten_console_log" (func $log (param i32)))
            (memory (export "memory") 1)
            (data (i32.const 64) "booting\00")
            (func $init
                (call $log (i32.const 64))
                (call $proc_exit (i32.const 3)))
            (start $init)
            (func (export "_start") unreachable)
        )
    "#;
    let (host, _) = captured_host();
    let report = run(wat, host, &EntryPoint::Auto).unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Exited(3));
    assert!(report.phases.iter().all(|p| *p != ShimPhase::Instantiated));
    assert_eq!(report.console.len(), 1);
    assert_eq!(report.console[0].message, "booting");
}

#[test]
fn test_engine_trap_is_reported() {
    let wat = r#"(module (func (export "_start") unreachable))"#;
    let (host, _) = captured_host();
    let report = run(wat, host, &EntryPoint::Start).unwrap();

    match report.outcome {
        ExecutionOutcome::Trapped { ref code, .. } => assert_eq!(code.as_deref(), Some("UnreachableCodeReached")),
        other => panic!("expected trap, got {other:?}"),
    }
    assert_eq!(report.outcome.exit_code(), 1);
}

// ============================================================================
// Test: Linkage
// ============================================================================

#[test]
fn test_missing_import_fails_before_guest_runs() {
    let wat = r#"
        (module
            (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
            (import "env" "not_provided" (func (param i32)))
            (func $init (call $proc_exit (i32.const 9)))
            (start $init)
            (func (export "_start"))
        )
    "#;
    let code = Arc::new(AtomicI32::new(-1));
    let seen = Arc::clone(&code);
    let host = EmbedderHost::builder()
        .on_exit(move |c| seen.store(c, Ordering::SeqCst))
        .build()
        .unwrap();

    match run(wat, host, &EntryPoint::Auto) {
        Err(RuntimeError::Linkage { module, name, .. }) => {
            assert_eq!(module, "env");
            assert_eq!(name, "not_provided");
        }
        other => panic!("expected linkage error, got {other:?}"),
    }
    assert_eq!(code.load(Ordering::SeqCst), -1);
}

#[test]
fn test_signature_mismatch_is_linkage_error() {
    let wat = r#"
        (module
            (import "wasi_snapshot_preview1" "fd_write" (func (param i32) (result i32)))
            (func (export "_start"))
        )
    "#;
    let (host, _) = captured_host();
    let err = run(wat, host, &EntryPoint::Auto).unwrap_err();
    assert!(err.is_linkage(), "{err}");
}

#[test]
fn test_missing_entry_point() {
    let wat = r#"(module (memory (export "memory") 1))"#;
    let (host, _) = captured_host();
    let err = run(wat, host, &EntryPoint::Start).unwrap_err();
    assert!(matches!(err, RuntimeError::EntryPointNotFound { .. }), "{err}");
}

#[test]
fn test_invalid_module_is_rejected() {
    let (host, _) = captured_host();
    let err = executor(&EngineConfig::default())
        .run(b"\0asm\x01\0\0\0\x7f", host, &EntryPoint::Auto)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::CompilationFailed { .. }), "{err}");
}

// ============================================================================
// Test: Imported Memory and Table
// ============================================================================

const LONGJMP: &str = r#"
    (module
        (import "env" "memory" (memory 1))
        (import "env" "__indirect_function_table" (table 2 funcref))
        (import "env" "invoke_vi" (func $invoke_vi (param i32 i32)))
        (import "env" "_emscripten_throw_longjmp" (func $throw))
        (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (global $threw (mut i32) (i32.const 0))
        (data (i32.const 1024) "caught\n")

        (func $jumps (param i32) (call $throw))
        (elem (i32.const 1) $jumps)

        (func (export "setThrew") (param i32 i32) (global.set $threw (local.get 0)))

        (func (export "_start")
            (call $invoke_vi (i32.const 1) (i32.const 7))
            (if (global.get $threw)
                (then
                    (i32.store (i32.const 16) (i32.const 1024))
                    (i32.store (i32.const 20) (i32.const 7))
                    (drop (call $fd_write (i32.const 1) (i32.const 16) (i32.const 1) (i32.const 32))))))
    )
"#;

#[test]
fn test_longjmp_through_invoke_with_imported_memory() {
    let (host, stdout) = captured_host();
    let report = run(LONGJMP, host, &EntryPoint::Auto).unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Returned(None));
    assert_eq!(stdout.to_string_lossy(), "caught\n");
}

#[test]
fn test_invoke_of_null_entry_traps() {
    let wat = r#"
        (module
            (import "env" "__indirect_function_table" (table 2 funcref))
            (import "env" "invoke_v" (func $invoke_v (param i32)))
            (func (export "_start") (call $invoke_v (i32.const 0)))
        )
    "#;
    let (host, _) = captured_host();
    let report = run(wat, host, &EntryPoint::Auto).unwrap();

    match report.outcome {
        ExecutionOutcome::Trapped { code, .. } => assert_eq!(code.as_deref(), Some("IndirectCallToNull")),
        other => panic!("expected trap, got {other:?}"),
    }
}

// ============================================================================
// Test: Resource Limits
// ============================================================================

#[test]
fn test_fuel_exhaustion_traps() {
    let wat = r#"
        (module
            (func (export "_start")
                (loop $forever (br $forever)))
        )
    "#;
    let config = EngineConfig {
        fuel: Some(10_000),
        ..Default::default()
    };
    let (host, _) = captured_host();
    let report = executor(&config).run(wat.as_bytes(), host, &EntryPoint::Auto).unwrap();

    match report.outcome {
        ExecutionOutcome::Trapped { code, .. } => assert_eq!(code.as_deref(), Some("OutOfFuel")),
        other => panic!("expected trap, got {other:?}"),
    }
}

#[test]
fn test_epoch_deadline_interrupts() {
    let wat = r#"
        (module
            (func (export "_start")
                (loop $forever (br $forever)))
        )
    "#;
    let config = EngineConfig {
        epoch_interruption: true,
        timeout_ms: 1,
        ..Default::default()
    };
    let engine = WasmtimeEngine::new(&config).unwrap();
    let ticker = engine.clone();
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop_ticker = Arc::clone(&stop);
    let handle = std::thread::spawn(move || {
        while !stop_ticker.load(Ordering::SeqCst) {
            ticker.increment_epoch();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    });

    let (host, _) = captured_host();
    let report = ModuleExecutor::new(WasmtimeAdapter::new(engine))
        .run(wat.as_bytes(), host, &EntryPoint::Auto)
        .unwrap();
    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();

    match report.outcome {
        ExecutionOutcome::Trapped { code, .. } => assert_eq!(code.as_deref(), Some("Interrupt")),
        other => panic!("expected trap, got {other:?}"),
    }
}

#[test]
fn test_compiled_module_lists_imports() {
    let engine = WasmtimeEngine::new(&EngineConfig::default()).unwrap();
    let module = CompiledModule::from_wat(engine.inner(), LONGJMP).unwrap();
    let imports = module.imports();

    assert_eq!(imports.len(), 5);
    assert!(imports[0].is_env_memory());
    assert!(imports[1].is_env_table());
}
