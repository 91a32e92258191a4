//! Error types for weh.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Embedding-level failures (compile, link, lifecycle)
//! - [`HostError`]: Embedder host construction failures
//! - [`GuestTrap`]: Reasons a host call aborts the guest with a trap
//! - [`Interrupt`]: Non-local result of a host call (exit or trap)

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors represent failures of the embedding itself, from compilation
/// through linking to the Emscripten start-up sequence. Guest exits and guest
/// traps are not errors at this level; they are execution outcomes.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// A module import could not be satisfied.
    ///
    /// Raised before any guest code runs.
    #[error("Unsatisfied import {module}::{name}: {reason}")]
    Linkage {
        /// Import namespace (e.g. `wasi_snapshot_preview1`).
        module: String,
        /// Import name.
        name: String,
        /// Why the import was rejected.
        reason: String,
    },

    /// The requested entry point is not exported by the module.
    #[error("Entry point not found: {name}")]
    EntryPointNotFound {
        /// The export name that was looked up.
        name: String,
    },

    /// An Emscripten lifecycle step was invoked out of order.
    #[error("Emscripten shim out of order: expected {expected}, found {actual}")]
    ShimOrder {
        /// The phase the operation requires.
        expected: String,
        /// The phase the shim was actually in.
        actual: String,
    },

    /// A trap escaped outside of an entry point call (start section, constructors).
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// The guest exited or trapped while the runtime was starting up
    /// (stack setup, global constructors).
    #[error("Guest interrupted during {phase}: {interrupt}")]
    Startup {
        /// Start-up step that was running.
        phase: String,
        /// What the guest did.
        #[source]
        interrupt: Interrupt,
    },

    /// The embedder host was used after it was closed.
    #[error("Embedder host is closed")]
    HostClosed,

    /// Embedder host construction failed.
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors raised while building an embedder host.
#[derive(Error, Debug)]
pub enum HostError {
    /// A preopened host directory could not be opened.
    #[error("Failed to preopen '{}': {source}", host_path.display())]
    PreopenFailed {
        /// The host directory.
        host_path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A guest mount path is not usable (empty, relative with `..`, or NUL).
    #[error("Invalid guest path: {path:?}")]
    InvalidGuestPath {
        /// The rejected guest path.
        path: String,
    },

    /// Two preopens share the same guest mount path.
    #[error("Duplicate guest mount: {guest_path}")]
    DuplicateMount {
        /// The repeated guest path.
        guest_path: String,
    },

    /// Both a preopen list and the unrestricted flag were configured.
    #[error("Preopened directories and unrestricted access are mutually exclusive")]
    ConflictingSandbox,
}

/// Why a host call aborted the guest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuestTrap {
    /// A guest pointer/length pair fell outside linear memory.
    #[error("Out of bounds memory access: {len} bytes at {addr} (memory size {size})")]
    OutOfBounds {
        /// Guest address of the access.
        addr: u64,
        /// Length of the access in bytes.
        len: u64,
        /// Linear memory size at the time of the access.
        size: usize,
    },

    /// A host function was invoked after the embedder host was closed.
    #[error("Host function called after the embedder host was closed")]
    HostClosed,

    /// The guest module exports no linear memory.
    #[error("Guest module has no linear memory")]
    MissingMemory,

    /// The guest requested an abort (`abort`, `__assert_fail`, ...).
    #[error("Guest aborted: {message}")]
    Abort {
        /// Abort reason reported by the guest or the shim.
        message: String,
    },

    /// The guest overran its shadow stack.
    #[error("Stack overflow: stack pointer {addr:#x} outside the stack bounds")]
    StackOverflow {
        /// The offending stack pointer.
        addr: u64,
    },

    /// Emscripten `longjmp` unwinding towards the nearest `invoke_` trampoline.
    #[error("Emscripten longjmp")]
    Longjmp,

    /// A host function received arguments of the wrong shape.
    #[error("Invalid host call arguments: {reason}")]
    InvalidArgument {
        /// Description of the mismatch.
        reason: String,
    },

    /// A trap raised by the engine inside a nested guest call.
    #[error("Engine trap: {message}")]
    Engine {
        /// Description of the trap.
        message: String,
        /// Engine trap code if available.
        code: Option<String>,
    },
}

/// Non-local result of a host function.
///
/// Host functions return `Err(Interrupt)` to unwind the guest call stack.
/// Engine adapters translate it into their native exit or trap mechanism
/// and translate it back when the entry point call returns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    /// The guest requested process exit with the given status.
    #[error("Guest exited with code {0}")]
    Exit(i32),

    /// The guest must be aborted with a trap.
    #[error(transparent)]
    Trap(#[from] GuestTrap),
}

impl RuntimeError {
    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Linkage` error naming the offending import.
    pub fn linkage(
        module: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Linkage {
            module: module.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `EntryPointNotFound` error.
    pub fn entry_point_not_found(name: impl Into<String>) -> Self {
        Self::EntryPointNotFound { name: name.into() }
    }

    /// Create a new `ShimOrder` error.
    pub fn shim_order(expected: impl ToString, actual: impl ToString) -> Self {
        Self::ShimOrder {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `Startup` error.
    pub fn startup(phase: impl Into<String>, interrupt: Interrupt) -> Self {
        Self::Startup {
            phase: phase.into(),
            interrupt,
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is a linkage failure.
    pub fn is_linkage(&self) -> bool {
        matches!(self, Self::Linkage { .. })
    }
}

impl GuestTrap {
    /// Create a new `Abort` trap.
    pub fn abort(message: impl Into<String>) -> Self {
        Self::Abort {
            message: message.into(),
        }
    }

    /// Create a new `InvalidArgument` trap.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

impl Interrupt {
    /// Returns the exit code if this is an exit request.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit(code) => Some(*code),
            Self::Trap(_) => None,
        }
    }

    /// Returns `true` if this is a trap.
    pub fn is_trap(&self) -> bool {
        matches!(self, Self::Trap(_))
    }
}
