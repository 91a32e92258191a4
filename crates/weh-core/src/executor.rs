//! Module execution.
//!
//! [`ModuleExecutor`] drives one guest run from bytes to outcome:
//!
//! 1. Compile the module and read its imports
//! 2. Register the Emscripten imports next to the WASI table
//! 3. Check every import before anything is instantiated
//! 4. Install, bind and instantiate
//! 5. Finalize the shim and run the main-thread start-up
//! 6. Invoke the entry point
//!
//! The embedder host is closed on every path out of a run, after the
//! instance is done with it.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};
use weh_common::{GuestTrap, Interrupt, RuntimeError};
use weh_host::{ConsoleEntry, EmbedderHost};

use crate::adapter::EngineAdapter;
use crate::context::{GuestEnv, GuestInstance, HostContext};
use crate::descriptor::check_imports;
use crate::emscripten::{EmscriptenShim, ShimPhase};
use crate::value::WasmValue;
use crate::wasi;

const START: &str = "_start";
const MAIN: &str = "main";
const MAIN_ARGC_ARGV: &str = "__main_argc_argv";

/// Which export to run once start-up has completed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EntryPoint {
    /// `_start` if exported, otherwise `main(0, 0)`.
    #[default]
    Auto,
    /// The WASI command entry point `_start`.
    Start,
    /// The Emscripten entry point `main(argc, argv)`.
    Main {
        /// Argument count.
        argc: i32,
        /// Guest address of the argument vector.
        argv: i32,
    },
    /// Any nullary export.
    Export(String),
}

impl EntryPoint {
    /// `main(0, 0)`.
    pub fn main() -> Self {
        Self::Main { argc: 0, argv: 0 }
    }
}

impl FromStr for EntryPoint {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(RuntimeError::invalid_config("entry point name is empty")),
            "auto" => Ok(Self::Auto),
            "start" | START => Ok(Self::Start),
            MAIN => Ok(Self::main()),
            other => Ok(Self::Export(other.to_string())),
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Auto => f.write_str("auto"),
            EntryPoint::Start => f.write_str(START),
            EntryPoint::Main { argc, argv } => write!(f, "main({argc}, {argv})"),
            EntryPoint::Export(name) => f.write_str(name),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The entry point returned, with its `i32` result if it has one.
    Returned(Option<i32>),

    /// The guest requested exit (`proc_exit`, `exit`).
    Exited(i32),

    /// Execution trapped.
    Trapped {
        /// Description of the trap.
        message: String,
        /// Trap code if available.
        code: Option<String>,
    },
}

impl ExecutionOutcome {
    /// Returns `true` if the entry point returned normally.
    pub fn is_returned(&self) -> bool {
        matches!(self, ExecutionOutcome::Returned(_))
    }

    /// Returns `true` if the guest exited.
    pub fn is_exit(&self) -> bool {
        matches!(self, ExecutionOutcome::Exited(_))
    }

    /// Returns `true` if execution trapped.
    pub fn is_trap(&self) -> bool {
        matches!(self, ExecutionOutcome::Trapped { .. })
    }

    /// Process exit status for this outcome; a trap maps to 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionOutcome::Returned(value) => value.unwrap_or(0),
            ExecutionOutcome::Exited(code) => *code,
            ExecutionOutcome::Trapped { .. } => 1,
        }
    }

    fn from_interrupt(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Exit(code) => ExecutionOutcome::Exited(code),
            Interrupt::Trap(GuestTrap::Engine { message, code }) => ExecutionOutcome::Trapped { message, code },
            Interrupt::Trap(trap) => ExecutionOutcome::Trapped {
                message: trap.to_string(),
                code: None,
            },
        }
    }
}

/// Everything observed during one run.
#[derive(Debug)]
pub struct ExecutionReport {
    /// How the run ended.
    pub outcome: ExecutionOutcome,
    /// Emscripten shim phases entered, in order.
    pub phases: Vec<ShimPhase>,
    /// Guest console output.
    pub console: Vec<ConsoleEntry>,
    /// Wall-clock time from compilation to teardown.
    pub duration: Duration,
}

/// Runs modules on one engine.
#[derive(Debug)]
pub struct ModuleExecutor<A> {
    adapter: A,
}

impl<A: EngineAdapter> ModuleExecutor<A> {
    /// Create an executor over `adapter`.
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    /// The engine adapter.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Run `bytes` against `host`.
    ///
    /// Guest exits and traps are outcomes, not errors. A guest that exits or
    /// traps during start-up yields that outcome without reaching the entry
    /// point.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The module does not compile
    /// - An import is not provided, or is provided with another signature
    /// - The entry point is not exported
    /// - The host was already closed
    #[instrument(skip(self, bytes, host), fields(engine = self.adapter.name(), size = bytes.len(), entry = %entry))]
    pub fn run(&self, bytes: &[u8], host: EmbedderHost, entry: &EntryPoint) -> Result<ExecutionReport, RuntimeError> {
        let started = Instant::now();
        if host.is_closed() {
            return Err(RuntimeError::HostClosed);
        }

        let module = self.adapter.compile(bytes)?;
        let imports = self.adapter.imports(&module);
        debug!(imports = imports.len(), "Module compiled");

        let mut shim = EmscriptenShim::new();
        let mut functions = wasi::functions();
        functions.extend(shim.register(&imports)?);
        check_imports(&imports, &functions)?;

        let installed = self.adapter.install(&functions)?;
        let console = host.console().clone();
        let mut instance = match self.adapter.bind(installed, &module, HostContext::new(host)) {
            Ok(instance) => instance,
            Err(RuntimeError::Startup { phase, interrupt }) => {
                warn!(%phase, %interrupt, "Guest interrupted during instantiation");
                return Ok(ExecutionReport {
                    outcome: ExecutionOutcome::from_interrupt(interrupt),
                    phases: shim.history().to_vec(),
                    console: console.entries(),
                    duration: started.elapsed(),
                });
            }
            Err(err) => return Err(err),
        };

        let result = drive(&mut shim, &mut instance, entry);

        let host = &mut instance.context().host;
        let exit_code = host.exit_code();
        host.close();

        let outcome = match (result?, exit_code) {
            // The exit sink is authoritative if the engine lost the exit signal.
            (ExecutionOutcome::Trapped { .. }, Some(code)) => ExecutionOutcome::Exited(code),
            (outcome, _) => outcome,
        };
        let duration = started.elapsed();

        match &outcome {
            ExecutionOutcome::Trapped { message, code } => {
                error!(duration_ms = duration.as_millis(), trap_message = %message, trap_code = ?code, "Execution trapped");
            }
            outcome => {
                info!(duration_ms = duration.as_millis(), exit_code = outcome.exit_code(), "Execution completed");
            }
        }

        Ok(ExecutionReport {
            outcome,
            phases: shim.history().to_vec(),
            console: console.entries(),
            duration,
        })
    }
}

/// Everything between instantiation and teardown.
fn drive<I: GuestInstance>(
    shim: &mut EmscriptenShim,
    instance: &mut I,
    entry: &EntryPoint,
) -> Result<ExecutionOutcome, RuntimeError> {
    shim.instantiated()?;
    let startup = match shim.finalize(instance) {
        Ok(runtime) => shim.init_main_thread(runtime, instance),
        Err(err) => Err(err),
    };
    match startup {
        Ok(()) => {}
        Err(RuntimeError::Startup { phase, interrupt }) => {
            warn!(%phase, %interrupt, "Guest interrupted during start-up");
            return Ok(ExecutionOutcome::from_interrupt(interrupt));
        }
        Err(err) => return Err(err),
    }
    shim.ensure_ready()?;

    let (name, args) = resolve_entry(instance, entry)?;
    debug!(export = %name, engine = instance.engine_name(), "Invoking entry point");
    let outcome = match instance.call_export(&name, &args) {
        Ok(value) => ExecutionOutcome::Returned(value.and_then(|v| v.as_i32())),
        Err(interrupt) => ExecutionOutcome::from_interrupt(interrupt),
    };
    Ok(outcome)
}

/// Export name and arguments for `entry`.
fn resolve_entry<I: GuestInstance>(instance: &mut I, entry: &EntryPoint) -> Result<(String, Vec<WasmValue>), RuntimeError> {
    let (argc, argv) = match entry {
        EntryPoint::Auto if instance.has_export(START) => return resolve_entry(instance, &EntryPoint::Start),
        EntryPoint::Auto => (0, 0),
        EntryPoint::Start => {
            if !instance.has_export(START) {
                return Err(RuntimeError::entry_point_not_found(START));
            }
            return Ok((START.to_string(), Vec::new()));
        }
        EntryPoint::Main { argc, argv } => (*argc, *argv),
        EntryPoint::Export(name) => {
            if !instance.has_export(name) {
                return Err(RuntimeError::entry_point_not_found(name.clone()));
            }
            return Ok((name.clone(), Vec::new()));
        }
    };

    let name = [MAIN, MAIN_ARGC_ARGV]
        .into_iter()
        .find(|name| instance.has_export(name))
        .ok_or_else(|| match entry {
            EntryPoint::Auto => RuntimeError::entry_point_not_found(START),
            _ => RuntimeError::entry_point_not_found(MAIN),
        })?;

    // `int main(void)` compiles to a nullary export.
    let takes_args = instance
        .export_signature(name)
        .is_some_and(|signature| signature.params().len() == 2);
    let args = if takes_args {
        vec![WasmValue::I32(argc), WasmValue::I32(argv)]
    } else {
        Vec::new()
    };
    Ok((name.to_string(), args))
}
