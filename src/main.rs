//! weh CLI entry point.
//!
//! Runs one WebAssembly module against the embedder host and exits with the
//! guest's exit code:
//! - `0..` what the guest returned from `main` or passed to `proc_exit`
//! - `1` the guest trapped
//! - `2` the module could not be embedded (compilation, linkage, config)

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weh_common::{ConfigFile, EngineKind, PreopenEntry, RuntimeConfig};
use weh_core::{EngineAdapter, EntryPoint, ExecutionOutcome, ExecutionReport, ModuleExecutor};
use weh_host::EmbedderHostBuilder;
use weh_wasmi::{WasmiAdapter, WasmiEngine};
use weh_wasmtime::{WasmtimeAdapter, WasmtimeEngine};

/// Exit status when the module never got to run.
const EMBEDDING_FAILURE: i32 = 2;

/// Run a WebAssembly module with WASI Preview 1 and Emscripten imports.
#[derive(Debug, Parser)]
#[command(name = "weh", version, about)]
struct Cli {
    /// Module to run, binary or text format.
    module: Option<PathBuf>,

    /// Engine executing the module.
    #[arg(long, env = "WEH_ENGINE", value_name = "wasmtime|wasmi")]
    engine: Option<EngineKind>,

    /// Preopen a host directory, optionally under another guest name.
    #[arg(long = "dir", value_name = "HOST::GUEST")]
    dirs: Vec<PreopenEntry>,

    /// Give the guest the whole host filesystem instead of preopens.
    #[arg(long, conflicts_with = "dirs")]
    unrestricted: bool,

    /// Entry point: `start`, `main`, or any exported function name.
    #[arg(long)]
    entry: Option<EntryPoint>,

    /// Environment variable exposed to the guest.
    #[arg(long = "env", value_name = "K=V", value_parser = parse_env_var)]
    env: Vec<(String, String)>,

    /// TOML configuration file.
    #[arg(long, short, env = "WEH_CONFIG")]
    config: Option<PathBuf>,

    /// Fuel budget for the whole execution.
    #[arg(long)]
    fuel: Option<u64>,

    /// Wall-clock limit in milliseconds (wasmtime only).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Arguments passed to the guest after the program name.
    #[arg(last = true)]
    args: Vec<String>,
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid environment variable '{s}' (expected K=V)")),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,weh=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Embedding failed");
            eprintln!("weh: {e:#}");
            EMBEDDING_FAILURE
        }
    };
    std::process::exit(code);
}

/// Everything a run needs, after flags have been layered over the file.
#[derive(Debug)]
struct Invocation {
    module: PathBuf,
    entry: EntryPoint,
    runtime: RuntimeConfig,
}

fn resolve(cli: Cli) -> anyhow::Result<Invocation> {
    let file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)?,
        None => ConfigFile::default(),
    };

    let module = match (cli.module, &file.module) {
        (Some(path), _) => path,
        (None, Some(entry)) => PathBuf::from(&entry.path),
        (None, None) => bail!("no module given on the command line or in the config file"),
    };

    let entry = match (cli.entry, &file.module) {
        (Some(entry), _) => entry,
        (None, Some(entry)) => entry.entry.parse()?,
        (None, None) => EntryPoint::Auto,
    };

    let mut runtime = file.runtime;
    if let Some(kind) = cli.engine {
        runtime.engine.kind = kind;
    }
    if cli.fuel.is_some() {
        runtime.engine.fuel = cli.fuel;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        runtime.engine.timeout_ms = timeout_ms;
        runtime.engine.epoch_interruption = true;
    }

    let host = &mut runtime.host;
    if !cli.args.is_empty() || host.args.is_empty() {
        host.args = std::iter::once(program_name(&module)).chain(cli.args).collect();
    }
    host.env.extend(cli.env);
    host.filesystem.preopens.extend(cli.dirs);
    if cli.unrestricted {
        host.filesystem.unrestricted = true;
    }

    Ok(Invocation { module, entry, runtime })
}

fn program_name(module: &Path) -> String {
    module
        .file_name()
        .map_or_else(|| module.display().to_string(), |name| name.to_string_lossy().into_owned())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let invocation = resolve(cli)?;
    let bytes = tokio::fs::read(&invocation.module)
        .await
        .with_context(|| format!("Failed to read module '{}'", invocation.module.display()))?;

    info!(
        module = %invocation.module.display(),
        engine = %invocation.runtime.engine.kind,
        entry = %invocation.entry,
        "Starting weh"
    );

    let report = match invocation.runtime.engine.kind {
        EngineKind::Wasmtime => {
            let engine = WasmtimeEngine::new(&invocation.runtime.engine)?;
            let ticker = invocation
                .runtime
                .engine
                .epoch_interruption
                .then(|| spawn_epoch_ticker(engine.clone()));

            let result = execute(WasmtimeAdapter::new(engine), bytes, &invocation).await;
            if let Some(ticker) = ticker {
                ticker.abort();
            }
            result?
        }
        EngineKind::Wasmi => {
            if invocation.runtime.engine.epoch_interruption {
                warn!("wasmi has no epoch interruption; --timeout-ms is ignored");
            }
            let engine = WasmiEngine::new(&invocation.runtime.engine);
            execute(WasmiAdapter::new(engine), bytes, &invocation).await?
        }
    };

    debug!(phases = ?report.phases, console_entries = report.console.len(), "Execution report");
    if let ExecutionOutcome::Trapped { message, .. } = &report.outcome {
        eprintln!("weh: guest trapped: {message}");
    }
    Ok(report.outcome.exit_code())
}

/// Run the module on a blocking thread; guest code never runs on the runtime.
async fn execute<A>(adapter: A, bytes: Vec<u8>, invocation: &Invocation) -> anyhow::Result<ExecutionReport>
where
    A: EngineAdapter + Send + 'static,
{
    let host = EmbedderHostBuilder::from_config(&invocation.runtime.host).build()?;
    let entry = invocation.entry.clone();

    let report = tokio::task::spawn_blocking(move || ModuleExecutor::new(adapter).run(&bytes, host, &entry))
        .await
        .context("Execution task panicked")??;
    Ok(report)
}

/// Advance the engine epoch once per millisecond so deadlines are wall-clock.
fn spawn_epoch_ticker(engine: WasmtimeEngine) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(1));
        loop {
            interval.tick().await;
            engine.increment_epoch();
        }
    })
}
