//! The embedder host.
//!
//! [`EmbedderHost`] is the sandbox a guest runs against: its descriptor table
//! and filesystem view, arguments and environment, clocks, entropy, console,
//! and the exit sink. Build one with [`EmbedderHost::builder`].

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use weh_common::{Errno, FilesystemConfig, GuestTrap, HostConfig, HostError, PreopenEntry, SymlinkPolicy};

use crate::clock::{Clock, SystemClock};
use crate::console::GuestConsole;
use crate::entropy::{EntropySource, OsEntropy};
use crate::fs::FileSystem;

/// Callback invoked with the guest's exit code.
pub type ExitHandler = Box<dyn FnMut(i32) + Send>;

/// Sandbox and services backing one guest execution.
///
/// # Lifecycle
///
/// The host is open from construction until [`EmbedderHost::close`] (or drop).
/// Closing releases every descriptor; afterwards [`EmbedderHost::ensure_open`]
/// fails, and host functions bound to this host trap instead of running.
pub struct EmbedderHost {
    fs: FileSystem,
    args: Vec<String>,
    environ: Vec<String>,
    clock: Box<dyn Clock>,
    entropy: Box<dyn EntropySource>,
    console: GuestConsole,
    cwd: String,
    exit_code: Option<i32>,
    exit_handler: Option<ExitHandler>,
    closed: bool,
}

impl EmbedderHost {
    /// Create a builder with an empty sandbox and inherited stdio.
    pub fn builder() -> EmbedderHostBuilder {
        EmbedderHostBuilder::default()
    }

    /// The filesystem view and descriptor table.
    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    /// The filesystem view and descriptor table, mutably.
    pub fn fs_mut(&mut self) -> &mut FileSystem {
        &mut self.fs
    }

    /// Descriptor of the preopened directory mounted under `name`.
    pub fn open_preopened(&self, name: &str) -> Option<u32> {
        self.fs.open_preopened(name)
    }

    /// Resolve a guest path relative to directory descriptor `fd`.
    ///
    /// Returns `NOTCAPABLE` if the path escapes the sandbox.
    pub fn resolve(&self, fd: u32, guest_path: &str) -> Result<PathBuf, Errno> {
        self.fs.resolve(fd, guest_path)
    }

    /// Command-line arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment as `KEY=VALUE` strings.
    pub fn environ(&self) -> &[String] {
        &self.environ
    }

    /// The guest clock.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Fill `buf` with random bytes.
    pub fn fill_random(&mut self, buf: &mut [u8]) -> Result<(), Errno> {
        self.entropy.fill(buf)
    }

    /// Guest console output.
    pub fn console(&self) -> &GuestConsole {
        &self.console
    }

    /// Guest console output, mutably.
    pub fn console_mut(&mut self) -> &mut GuestConsole {
        &mut self.console
    }

    /// Working directory reported to the guest.
    pub fn current_working_directory(&self) -> &str {
        &self.cwd
    }

    /// Record a guest exit request.
    ///
    /// Only the first request is kept; the exit handler runs once.
    pub fn record_exit(&mut self, code: i32) {
        if self.exit_code.is_some() {
            return;
        }
        info!(exit_code = code, "Guest requested exit");
        self.exit_code = Some(code);
        if let Some(handler) = self.exit_handler.as_mut() {
            handler(code);
        }
    }

    /// Exit code recorded by [`EmbedderHost::record_exit`].
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Release every descriptor. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.fs.close_all();
        self.closed = true;
        debug!("Embedder host closed");
    }

    /// Returns `true` once the host has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Fail with a trap if the host has been closed.
    pub fn ensure_open(&self) -> Result<(), GuestTrap> {
        if self.closed {
            Err(GuestTrap::HostClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for EmbedderHost {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for EmbedderHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedderHost")
            .field("fs", &self.fs)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("exit_code", &self.exit_code)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Builder for [`EmbedderHost`].
#[derive(Default)]
pub struct EmbedderHostBuilder {
    args: Vec<String>,
    env: BTreeMap<String, String>,
    inherit_env: bool,
    filesystem: FilesystemConfig,
    stdin: Option<Box<dyn Read + Send>>,
    stdout: Option<Box<dyn Write + Send>>,
    stderr: Option<Box<dyn Write + Send>>,
    clock: Option<Box<dyn Clock>>,
    entropy: Option<Box<dyn EntropySource>>,
    exit_handler: Option<ExitHandler>,
}

impl EmbedderHostBuilder {
    /// Start from a [`HostConfig`].
    #[must_use]
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            args: config.args.clone(),
            env: config.env.clone(),
            inherit_env: config.inherit_env,
            filesystem: config.filesystem.clone(),
            ..Self::default()
        }
    }

    /// Append a command-line argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several command-line arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Expose the embedding process environment as well.
    #[must_use]
    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    /// Expose `host_path` to the guest as `guest_path`.
    #[must_use]
    pub fn preopen(mut self, host_path: impl AsRef<Path>, guest_path: impl Into<String>) -> Self {
        self.filesystem.preopens.push(PreopenEntry::new(
            host_path.as_ref().display().to_string(),
            guest_path,
        ));
        self
    }

    /// Grant access to the whole host filesystem.
    #[must_use]
    pub fn unrestricted(mut self) -> Self {
        self.filesystem.unrestricted = true;
        self
    }

    /// Choose how symlinks are treated during path resolution.
    #[must_use]
    pub fn symlinks(mut self, policy: SymlinkPolicy) -> Self {
        self.filesystem.symlinks = policy;
        self
    }

    /// Working directory reported to the guest.
    #[must_use]
    pub fn current_working_directory(mut self, cwd: impl Into<String>) -> Self {
        self.filesystem.current_working_directory = Some(cwd.into());
        self
    }

    /// Standard input provider.
    #[must_use]
    pub fn stdin(mut self, stdin: impl Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    /// Standard output sink.
    #[must_use]
    pub fn stdout(mut self, stdout: impl Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    /// Standard error sink.
    #[must_use]
    pub fn stderr(mut self, stderr: impl Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    /// Replace the system clock.
    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// Replace the OS entropy source.
    #[must_use]
    pub fn entropy(mut self, entropy: impl EntropySource + 'static) -> Self {
        self.entropy = Some(Box::new(entropy));
        self
    }

    /// Callback invoked once when the guest exits.
    #[must_use]
    pub fn on_exit(mut self, handler: impl FnMut(i32) + Send + 'static) -> Self {
        self.exit_handler = Some(Box::new(handler));
        self
    }

    /// Open the preopened directories and build the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the sandbox configuration is inconsistent or a
    /// preopened directory cannot be opened.
    pub fn build(self) -> Result<EmbedderHost, HostError> {
        let fs = FileSystem::new(
            self.stdin.unwrap_or_else(|| Box::new(std::io::stdin())),
            self.stdout.unwrap_or_else(|| Box::new(std::io::stdout())),
            self.stderr.unwrap_or_else(|| Box::new(std::io::stderr())),
            &self.filesystem,
        )?;

        let mut env: BTreeMap<String, String> = if self.inherit_env {
            std::env::vars().collect()
        } else {
            BTreeMap::new()
        };
        env.extend(self.env);
        let environ = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();

        let cwd = self
            .filesystem
            .current_working_directory
            .clone()
            .or_else(|| {
                self.filesystem
                    .preopens
                    .first()
                    .map(|p| p.guest_path.clone())
                    .filter(|p| p.starts_with('/'))
            })
            .unwrap_or_else(|| "/".to_string());

        info!(
            preopens = self.filesystem.preopens.len(),
            unrestricted = self.filesystem.unrestricted,
            args = self.args.len(),
            "Embedder host created"
        );

        Ok(EmbedderHost {
            fs,
            args: self.args,
            environ,
            clock: self.clock.unwrap_or_else(|| Box::new(SystemClock::new())),
            entropy: self.entropy.unwrap_or_else(|| Box::new(OsEntropy)),
            console: GuestConsole::new(),
            cwd,
            exit_code: None,
            exit_handler: self.exit_handler,
            closed: false,
        })
    }
}

impl std::fmt::Debug for EmbedderHostBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedderHostBuilder")
            .field("args", &self.args)
            .field("filesystem", &self.filesystem)
            .finish_non_exhaustive()
    }
}
