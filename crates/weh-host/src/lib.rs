//! Embedder host for weh.
//!
//! This crate provides the engine-independent sandbox a guest module runs
//! against:
//!
//! - [`EmbedderHost`]: descriptor table, arguments, environment, clock,
//!   entropy, console and exit sink, with fail-fast `close`
//! - [`fs`]: sandboxed filesystem view (preopens or unrestricted access)
//! - [`clock`], [`entropy`], [`stdio`], [`console`]: replaceable services
//!
//! # Security Model
//!
//! 1. **Preopens**: the guest only reaches host directories it was given.
//! 2. **Lexical containment**: `..` escapes are refused before host I/O.
//! 3. **Symlink policy**: links are refused or followed only inside the root.

pub mod clock;
pub mod console;
pub mod entropy;
pub mod fs;
pub mod host;
pub mod stdio;

pub use clock::{Clock, ClockId, SystemClock};
pub use console::{ConsoleEntry, ConsoleLevel, GuestConsole};
pub use entropy::{EntropySource, OsEntropy, SeededEntropy};
pub use fs::{Access, DirEntry, FdStat, FileStat, FileSystem, OpenRequest};
pub use host::{EmbedderHost, EmbedderHostBuilder, ExitHandler};
pub use stdio::CapturedOutput;
