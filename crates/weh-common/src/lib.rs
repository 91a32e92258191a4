//! Common types, errors, and configuration for weh.
//!
//! This crate provides shared functionality used across the weh workspace:
//! - Error types using `thiserror`, including the [`Interrupt`] signal that
//!   host functions use to unwind a guest call
//! - WASI Preview 1 ABI constants and the [`Errno`] code set
//! - Configuration structures for the engine and the embedder host

pub mod abi;
pub mod config;
pub mod config_file;
pub mod error;

pub use abi::Errno;
pub use config::{
    EngineConfig, EngineKind, FilesystemConfig, HostConfig, PreopenEntry, RuntimeConfig,
    SymlinkPolicy,
};
pub use config_file::{ConfigFile, ConfigFileError, ModuleEntry};
pub use error::{GuestTrap, HostError, Interrupt, RuntimeError};
