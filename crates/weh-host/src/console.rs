//! Guest console capture.
//!
//! Messages the guest emits through console-style imports
//! (`emscripten_console_log`, `__assert_fail`, ...) are both:
//! 1. Stored in the [`GuestConsole`] for later retrieval
//! 2. Emitted via the `tracing` crate for observability
//!
//! Clones share one log, so an embedder can keep a handle after the host
//! has moved into an engine store.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info, warn};

/// Severity of a console message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    /// Plain `console.log` output.
    Log,
    /// Warnings.
    Warn,
    /// Errors and assertion failures.
    Error,
}

impl std::fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsoleLevel::Log => write!(f, "LOG"),
            ConsoleLevel::Warn => write!(f, "WARN"),
            ConsoleLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// A single console message from guest code.
#[derive(Debug, Clone)]
pub struct ConsoleEntry {
    /// Message severity.
    pub level: ConsoleLevel,

    /// Message content.
    pub message: String,

    /// When the message was recorded.
    pub timestamp: Instant,
}

/// Collected guest console output.
#[derive(Debug, Clone, Default)]
pub struct GuestConsole {
    entries: Arc<Mutex<Vec<ConsoleEntry>>>,
}

impl GuestConsole {
    /// Create an empty console.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message at the given level.
    pub fn log(&self, level: ConsoleLevel, message: &str) {
        self.entries.lock().push(ConsoleEntry {
            level,
            message: message.to_string(),
            timestamp: Instant::now(),
        });

        match level {
            ConsoleLevel::Log => info!(guest_console = true, "{}", message),
            ConsoleLevel::Warn => warn!(guest_console = true, "{}", message),
            ConsoleLevel::Error => error!(guest_console = true, "{}", message),
        }
    }

    /// A copy of the messages recorded so far, oldest first.
    pub fn entries(&self) -> Vec<ConsoleEntry> {
        self.entries.lock().clone()
    }
}
