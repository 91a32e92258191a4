//! Standard stream providers.
//!
//! The host owns boxed `Read`/`Write` trait objects for descriptors 0..=2.
//! [`CapturedOutput`] is a cloneable in-memory sink for embedders that want to
//! inspect what the guest printed.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// Cloneable in-memory output sink.
///
/// All clones share the same buffer, so one clone can be handed to the host
/// while another one is kept to read the output back.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    /// Create an empty capture buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    /// Everything written so far, decoded lossily as UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// Discard the captured bytes.
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
