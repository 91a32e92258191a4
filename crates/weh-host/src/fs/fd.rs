//! Guest file descriptor table.
//!
//! Descriptors 0, 1 and 2 are the standard streams, preopened directories
//! follow from 3, and new descriptors take the lowest free number.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;
use weh_common::Errno;
use weh_common::abi::filetype;

/// Upper bound on simultaneously open guest descriptors.
pub const MAX_FDS: u32 = 1024;

/// The directory tree a descriptor was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRoot {
    /// Host directory backing the preopen.
    pub host_root: PathBuf,
    /// Canonical form of `host_root`, used for symlink containment checks.
    pub canonical_root: PathBuf,
    /// Name the guest sees for the preopen.
    pub mount: String,
}

/// An open directory.
#[derive(Debug, Clone)]
pub struct OpenDir {
    /// Sandbox this directory belongs to.
    pub root: Arc<SandboxRoot>,
    /// Path of this directory below the sandbox root.
    pub components: Vec<String>,
    /// Host path of this directory.
    pub host_path: PathBuf,
    /// `true` for the directories handed to the guest at start-up.
    pub preopen: bool,
}

/// An open regular file.
#[derive(Debug)]
pub struct OpenFile {
    /// The host file handle.
    pub file: File,
    /// Host path the file was opened from.
    pub host_path: PathBuf,
}

/// What a guest descriptor refers to.
pub enum FdKind {
    /// A readable stream (standard input).
    Source(Box<dyn Read + Send>),
    /// A writable stream (standard output or error).
    Sink(Box<dyn Write + Send>),
    /// A regular file.
    File(OpenFile),
    /// A directory.
    Dir(OpenDir),
}

impl FdKind {
    /// WASI filetype of the resource.
    pub fn filetype(&self) -> u8 {
        match self {
            FdKind::Source(_) | FdKind::Sink(_) => filetype::CHARACTER_DEVICE,
            FdKind::File(_) => filetype::REGULAR_FILE,
            FdKind::Dir(_) => filetype::DIRECTORY,
        }
    }
}

impl std::fmt::Debug for FdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FdKind::Source(_) => f.write_str("Source"),
            FdKind::Sink(_) => f.write_str("Sink"),
            FdKind::File(file) => f.debug_tuple("File").field(&file.host_path).finish(),
            FdKind::Dir(dir) => f.debug_tuple("Dir").field(&dir.host_path).finish(),
        }
    }
}

/// One slot of the descriptor table.
#[derive(Debug)]
pub struct FdEntry {
    /// The underlying resource.
    pub kind: FdKind,
    /// Rights that apply to the descriptor itself.
    pub rights_base: u64,
    /// Rights granted to descriptors opened through this one.
    pub rights_inheriting: u64,
    /// `fdflags` currently set.
    pub flags: u16,
}

impl FdEntry {
    /// Create a new entry.
    pub fn new(kind: FdKind, rights_base: u64, rights_inheriting: u64) -> Self {
        Self {
            kind,
            rights_base,
            rights_inheriting,
            flags: 0,
        }
    }

    /// Fail with `NOTCAPABLE` unless every right in `required` is held.
    pub fn require(&self, required: u64) -> Result<(), Errno> {
        if self.rights_base & required == required {
            Ok(())
        } else {
            Err(Errno::NotCapable)
        }
    }

    /// The directory behind this descriptor, or `NOTDIR`.
    pub fn as_dir(&self) -> Result<&OpenDir, Errno> {
        match &self.kind {
            FdKind::Dir(dir) => Ok(dir),
            _ => Err(Errno::NotDir),
        }
    }
}

/// Descriptor table keyed by guest fd number.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: BTreeMap<u32, FdEntry>,
}

impl FdTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the lowest free descriptor number.
    pub fn insert(&mut self, entry: FdEntry) -> Result<u32, Errno> {
        let fd = self.lowest_free().ok_or(Errno::Mfile)?;
        self.entries.insert(fd, entry);
        Ok(fd)
    }

    /// Insert at a specific descriptor number, replacing any previous entry.
    pub fn insert_at(&mut self, fd: u32, entry: FdEntry) -> Option<FdEntry> {
        self.entries.insert(fd, entry)
    }

    /// Look up an open descriptor.
    pub fn get(&self, fd: u32) -> Result<&FdEntry, Errno> {
        self.entries.get(&fd).ok_or(Errno::Badf)
    }

    /// Look up an open descriptor mutably.
    pub fn get_mut(&mut self, fd: u32) -> Result<&mut FdEntry, Errno> {
        self.entries.get_mut(&fd).ok_or(Errno::Badf)
    }

    /// Remove a descriptor, releasing its resource exactly once.
    pub fn remove(&mut self, fd: u32) -> Result<FdEntry, Errno> {
        self.entries.remove(&fd).ok_or(Errno::Badf)
    }

    /// Move `from` onto `to`, closing whatever `to` referred to.
    pub fn renumber(&mut self, from: u32, to: u32) -> Result<(), Errno> {
        if !self.entries.contains_key(&from) || !self.entries.contains_key(&to) {
            return Err(Errno::Badf);
        }
        if from == to {
            return Ok(());
        }
        let entry = self.remove(from)?;
        self.entries.insert(to, entry);
        Ok(())
    }

    /// Returns `true` if `fd` is open.
    pub fn contains(&self, fd: u32) -> bool {
        self.entries.contains_key(&fd)
    }

    /// Iterate over open descriptors in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &FdEntry)> {
        self.entries.iter().map(|(fd, entry)| (*fd, entry))
    }

    /// Number of open descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no descriptor is open.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every descriptor, flushing output streams first.
    pub fn clear(&mut self) {
        for (fd, entry) in &mut self.entries {
            if let FdKind::Sink(sink) = &mut entry.kind {
                if let Err(e) = sink.flush() {
                    warn!(fd = *fd, error = %e, "Failed to flush output stream on close");
                }
            }
        }
        self.entries.clear();
    }

    fn lowest_free(&self) -> Option<u32> {
        let mut candidate = 0;
        for fd in self.entries.keys() {
            if *fd != candidate {
                break;
            }
            candidate += 1;
        }
        (candidate < MAX_FDS).then_some(candidate)
    }
}
