//! Engine-independent WASI Preview 1 function table.
//!
//! Every syscall is a plain function of the embedder host, a view of guest
//! memory and the raw arguments:
//!
//! ```text
//! fn(&mut EmbedderHost, &mut MemoryView<'_>, Args<'_>) -> Result<(), SyscallError>
//! ```
//!
//! [`functions`] wraps each one into a [`HostFunctionDescriptor`] under the
//! `wasi_snapshot_preview1` namespace. The wrapper:
//! 1. Traps if the embedder host has been closed
//! 2. Maps `Ok` to errno 0 and [`SyscallError::Errno`] to its code
//! 3. Passes [`SyscallError::Interrupt`] (traps, `proc_exit`) through untouched
//!
//! Guest pointers are validated against the current memory size before any
//! host resource is touched; an out-of-range pointer is a trap.

mod args;
mod fd;
mod path;
mod poll;
mod proc;

use thiserror::Error;
use tracing::debug;
use weh_common::abi::{WASI_MODULE, layout};
use weh_common::{Errno, GuestTrap, Interrupt};
use weh_host::{DirEntry, EmbedderHost, FdStat, FileStat};

use crate::descriptor::HostFunctionDescriptor;
use crate::memory::MemoryView;
use crate::value::{Args, Signature, ValueType, WasmValue};

/// Why a syscall did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyscallError {
    /// Guest-visible failure, returned as the syscall's errno.
    #[error("errno {0}")]
    Errno(Errno),

    /// Trap or exit that unwinds the guest call.
    #[error(transparent)]
    Interrupt(Interrupt),
}

impl From<Errno> for SyscallError {
    fn from(errno: Errno) -> Self {
        Self::Errno(errno)
    }
}

impl From<GuestTrap> for SyscallError {
    fn from(trap: GuestTrap) -> Self {
        Self::Interrupt(Interrupt::Trap(trap))
    }
}

impl From<Interrupt> for SyscallError {
    fn from(interrupt: Interrupt) -> Self {
        Self::Interrupt(interrupt)
    }
}

impl From<std::io::Error> for SyscallError {
    fn from(err: std::io::Error) -> Self {
        Self::Errno(Errno::from(err))
    }
}

/// Outcome of one syscall.
pub type SyscallResult = Result<(), SyscallError>;

/// Signature shared by every table entry.
pub type Syscall = fn(&mut EmbedderHost, &mut MemoryView<'_>, Args<'_>) -> SyscallResult;

const I32: ValueType = ValueType::I32;
const I64: ValueType = ValueType::I64;

/// The complete `wasi_snapshot_preview1` table.
pub fn functions() -> Vec<HostFunctionDescriptor> {
    let table: &[(&'static str, &[ValueType], Syscall)] = &[
        ("args_get", &[I32, I32], args::args_get),
        ("args_sizes_get", &[I32, I32], args::args_sizes_get),
        ("environ_get", &[I32, I32], args::environ_get),
        ("environ_sizes_get", &[I32, I32], args::environ_sizes_get),
        ("clock_res_get", &[I32, I32], poll::clock_res_get),
        ("clock_time_get", &[I32, I64, I32], poll::clock_time_get),
        ("fd_advise", &[I32, I64, I64, I32], fd::fd_advise),
        ("fd_allocate", &[I32, I64, I64], fd::fd_allocate),
        ("fd_close", &[I32], fd::fd_close),
        ("fd_datasync", &[I32], fd::fd_datasync),
        ("fd_fdstat_get", &[I32, I32], fd::fd_fdstat_get),
        ("fd_fdstat_set_flags", &[I32, I32], fd::fd_fdstat_set_flags),
        ("fd_fdstat_set_rights", &[I32, I64, I64], fd::fd_fdstat_set_rights),
        ("fd_filestat_get", &[I32, I32], fd::fd_filestat_get),
        ("fd_filestat_set_size", &[I32, I64], fd::fd_filestat_set_size),
        ("fd_filestat_set_times", &[I32, I64, I64, I32], fd::fd_filestat_set_times),
        ("fd_pread", &[I32, I32, I32, I64, I32], fd::fd_pread),
        ("fd_prestat_get", &[I32, I32], fd::fd_prestat_get),
        ("fd_prestat_dir_name", &[I32, I32, I32], fd::fd_prestat_dir_name),
        ("fd_pwrite", &[I32, I32, I32, I64, I32], fd::fd_pwrite),
        ("fd_read", &[I32, I32, I32, I32], fd::fd_read),
        ("fd_readdir", &[I32, I32, I32, I64, I32], fd::fd_readdir),
        ("fd_renumber", &[I32, I32], fd::fd_renumber),
        ("fd_seek", &[I32, I64, I32, I32], fd::fd_seek),
        ("fd_sync", &[I32], fd::fd_sync),
        ("fd_tell", &[I32, I32], fd::fd_tell),
        ("fd_write", &[I32, I32, I32, I32], fd::fd_write),
        ("path_create_directory", &[I32, I32, I32], path::path_create_directory),
        ("path_filestat_get", &[I32, I32, I32, I32, I32], path::path_filestat_get),
        (
            "path_filestat_set_times",
            &[I32, I32, I32, I32, I64, I64, I32],
            path::path_filestat_set_times,
        ),
        ("path_link", &[I32, I32, I32, I32, I32, I32, I32], path::path_link),
        (
            "path_open",
            &[I32, I32, I32, I32, I32, I64, I64, I32, I32],
            path::path_open,
        ),
        ("path_readlink", &[I32, I32, I32, I32, I32, I32], path::path_readlink),
        ("path_remove_directory", &[I32, I32, I32], path::path_remove_directory),
        ("path_rename", &[I32, I32, I32, I32, I32, I32], path::path_rename),
        ("path_symlink", &[I32, I32, I32, I32, I32], path::path_symlink),
        ("path_unlink_file", &[I32, I32, I32], path::path_unlink_file),
        ("poll_oneoff", &[I32, I32, I32, I32], poll::poll_oneoff),
        ("proc_raise", &[I32], proc::proc_raise),
        ("sched_yield", &[], poll::sched_yield),
        ("random_get", &[I32, I32], proc::random_get),
        ("sock_accept", &[I32, I32, I32], proc::sock_accept),
        ("sock_recv", &[I32, I32, I32, I32, I32, I32], proc::sock_recv),
        ("sock_send", &[I32, I32, I32, I32, I32], proc::sock_send),
        ("sock_shutdown", &[I32, I32], proc::sock_shutdown),
    ];

    let mut functions: Vec<_> = table
        .iter()
        .map(|(name, params, syscall)| descriptor(name, params, *syscall))
        .collect();
    functions.push(proc::proc_exit_descriptor());
    functions
}

fn descriptor(name: &'static str, params: &[ValueType], syscall: Syscall) -> HostFunctionDescriptor {
    let signature = Signature::new(params.to_vec(), [ValueType::I32]);

    HostFunctionDescriptor::new(WASI_MODULE, name, signature, move |env, raw| {
        env.context().host.ensure_open()?;
        let (ctx, mut memory) = env.memory()?;

        let errno = match syscall(&mut ctx.host, &mut memory, Args::new(raw)) {
            Ok(()) => Errno::Success,
            Err(SyscallError::Errno(errno)) => {
                debug!(syscall = name, errno = %errno, "Syscall failed");
                errno
            }
            Err(SyscallError::Interrupt(interrupt)) => return Err(interrupt),
        };
        Ok(Some(WasmValue::I32(errno.raw())))
    })
}

/// Read a guest string (explicit length, no terminator); invalid UTF-8 is `ILSEQ`.
fn read_str(memory: &MemoryView<'_>, ptr: u32, len: u32) -> Result<String, SyscallError> {
    let bytes = memory.slice(ptr, len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| SyscallError::Errno(Errno::Ilseq))
}

/// Read and bounds-check an iovec array, returning `(buf, len)` pairs.
fn read_iovecs(memory: &MemoryView<'_>, ptr: u32, count: u32) -> Result<Vec<(u32, u32)>, GuestTrap> {
    memory.check_array(ptr, count, layout::IOVEC_SIZE)?;

    let mut iovecs = Vec::with_capacity(count as usize);
    for index in 0..count {
        let base = ptr + index * layout::IOVEC_SIZE;
        let buf = memory.read_u32(base)?;
        let len = memory.read_u32(base + 4)?;
        memory.check(buf, len)?;
        iovecs.push((buf, len));
    }
    Ok(iovecs)
}

/// Narrow a flag or enum argument; out-of-range values are `INVAL`.
fn small<T: TryFrom<i32>>(value: i32) -> Result<T, Errno> {
    T::try_from(value).map_err(|_| Errno::Inval)
}

/// Saturating conversion of a host byte count to the guest's `size`.
fn guest_size(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn encode_fdstat(stat: &FdStat) -> [u8; layout::FDSTAT_SIZE as usize] {
    let mut out = [0u8; layout::FDSTAT_SIZE as usize];
    out[0] = stat.filetype;
    out[2..4].copy_from_slice(&stat.flags.to_le_bytes());
    out[8..16].copy_from_slice(&stat.rights_base.to_le_bytes());
    out[16..24].copy_from_slice(&stat.rights_inheriting.to_le_bytes());
    out
}

fn encode_filestat(stat: &FileStat) -> [u8; layout::FILESTAT_SIZE as usize] {
    let mut out = [0u8; layout::FILESTAT_SIZE as usize];
    out[0..8].copy_from_slice(&stat.dev.to_le_bytes());
    out[8..16].copy_from_slice(&stat.ino.to_le_bytes());
    out[16] = stat.filetype;
    out[24..32].copy_from_slice(&stat.nlink.to_le_bytes());
    out[32..40].copy_from_slice(&stat.size.to_le_bytes());
    out[40..48].copy_from_slice(&stat.atim.to_le_bytes());
    out[48..56].copy_from_slice(&stat.mtim.to_le_bytes());
    out[56..64].copy_from_slice(&stat.ctim.to_le_bytes());
    out
}

fn encode_dirent(next: u64, entry: &DirEntry) -> [u8; layout::DIRENT_SIZE as usize] {
    let mut out = [0u8; layout::DIRENT_SIZE as usize];
    out[0..8].copy_from_slice(&next.to_le_bytes());
    out[8..16].copy_from_slice(&entry.ino.to_le_bytes());
    out[16..20].copy_from_slice(&guest_size(entry.name.len()).to_le_bytes());
    out[20] = entry.filetype;
    out
}
