//! `path_*` syscalls.
//!
//! Resolution and the sandbox checks live in the embedder host; these
//! functions only decode guest arguments and encode results.

use weh_common::abi::layout;
use weh_host::{EmbedderHost, OpenRequest};

use super::{SyscallResult, encode_filestat, guest_size, read_str, small};
use crate::memory::MemoryView;
use crate::value::Args;

pub(super) fn path_create_directory(
    host: &mut EmbedderHost,
    memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    let path = read_str(memory, args.u32(1)?, args.u32(2)?)?;
    Ok(host.fs().create_directory(fd, &path)?)
}

pub(super) fn path_filestat_get(
    host: &mut EmbedderHost,
    memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    let flags = args.u32(1)?;
    let path = read_str(memory, args.u32(2)?, args.u32(3)?)?;
    let out = args.u32(4)?;
    memory.check(out, layout::FILESTAT_SIZE)?;

    let stat = host.fs().path_filestat(fd, flags, &path)?;
    memory.write_bytes(out, &encode_filestat(&stat))?;
    Ok(())
}

pub(super) fn path_filestat_set_times(
    host: &mut EmbedderHost,
    memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    let flags = args.u32(1)?;
    let path = read_str(memory, args.u32(2)?, args.u32(3)?)?;
    let atim = args.u64(4)?;
    let mtim = args.u64(5)?;
    let fst: u16 = small(args.i32(6)?)?;
    Ok(host.fs().path_set_times(fd, flags, &path, atim, mtim, fst)?)
}

pub(super) fn path_link(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let old_fd = args.u32(0)?;
    let old_flags = args.u32(1)?;
    let old_path = read_str(memory, args.u32(2)?, args.u32(3)?)?;
    let new_fd = args.u32(4)?;
    let new_path = read_str(memory, args.u32(5)?, args.u32(6)?)?;
    Ok(host.fs().link(old_fd, old_flags, &old_path, new_fd, &new_path)?)
}

/// Open a path below a directory descriptor.
///
/// The new descriptor is written only on success; `..` escapes and absolute
/// paths outside the preopen mount fail with `NOTCAPABLE` before host I/O.
pub(super) fn path_open(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let dirfd = args.u32(0)?;
    let dirflags = args.u32(1)?;
    let path = read_str(memory, args.u32(2)?, args.u32(3)?)?;
    let request = OpenRequest {
        dirflags,
        oflags: small(args.i32(4)?)?,
        rights_base: args.u64(5)?,
        rights_inheriting: args.u64(6)?,
        fdflags: small(args.i32(7)?)?,
    };
    let fd_out = args.u32(8)?;
    memory.check(fd_out, 4)?;

    let fd = host.fs_mut().open(dirfd, &path, &request)?;
    memory.write_u32(fd_out, fd)?;
    Ok(())
}

pub(super) fn path_readlink(
    host: &mut EmbedderHost,
    memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    let path = read_str(memory, args.u32(1)?, args.u32(2)?)?;
    let buf = args.u32(3)?;
    let buf_len = args.u32(4)?;
    let bufused = args.u32(5)?;
    memory.check(buf, buf_len)?;
    memory.check(bufused, 4)?;

    let mut target = host.fs().readlink(fd, &path)?;
    target.truncate(buf_len as usize);
    memory.write_bytes(buf, &target)?;
    memory.write_u32(bufused, guest_size(target.len()))?;
    Ok(())
}

pub(super) fn path_remove_directory(
    host: &mut EmbedderHost,
    memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    let path = read_str(memory, args.u32(1)?, args.u32(2)?)?;
    Ok(host.fs().remove_directory(fd, &path)?)
}

pub(super) fn path_rename(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let old_fd = args.u32(0)?;
    let old_path = read_str(memory, args.u32(1)?, args.u32(2)?)?;
    let new_fd = args.u32(3)?;
    let new_path = read_str(memory, args.u32(4)?, args.u32(5)?)?;
    Ok(host.fs().rename(old_fd, &old_path, new_fd, &new_path)?)
}

pub(super) fn path_symlink(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let target = read_str(memory, args.u32(0)?, args.u32(1)?)?;
    let fd = args.u32(2)?;
    let path = read_str(memory, args.u32(3)?, args.u32(4)?)?;
    Ok(host.fs().symlink(&target, fd, &path)?)
}

pub(super) fn path_unlink_file(
    host: &mut EmbedderHost,
    memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    let path = read_str(memory, args.u32(1)?, args.u32(2)?)?;
    Ok(host.fs().unlink_file(fd, &path)?)
}
