//! `fd_*` syscalls.
//!
//! Unknown or closed descriptors yield `BADF` without side effects; the
//! descriptor is looked up only after all guest pointers have been checked.

use weh_common::Errno;
use weh_common::abi::{layout, preopentype};
use weh_host::EmbedderHost;

use super::{SyscallResult, encode_dirent, encode_fdstat, encode_filestat, guest_size, read_iovecs, small};
use crate::memory::MemoryView;
use crate::value::Args;

pub(super) fn fd_advise(host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let advice: u8 = small(args.i32(3)?)?;
    Ok(host.fs().advise(fd, advice)?)
}

pub(super) fn fd_allocate(host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let offset = args.u64(1)?;
    let len = args.u64(2)?;
    Ok(host.fs_mut().allocate(fd, offset, len)?)
}

pub(super) fn fd_close(host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    Ok(host.fs_mut().close(args.u32(0)?)?)
}

pub(super) fn fd_datasync(host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    Ok(host.fs_mut().sync(args.u32(0)?, true)?)
}

pub(super) fn fd_sync(host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    Ok(host.fs_mut().sync(args.u32(0)?, false)?)
}

pub(super) fn fd_fdstat_get(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let out = args.u32(1)?;
    memory.check(out, layout::FDSTAT_SIZE)?;

    let stat = host.fs().fdstat(fd)?;
    memory.write_bytes(out, &encode_fdstat(&stat))?;
    Ok(())
}

pub(super) fn fd_fdstat_set_flags(
    host: &mut EmbedderHost,
    _memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    let flags: u16 = small(args.i32(1)?)?;
    Ok(host.fs_mut().set_flags(fd, flags)?)
}

pub(super) fn fd_fdstat_set_rights(
    host: &mut EmbedderHost,
    _memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    Ok(host.fs_mut().set_rights(fd, args.u64(1)?, args.u64(2)?)?)
}

pub(super) fn fd_filestat_get(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let out = args.u32(1)?;
    memory.check(out, layout::FILESTAT_SIZE)?;

    let stat = host.fs().filestat(fd)?;
    memory.write_bytes(out, &encode_filestat(&stat))?;
    Ok(())
}

pub(super) fn fd_filestat_set_size(
    host: &mut EmbedderHost,
    _memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    Ok(host.fs_mut().set_size(fd, args.u64(1)?)?)
}

pub(super) fn fd_filestat_set_times(
    host: &mut EmbedderHost,
    _memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    let fst: u16 = small(args.i32(3)?)?;
    Ok(host.fs_mut().set_times(fd, args.u64(1)?, args.u64(2)?, fst)?)
}

pub(super) fn fd_prestat_get(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let out = args.u32(1)?;
    memory.check(out, layout::PRESTAT_SIZE)?;

    let name = host.fs().prestat_name(fd)?;
    let mut prestat = [0u8; layout::PRESTAT_SIZE as usize];
    prestat[0] = preopentype::DIR;
    prestat[4..8].copy_from_slice(&guest_size(name.len()).to_le_bytes());
    memory.write_bytes(out, &prestat)?;
    Ok(())
}

pub(super) fn fd_prestat_dir_name(
    host: &mut EmbedderHost,
    memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    let fd = args.u32(0)?;
    let buf = args.u32(1)?;
    let buf_len = args.u32(2)?;
    memory.check(buf, buf_len)?;

    let name = host.fs().prestat_name(fd)?;
    if name.len() > buf_len as usize {
        return Err(Errno::NameTooLong.into());
    }
    memory.write_bytes(buf, name.as_bytes())?;
    Ok(())
}

pub(super) fn fd_read(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let nread = args.u32(3)?;
    memory.check(nread, 4)?;
    let iovecs = read_iovecs(memory, args.u32(1)?, args.u32(2)?)?;

    let fs = host.fs_mut();
    fs.table().get(fd)?;

    let mut total = 0usize;
    for (buf, len) in iovecs {
        let n = fs.read(fd, memory.slice_mut(buf, len)?)?;
        total += n;
        if n < len as usize {
            break;
        }
    }
    memory.write_u32(nread, guest_size(total))?;
    Ok(())
}

pub(super) fn fd_pread(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let offset = args.u64(3)?;
    let nread = args.u32(4)?;
    memory.check(nread, 4)?;
    let iovecs = read_iovecs(memory, args.u32(1)?, args.u32(2)?)?;

    let fs = host.fs_mut();
    fs.table().get(fd)?;

    let mut total = 0usize;
    for (buf, len) in iovecs {
        let at = offset.checked_add(total as u64).ok_or(Errno::Overflow)?;
        let n = fs.pread(fd, memory.slice_mut(buf, len)?, at)?;
        total += n;
        if n < len as usize {
            break;
        }
    }
    memory.write_u32(nread, guest_size(total))?;
    Ok(())
}

pub(super) fn fd_write(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let nwritten = args.u32(3)?;
    memory.check(nwritten, 4)?;
    let iovecs = read_iovecs(memory, args.u32(1)?, args.u32(2)?)?;

    let fs = host.fs_mut();
    fs.table().get(fd)?;

    let mut total = 0usize;
    for (buf, len) in iovecs {
        let n = fs.write(fd, memory.slice(buf, len)?)?;
        total += n;
        if n < len as usize {
            break;
        }
    }
    memory.write_u32(nwritten, guest_size(total))?;
    Ok(())
}

pub(super) fn fd_pwrite(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let offset = args.u64(3)?;
    let nwritten = args.u32(4)?;
    memory.check(nwritten, 4)?;
    let iovecs = read_iovecs(memory, args.u32(1)?, args.u32(2)?)?;

    let fs = host.fs_mut();
    fs.table().get(fd)?;

    let mut total = 0usize;
    for (buf, len) in iovecs {
        let at = offset.checked_add(total as u64).ok_or(Errno::Overflow)?;
        let n = fs.pwrite(fd, memory.slice(buf, len)?, at)?;
        total += n;
        if n < len as usize {
            break;
        }
    }
    memory.write_u32(nwritten, guest_size(total))?;
    Ok(())
}

/// Pack dirents into the guest buffer starting at entry `cookie`.
///
/// The last entry is truncated so the buffer is filled exactly; a short
/// `bufused` tells the guest the listing is complete.
pub(super) fn fd_readdir(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let buf = args.u32(1)?;
    let buf_len = args.u32(2)?;
    let cookie = args.u64(3)?;
    let bufused = args.u32(4)?;
    memory.check(buf, buf_len)?;
    memory.check(bufused, 4)?;

    let entries = host.fs().readdir(fd)?;
    let capacity = buf_len as usize;
    let skip = usize::try_from(cookie).unwrap_or(usize::MAX);

    let mut packed = Vec::with_capacity(capacity);
    for (index, entry) in entries.iter().enumerate().skip(skip) {
        if packed.len() >= capacity {
            break;
        }
        packed.extend_from_slice(&encode_dirent(index as u64 + 1, entry));
        packed.extend_from_slice(entry.name.as_bytes());
    }
    packed.truncate(capacity);

    memory.write_bytes(buf, &packed)?;
    memory.write_u32(bufused, guest_size(packed.len()))?;
    Ok(())
}

pub(super) fn fd_renumber(host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let from = args.u32(0)?;
    let to = args.u32(1)?;
    Ok(host.fs_mut().table_mut().renumber(from, to)?)
}

pub(super) fn fd_seek(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let offset = args.i64(1)?;
    let whence: u8 = small(args.i32(2)?)?;
    let out = args.u32(3)?;
    memory.check(out, 8)?;

    let position = host.fs_mut().seek(fd, offset, whence)?;
    memory.write_u64(out, position)?;
    Ok(())
}

pub(super) fn fd_tell(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let fd = args.u32(0)?;
    let out = args.u32(1)?;
    memory.check(out, 8)?;

    let position = host.fs_mut().tell(fd)?;
    memory.write_u64(out, position)?;
    Ok(())
}
