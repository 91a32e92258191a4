//! `args_*` and `environ_*`.

use weh_host::EmbedderHost;

use super::{SyscallResult, guest_size};
use crate::memory::MemoryView;
use crate::value::Args;

pub(super) fn args_sizes_get(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    sizes_get(host.args(), memory, args)
}

pub(super) fn args_get(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    strings_get(host.args(), memory, args)
}

pub(super) fn environ_sizes_get(
    host: &mut EmbedderHost,
    memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    sizes_get(host.environ(), memory, args)
}

pub(super) fn environ_get(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    strings_get(host.environ(), memory, args)
}

/// Write the string count and the total size of the NUL-terminated strings.
fn sizes_get(strings: &[String], memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let count_ptr = args.u32(0)?;
    let size_ptr = args.u32(1)?;
    memory.check(count_ptr, 4)?;
    memory.check(size_ptr, 4)?;

    let total: usize = strings.iter().map(|s| s.len() + 1).sum();
    memory.write_u32(count_ptr, guest_size(strings.len()))?;
    memory.write_u32(size_ptr, guest_size(total))?;
    Ok(())
}

/// Write a pointer array and the NUL-terminated strings it points to.
fn strings_get(strings: &[String], memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let ptrs = args.u32(0)?;
    let buf = args.u32(1)?;

    let total: usize = strings.iter().map(|s| s.len() + 1).sum();
    memory.check_array(ptrs, guest_size(strings.len()), 4)?;
    memory.check(buf, guest_size(total))?;

    let mut offset = buf;
    for (index, value) in strings.iter().enumerate() {
        memory.write_u32(ptrs + guest_size(index) * 4, offset)?;
        memory.write_bytes(offset, value.as_bytes())?;
        memory.write_u8(offset + guest_size(value.len()), 0)?;
        offset += guest_size(value.len() + 1);
    }
    Ok(())
}
