//! Process control, randomness and the socket stubs.

use weh_common::abi::WASI_MODULE;
use weh_common::{Errno, Interrupt};
use weh_host::EmbedderHost;

use super::SyscallResult;
use crate::descriptor::HostFunctionDescriptor;
use crate::memory::MemoryView;
use crate::value::{Args, Signature, ValueType};

/// `proc_exit(code)`: record the exit code and unwind the guest.
///
/// There is no errno to return. The call always ends in
/// [`Interrupt::Exit`], which adapters turn into their engine's native exit.
pub(super) fn proc_exit_descriptor() -> HostFunctionDescriptor {
    let signature = Signature::new([ValueType::I32], []);

    HostFunctionDescriptor::new(WASI_MODULE, "proc_exit", signature, |env, raw| {
        let code = Args::new(raw).i32(0)?;
        let host = &mut env.context().host;
        host.ensure_open()?;
        host.record_exit(code);
        Err(Interrupt::Exit(code))
    })
}

pub(super) fn proc_raise(_host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, _args: Args<'_>) -> SyscallResult {
    Err(Errno::NotSup.into())
}

pub(super) fn random_get(host: &mut EmbedderHost, memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    let buf = args.u32(0)?;
    let len = args.u32(1)?;
    Ok(host.fill_random(memory.slice_mut(buf, len)?)?)
}

/// Sockets are not available: an open descriptor yields `NOTSUP`, an
/// unknown one `BADF`.
fn no_sockets(host: &EmbedderHost, fd: u32) -> SyscallResult {
    host.fs().table().get(fd)?;
    Err(Errno::NotSup.into())
}

pub(super) fn sock_accept(host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    no_sockets(host, args.u32(0)?)
}

pub(super) fn sock_recv(host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    no_sockets(host, args.u32(0)?)
}

pub(super) fn sock_send(host: &mut EmbedderHost, _memory: &mut MemoryView<'_>, args: Args<'_>) -> SyscallResult {
    no_sockets(host, args.u32(0)?)
}

pub(super) fn sock_shutdown(
    host: &mut EmbedderHost,
    _memory: &mut MemoryView<'_>,
    args: Args<'_>,
) -> SyscallResult {
    no_sockets(host, args.u32(0)?)
}
