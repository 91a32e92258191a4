//! `__syscall_*` and file-mapping imports of the Emscripten runtime.
//!
//! Each import returns a non-negative result or a negated errno, like the
//! JavaScript glue; memory faults still trap. Paths go through the same
//! sandbox as the WASI `path_*` calls. An absolute path, or any path given
//! with [`AT_FDCWD`], is resolved from the working directory and handed to
//! the preopen whose mount holds it.

use tracing::{debug, warn};
use weh_common::Errno;
use weh_common::abi::{EMSCRIPTEN_MODULE, fdflags, filetype, fstflags, lookupflags, oflags, rights};
use weh_host::fs::path::{self, Normalized};
use weh_host::{Access, EmbedderHost, FileStat, OpenRequest};

use crate::context::GuestEnv;
use crate::descriptor::HostFunctionDescriptor;
use crate::memory::MemoryView;
use crate::value::{Args, Signature, ValueType, WasmValue};
use crate::wasi::SyscallError;

/// `dirfd` naming the current working directory.
pub const AT_FDCWD: i32 = -100;
const AT_SYMLINK_NOFOLLOW: i32 = 0x100;
const AT_REMOVEDIR: i32 = 0x200;
const AT_EACCESS: i32 = 0x200;
const AT_EMPTY_PATH: i32 = 0x1000;

const O_ACCMODE: i32 = 0o3;
const O_WRONLY: i32 = 0o1;
const O_RDWR: i32 = 0o2;
const O_CREAT: i32 = 0o100;
const O_EXCL: i32 = 0o200;
const O_TRUNC: i32 = 0o1000;
const O_APPEND: i32 = 0o2000;
const O_NONBLOCK: i32 = 0o4000;
const O_DSYNC: i32 = 0o10000;
const O_SYNC: i32 = 0o4_010_000;
const O_DIRECTORY: i32 = 0o200_000;
const O_NOFOLLOW: i32 = 0o400_000;

const R_OK: i32 = 4;
const W_OK: i32 = 2;
const X_OK: i32 = 1;

const F_GETFD: i32 = 1;
const F_SETFD: i32 = 2;
const F_GETFL: i32 = 3;
const F_SETFL: i32 = 4;
const F_GETLK: i32 = 5;
const F_SETLK: i32 = 6;
const F_SETLKW: i32 = 7;
const F_GETLK64: i32 = 12;
const F_SETLK64: i32 = 13;
const F_SETLKW64: i32 = 14;
const F_UNLCK: u16 = 2;
const FLOCK_SIZE: u32 = 32;

const UTIME_NOW: u32 = 0x3fff_ffff;
const UTIME_OMIT: u32 = 0x3fff_fffe;
const TIMESPEC_SIZE: u32 = 16;

const PROT_WRITE: i32 = 2;
const MAP_SHARED: i32 = 1;
const MAP_PRIVATE: i32 = 2;
const MMAP_ALIGN: i32 = 65_536;
const MEMALIGN: &str = "emscripten_builtin_memalign";

const S_IFCHR: u32 = 0o020_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFBLK: u32 = 0o060_000;
const S_IFREG: u32 = 0o100_000;
const S_IFLNK: u32 = 0o120_000;
const S_IFSOCK: u32 = 0o140_000;

/// Size of `struct stat` on wasm32.
pub const STAT_SIZE: u32 = 96;
const STAT_BLOCK_SIZE: u32 = 4096;
const NANOS_PER_SEC: u64 = 1_000_000_000;

const I32: ValueType = ValueType::I32;
const I64: ValueType = ValueType::I64;

type SyscallFn = fn(&mut dyn GuestEnv, Args<'_>) -> Result<i32, SyscallError>;

/// Every `__syscall_*` import plus `_mmap_js` / `_munmap_js`.
pub(super) fn functions() -> Vec<HostFunctionDescriptor> {
    let table: &[(&'static str, &[ValueType], SyscallFn)] = &[
        ("__syscall_getcwd", &[I32, I32], getcwd),
        ("__syscall_openat", &[I32, I32, I32, I32], openat),
        ("__syscall_fstat64", &[I32, I32], fstat64),
        ("__syscall_stat64", &[I32, I32], stat64),
        ("__syscall_lstat64", &[I32, I32], lstat64),
        ("__syscall_newfstatat", &[I32, I32, I32, I32], newfstatat),
        ("__syscall_fcntl64", &[I32, I32, I32], fcntl64),
        ("__syscall_ioctl", &[I32, I32, I32], ioctl),
        ("__syscall_mkdirat", &[I32, I32, I32], mkdirat),
        ("__syscall_rmdir", &[I32], rmdir),
        ("__syscall_unlinkat", &[I32, I32, I32], unlinkat),
        ("__syscall_readlinkat", &[I32, I32, I32, I32], readlinkat),
        ("__syscall_faccessat", &[I32, I32, I32, I32], faccessat),
        ("__syscall_chmod", &[I32, I32], chmod),
        ("__syscall_fchmod", &[I32, I32], fchmod),
        ("__syscall_fchown32", &[I32, I32, I32], fchown32),
        ("__syscall_ftruncate64", &[I32, I64], ftruncate64),
        ("__syscall_fdatasync", &[I32], fdatasync),
        ("__syscall_utimensat", &[I32, I32, I32, I32], utimensat),
        ("_mmap_js", &[I32, I32, I32, I32, I64, I32, I32], mmap_js),
        ("_munmap_js", &[I32, I32, I32, I32, I32, I64], munmap_js),
    ];

    table
        .iter()
        .map(|(name, params, syscall)| descriptor(name, params, *syscall))
        .collect()
}

fn descriptor(name: &'static str, params: &[ValueType], syscall: SyscallFn) -> HostFunctionDescriptor {
    let signature = Signature::new(params.to_vec(), [I32]);

    HostFunctionDescriptor::new(EMSCRIPTEN_MODULE, name, signature, move |env, raw| {
        env.context().host.ensure_open()?;
        let rc = match syscall(env, Args::new(raw)) {
            Ok(value) => value,
            Err(SyscallError::Errno(errno)) => {
                debug!(syscall = name, errno = %errno, "Syscall failed");
                -errno.raw()
            }
            Err(SyscallError::Interrupt(interrupt)) => return Err(interrupt),
        };
        Ok(Some(WasmValue::I32(rc)))
    })
}

/// Descriptor and path a `*at` call resolves against.
fn locate(host: &EmbedderHost, dirfd: i32, guest_path: &str) -> Result<(u32, String), Errno> {
    path::validate(guest_path)?;
    if dirfd != AT_FDCWD && !guest_path.starts_with('/') {
        return Ok((descriptor_arg(dirfd)?, guest_path.to_string()));
    }

    let joined = if guest_path.starts_with('/') {
        guest_path.to_string()
    } else {
        format!("{}/{guest_path}", host.current_working_directory())
    };
    let absolute = match path::normalize(&[], &joined, true) {
        Normalized::Inside(components) => format!("/{}", components.join("/")),
        Normalized::Escapes => return Err(Errno::NotCapable),
    };

    match host.fs().preopen_for(&absolute) {
        Some(fd) => Ok((fd, absolute)),
        None => {
            warn!(path = guest_path, resolved = %absolute, "Path outside of every preopen");
            Err(Errno::NotCapable)
        }
    }
}

fn descriptor_arg(value: i32) -> Result<u32, Errno> {
    u32::try_from(value).map_err(|_| Errno::Badf)
}

fn guest_fd(fd: u32) -> Result<i32, Errno> {
    i32::try_from(fd).map_err(|_| Errno::Mfile)
}

fn read_path(memory: &MemoryView<'_>, ptr: u32) -> Result<String, SyscallError> {
    if ptr == 0 {
        return Err(Errno::Fault.into());
    }
    Ok(memory.read_c_string(ptr)?)
}

fn lookup(follow: bool) -> u32 {
    if follow { lookupflags::SYMLINK_FOLLOW } else { 0 }
}

/// Copy the working directory into `buf`; returns its size including the
/// terminator.
fn getcwd(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let buf = args.u32(0)?;
    let size = args.u32(1)?;
    let (ctx, mut memory) = env.memory()?;

    if size == 0 {
        return Err(Errno::Inval.into());
    }
    let mut cwd = ctx.host.current_working_directory().as_bytes().to_vec();
    cwd.push(0);
    if cwd.len() > size as usize {
        return Err(Errno::Range.into());
    }
    memory.write_bytes(buf, &cwd)?;
    Ok(i32::try_from(cwd.len()).unwrap_or(i32::MAX))
}

fn open_request(flags: i32) -> Result<OpenRequest, Errno> {
    let rights_base = match flags & O_ACCMODE {
        0 => rights::ALL & !(rights::FD_WRITE | rights::FD_ALLOCATE | rights::FD_FILESTAT_SET_SIZE),
        O_WRONLY => rights::ALL & !(rights::FD_READ | rights::FD_READDIR),
        O_RDWR => rights::ALL,
        _ => return Err(Errno::Inval),
    };

    let mut request = OpenRequest {
        dirflags: lookup(flags & O_NOFOLLOW == 0),
        rights_base,
        rights_inheriting: rights::ALL,
        ..OpenRequest::default()
    };
    for (bit, oflag) in [
        (O_CREAT, oflags::CREAT),
        (O_EXCL, oflags::EXCL),
        (O_TRUNC, oflags::TRUNC),
        (O_DIRECTORY, oflags::DIRECTORY),
    ] {
        if flags & bit != 0 {
            request.oflags |= oflag;
        }
    }
    request.fdflags = descriptor_flags(flags);
    if flags & O_SYNC == O_SYNC {
        request.fdflags |= fdflags::SYNC;
    }
    Ok(request)
}

fn descriptor_flags(flags: i32) -> u16 {
    let mut out = 0;
    for (bit, fdflag) in [
        (O_APPEND, fdflags::APPEND),
        (O_NONBLOCK, fdflags::NONBLOCK),
        (O_DSYNC, fdflags::DSYNC),
    ] {
        if flags & bit != 0 {
            out |= fdflag;
        }
    }
    out
}

fn openat(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let dirfd = args.i32(0)?;
    let path_ptr = args.u32(1)?;
    let flags = args.i32(2)?;
    let varargs = args.u32(3)?;
    let (ctx, memory) = env.memory()?;

    let guest_path = read_path(&memory, path_ptr)?;
    let mode = if flags & O_CREAT != 0 && varargs != 0 {
        Some(memory.read_u32(varargs)?)
    } else {
        None
    };
    let request = open_request(flags)?;
    let (base, guest_path) = locate(&ctx.host, dirfd, &guest_path)?;

    let fs = ctx.host.fs_mut();
    let existed = fs
        .resolve_at(base, &guest_path, false)
        .is_ok_and(|r| r.host_path.symlink_metadata().is_ok());
    let fd = fs.open(base, &guest_path, &request)?;

    // The host umask applied on creation; the guest mode can only narrow it.
    if let Some(mode) = mode.filter(|_| !existed) {
        let narrowed = fs
            .filestat(fd)
            .and_then(|stat| fs.set_fd_permissions(fd, stat.mode & mode));
        if let Err(errno) = narrowed {
            warn!(fd, mode, error = %errno, "Failed to apply creation mode");
        }
    }
    Ok(guest_fd(fd)?)
}

fn stat_path(host: &EmbedderHost, dirfd: i32, guest_path: &str, follow: bool) -> Result<FileStat, Errno> {
    let (base, guest_path) = locate(host, dirfd, guest_path)?;
    host.fs().path_filestat(base, lookup(follow), &guest_path)
}

fn stat64(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let (ctx, mut memory) = env.memory()?;
    let guest_path = read_path(&memory, args.u32(0)?)?;
    let stat = stat_path(&ctx.host, AT_FDCWD, &guest_path, true)?;
    memory.write_bytes(args.u32(1)?, &encode_stat(&stat))?;
    Ok(0)
}

fn lstat64(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let (ctx, mut memory) = env.memory()?;
    let guest_path = read_path(&memory, args.u32(0)?)?;
    let stat = stat_path(&ctx.host, AT_FDCWD, &guest_path, false)?;
    memory.write_bytes(args.u32(1)?, &encode_stat(&stat))?;
    Ok(0)
}

fn fstat64(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let fd = descriptor_arg(args.i32(0)?)?;
    let (ctx, mut memory) = env.memory()?;
    let stat = ctx.host.fs().filestat(fd)?;
    memory.write_bytes(args.u32(1)?, &encode_stat(&stat))?;
    Ok(0)
}

fn newfstatat(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let dirfd = args.i32(0)?;
    let path_ptr = args.u32(1)?;
    let buf = args.u32(2)?;
    let flags = args.i32(3)?;
    if flags & !(AT_SYMLINK_NOFOLLOW | AT_EMPTY_PATH) != 0 {
        return Err(Errno::Inval.into());
    }
    let (ctx, mut memory) = env.memory()?;
    let guest_path = read_path(&memory, path_ptr)?;

    let empty = guest_path.is_empty() && flags & AT_EMPTY_PATH != 0;
    let stat = if empty && dirfd != AT_FDCWD {
        ctx.host.fs().filestat(descriptor_arg(dirfd)?)?
    } else {
        let guest_path = if empty { "." } else { guest_path.as_str() };
        stat_path(&ctx.host, dirfd, guest_path, flags & AT_SYMLINK_NOFOLLOW == 0)?
    };
    memory.write_bytes(buf, &encode_stat(&stat))?;
    Ok(0)
}

fn fcntl64(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let fd = descriptor_arg(args.i32(0)?)?;
    let cmd = args.i32(1)?;
    let varargs = args.u32(2)?;
    let (ctx, mut memory) = env.memory()?;
    let fs = ctx.host.fs_mut();
    let stat = fs.fdstat(fd)?;

    match cmd {
        F_GETFD | F_SETFD => Ok(0),
        F_GETFL => Ok(status_flags(stat.rights_base, stat.flags)),
        F_SETFL => {
            let requested = descriptor_flags(i32::from_le_bytes(memory.read_u32(varargs)?.to_le_bytes()));
            let changeable = fdflags::APPEND | fdflags::NONBLOCK;
            fs.set_flags(fd, (stat.flags & !changeable) | (requested & changeable))?;
            Ok(0)
        }
        // Single process: every lock is granted and nothing ever holds one.
        F_GETLK | F_GETLK64 => {
            let lock = memory.read_u32(varargs)?;
            memory.check(lock, FLOCK_SIZE)?;
            memory.write_u16(lock, F_UNLCK)?;
            Ok(0)
        }
        F_SETLK | F_SETLKW | F_SETLK64 | F_SETLKW64 => {
            let lock = memory.read_u32(varargs)?;
            memory.check(lock, FLOCK_SIZE)?;
            Ok(0)
        }
        _ => {
            debug!(fd, cmd, "Unsupported fcntl command");
            Err(Errno::Inval.into())
        }
    }
}

fn status_flags(rights_base: u64, flags: u16) -> i32 {
    let readable = rights_base & rights::FD_READ != 0;
    let writable = rights_base & rights::FD_WRITE != 0;
    let mut out = match (readable, writable) {
        (true, true) => O_RDWR,
        (false, true) => O_WRONLY,
        _ => 0,
    };
    for (fdflag, bit) in [
        (fdflags::APPEND, O_APPEND),
        (fdflags::NONBLOCK, O_NONBLOCK),
        (fdflags::DSYNC, O_DSYNC),
    ] {
        if flags & fdflag != 0 {
            out |= bit;
        }
    }
    if flags & fdflags::SYNC != 0 {
        out |= O_SYNC;
    }
    out
}

/// No descriptor is a terminal.
fn ioctl(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let fd = descriptor_arg(args.i32(0)?)?;
    env.context().host.fs().fdstat(fd)?;
    Err(Errno::NotTy.into())
}

fn mkdirat(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let dirfd = args.i32(0)?;
    let mode = args.u32(2)?;
    let (ctx, memory) = env.memory()?;
    let guest_path = read_path(&memory, args.u32(1)?)?;
    let (base, guest_path) = locate(&ctx.host, dirfd, &guest_path)?;

    let fs = ctx.host.fs();
    fs.create_directory(base, &guest_path)?;
    let current = fs.path_filestat(base, 0, &guest_path)?.mode;
    if current & mode != current {
        fs.set_permissions(base, &guest_path, current & mode)?;
    }
    Ok(0)
}

fn rmdir(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let (ctx, memory) = env.memory()?;
    let guest_path = read_path(&memory, args.u32(0)?)?;
    let (base, guest_path) = locate(&ctx.host, AT_FDCWD, &guest_path)?;
    ctx.host.fs().remove_directory(base, &guest_path)?;
    Ok(0)
}

fn unlinkat(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let dirfd = args.i32(0)?;
    let flags = args.i32(2)?;
    if flags & !AT_REMOVEDIR != 0 {
        return Err(Errno::Inval.into());
    }
    let (ctx, memory) = env.memory()?;
    let guest_path = read_path(&memory, args.u32(1)?)?;
    let (base, guest_path) = locate(&ctx.host, dirfd, &guest_path)?;

    if flags & AT_REMOVEDIR != 0 {
        ctx.host.fs().remove_directory(base, &guest_path)?;
    } else {
        ctx.host.fs().unlink_file(base, &guest_path)?;
    }
    Ok(0)
}

/// Copy a link target into `buf`, truncated and without a terminator.
fn readlinkat(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let dirfd = args.i32(0)?;
    let buf = args.u32(2)?;
    let size = usize::try_from(args.i32(3)?).map_err(|_| Errno::Inval)?;
    if size == 0 {
        return Err(Errno::Inval.into());
    }
    let (ctx, mut memory) = env.memory()?;
    let guest_path = read_path(&memory, args.u32(1)?)?;
    let (base, guest_path) = locate(&ctx.host, dirfd, &guest_path)?;

    let target = ctx.host.fs().readlink(base, &guest_path)?;
    let len = target.len().min(size);
    memory.write_bytes(buf, &target[..len])?;
    Ok(i32::try_from(len).unwrap_or(i32::MAX))
}

fn faccessat(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let dirfd = args.i32(0)?;
    let amode = args.i32(2)?;
    let flags = args.i32(3)?;
    if amode & !(R_OK | W_OK | X_OK) != 0 || flags & !(AT_SYMLINK_NOFOLLOW | AT_EACCESS) != 0 {
        return Err(Errno::Inval.into());
    }
    let (ctx, memory) = env.memory()?;
    let guest_path = read_path(&memory, args.u32(1)?)?;
    let (base, guest_path) = locate(&ctx.host, dirfd, &guest_path)?;

    let access = Access {
        read: amode & R_OK != 0,
        write: amode & W_OK != 0,
        execute: amode & X_OK != 0,
    };
    let follow = flags & AT_SYMLINK_NOFOLLOW == 0;
    ctx.host.fs().check_access(base, lookup(follow), &guest_path, access)?;
    Ok(0)
}

fn chmod(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let mode = args.u32(1)?;
    let (ctx, memory) = env.memory()?;
    let guest_path = read_path(&memory, args.u32(0)?)?;
    let (base, guest_path) = locate(&ctx.host, AT_FDCWD, &guest_path)?;
    ctx.host.fs().set_permissions(base, &guest_path, mode)?;
    Ok(0)
}

fn fchmod(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let fd = descriptor_arg(args.i32(0)?)?;
    let mode = args.u32(1)?;
    env.context().host.fs().set_fd_permissions(fd, mode)?;
    Ok(0)
}

/// `-1` leaves the owner or group unchanged.
fn fchown32(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let fd = descriptor_arg(args.i32(0)?)?;
    let owner = u32::try_from(args.i32(1)?).ok();
    let group = u32::try_from(args.i32(2)?).ok();
    env.context().host.fs().set_owner(fd, owner, group)?;
    Ok(0)
}

fn ftruncate64(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let fd = descriptor_arg(args.i32(0)?)?;
    let length = u64::try_from(args.i64(1)?).map_err(|_| Errno::Inval)?;
    env.context().host.fs_mut().set_size(fd, length)?;
    Ok(0)
}

fn fdatasync(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let fd = descriptor_arg(args.i32(0)?)?;
    env.context().host.fs_mut().sync(fd, true)?;
    Ok(0)
}

/// Set times of a path, or of `dirfd` itself when the path is null.
fn utimensat(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let dirfd = args.i32(0)?;
    let path_ptr = args.u32(1)?;
    let times = args.u32(2)?;
    let flags = args.i32(3)?;
    if flags & !AT_SYMLINK_NOFOLLOW != 0 {
        return Err(Errno::Inval.into());
    }
    let (ctx, memory) = env.memory()?;

    let (atim, atim_flags) = if times == 0 {
        (0, fstflags::ATIM_NOW)
    } else {
        memory.check(times, 2 * TIMESPEC_SIZE)?;
        timespec(&memory, times, fstflags::ATIM, fstflags::ATIM_NOW)?
    };
    let (mtim, mtim_flags) = if times == 0 {
        (0, fstflags::MTIM_NOW)
    } else {
        timespec(&memory, times + TIMESPEC_SIZE, fstflags::MTIM, fstflags::MTIM_NOW)?
    };
    let fst = atim_flags | mtim_flags;

    if path_ptr == 0 {
        ctx.host.fs_mut().set_times(descriptor_arg(dirfd)?, atim, mtim, fst)?;
        return Ok(0);
    }
    let guest_path = read_path(&memory, path_ptr)?;
    let (base, guest_path) = locate(&ctx.host, dirfd, &guest_path)?;
    let follow = flags & AT_SYMLINK_NOFOLLOW == 0;
    ctx.host
        .fs()
        .path_set_times(base, lookup(follow), &guest_path, atim, mtim, fst)?;
    Ok(0)
}

/// Decode one `struct timespec` into nanoseconds and the `fstflags` it sets.
fn timespec(memory: &MemoryView<'_>, ptr: u32, set: u16, now: u16) -> Result<(u64, u16), SyscallError> {
    let secs = memory.read_u64(ptr)?;
    let nanos = memory.read_u32(ptr + 8)?;
    match nanos {
        UTIME_NOW => Ok((0, now)),
        UTIME_OMIT => Ok((0, 0)),
        n if u64::from(n) >= NANOS_PER_SEC => Err(Errno::Inval.into()),
        n => {
            let secs = i64::from_le_bytes(secs.to_le_bytes());
            let total = u64::try_from(secs)
                .ok()
                .and_then(|s| s.checked_mul(NANOS_PER_SEC))
                .and_then(|t| t.checked_add(u64::from(n)))
                .ok_or(Errno::Inval)?;
            Ok((total, set))
        }
    }
}

/// Map `len` bytes of a file into freshly allocated guest memory.
///
/// The memory comes from the guest's own allocator, so the libc side frees
/// it on `munmap`.
fn mmap_js(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let len = args.u32(0)?;
    let prot = args.i32(1)?;
    let flags = args.i32(2)?;
    let fd = descriptor_arg(args.i32(3)?)?;
    let offset = u64::try_from(args.i64(4)?).map_err(|_| Errno::Inval)?;
    let allocated = args.u32(5)?;
    let addr_out = args.u32(6)?;
    if len == 0 {
        return Err(Errno::Inval.into());
    }

    let stat = env.context().host.fs().fdstat(fd)?;
    if stat.filetype != filetype::REGULAR_FILE {
        return Err(Errno::NoDev.into());
    }
    if stat.rights_base & rights::FD_READ == 0 {
        return Err(Errno::Acces.into());
    }
    if !env.has_export(MEMALIGN) {
        warn!("Guest exports no {MEMALIGN}; cannot map files");
        return Err(Errno::NoMem.into());
    }

    let size = i32::try_from(len).map_err(|_| Errno::NoMem)?;
    let ptr = match env.call_export(MEMALIGN, &[WasmValue::I32(MMAP_ALIGN), WasmValue::I32(size)])? {
        Some(WasmValue::I32(ptr)) if ptr != 0 => u32::from_le_bytes(ptr.to_le_bytes()),
        _ => return Err(Errno::NoMem.into()),
    };

    let (ctx, mut memory) = env.memory()?;
    let target = memory.slice_mut(ptr, len)?;
    target.fill(0);
    let fs = ctx.host.fs_mut();
    let mut filled = 0;
    while filled < target.len() {
        let n = fs.pread(fd, &mut target[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    debug!(fd, len, prot, flags, offset, addr = ptr, filled, "Mapped file");

    memory.write_i32(allocated, 1)?;
    memory.write_u32(addr_out, ptr)?;
    Ok(0)
}

/// Write a shared, writable mapping back to its file.
fn munmap_js(env: &mut dyn GuestEnv, args: Args<'_>) -> Result<i32, SyscallError> {
    let addr = args.u32(0)?;
    let len = args.u32(1)?;
    let prot = args.i32(2)?;
    let flags = args.i32(3)?;
    let fd = descriptor_arg(args.i32(4)?)?;
    let offset = u64::try_from(args.i64(5)?).map_err(|_| Errno::Inval)?;

    let (ctx, memory) = env.memory()?;
    let fs = ctx.host.fs_mut();
    fs.fdstat(fd)?;
    if prot & PROT_WRITE == 0 || flags & MAP_SHARED == 0 || flags & MAP_PRIVATE != 0 {
        return Ok(0);
    }

    let data = memory.slice(addr, len)?;
    let mut written = 0;
    while written < data.len() {
        let n = fs.pwrite(fd, &data[written..], offset + written as u64)?;
        if n == 0 {
            return Err(Errno::Io.into());
        }
        written += n;
    }
    debug!(fd, len, offset, "Wrote back shared mapping");
    Ok(0)
}

fn file_type_bits(kind: u8) -> u32 {
    match kind {
        filetype::BLOCK_DEVICE => S_IFBLK,
        filetype::CHARACTER_DEVICE => S_IFCHR,
        filetype::DIRECTORY => S_IFDIR,
        filetype::REGULAR_FILE => S_IFREG,
        filetype::SOCKET_DGRAM | filetype::SOCKET_STREAM => S_IFSOCK,
        filetype::SYMBOLIC_LINK => S_IFLNK,
        _ => 0,
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(super) fn encode_stat(stat: &FileStat) -> [u8; STAT_SIZE as usize] {
    let mut out = [0u8; STAT_SIZE as usize];
    out[0..4].copy_from_slice(&(stat.dev as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(file_type_bits(stat.filetype) | stat.mode).to_le_bytes());
    out[8..12].copy_from_slice(&(stat.nlink as u32).to_le_bytes());
    out[12..16].copy_from_slice(&stat.uid.to_le_bytes());
    out[16..20].copy_from_slice(&stat.gid.to_le_bytes());
    out[24..32].copy_from_slice(&stat.size.to_le_bytes());
    out[32..36].copy_from_slice(&STAT_BLOCK_SIZE.to_le_bytes());
    out[36..40].copy_from_slice(&(stat.blocks as u32).to_le_bytes());
    for (at, nanos) in [(40, stat.atim), (56, stat.mtim), (72, stat.ctim)] {
        out[at..at + 8].copy_from_slice(&(nanos / NANOS_PER_SEC).to_le_bytes());
        out[at + 8..at + 12].copy_from_slice(&((nanos % NANOS_PER_SEC) as u32).to_le_bytes());
    }
    out[88..96].copy_from_slice(&stat.ino.to_le_bytes());
    out
}
