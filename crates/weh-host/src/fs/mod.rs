//! Sandboxed filesystem view.
//!
//! [`FileSystem`] owns the guest descriptor table and enforces the sandbox
//! posture chosen at construction:
//! - **Preopens**: every path is resolved below one of the preopened host
//!   directories; `..` escapes and foreign absolute paths yield `NOTCAPABLE`
//! - **Unrestricted**: a single `/` preopen maps onto the host root
//!
//! Guest-memory marshalling is not done here; callers pass plain Rust
//! buffers and get WASI [`Errno`] values back.

pub mod fd;
pub mod path;

use std::fs::{self, File, FileTimes, Metadata, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use weh_common::abi::{fdflags, filetype, fstflags, lookupflags, oflags, rights, whence};
use weh_common::{Errno, FilesystemConfig, HostError, SymlinkPolicy};

pub use fd::{FdEntry, FdKind, FdTable, OpenDir, OpenFile, SandboxRoot};
use path::Normalized;

/// Attributes reported by `fd_filestat_get` / `path_filestat_get`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub filetype: u8,
    pub nlink: u64,
    pub size: u64,
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
    /// Permission bits (`0o7777`); not part of the WASI layout.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Allocated 512-byte blocks.
    pub blocks: u64,
}

/// Attributes reported by `fd_fdstat_get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdStat {
    pub filetype: u8,
    pub flags: u16,
    pub rights_base: u64,
    pub rights_inheriting: u64,
}

/// One directory entry as listed by `fd_readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub filetype: u8,
}

/// Arguments of `path_open` beyond the path itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenRequest {
    /// `lookupflags` for the final component.
    pub dirflags: u32,
    /// `oflags` (create, directory, exclusive, truncate).
    pub oflags: u16,
    /// Requested rights of the new descriptor.
    pub rights_base: u64,
    /// Requested inheriting rights of the new descriptor.
    pub rights_inheriting: u64,
    /// `fdflags` of the new descriptor.
    pub fdflags: u16,
}

/// A guest path resolved to a host path inside the sandbox.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Sandbox the path belongs to.
    pub root: Arc<SandboxRoot>,
    /// Components below the sandbox root.
    pub components: Vec<String>,
    /// Host path to operate on.
    pub host_path: PathBuf,
}

/// The guest's view of the host filesystem.
pub struct FileSystem {
    table: FdTable,
    unrestricted: bool,
    symlinks: SymlinkPolicy,
}

impl FileSystem {
    /// Build the descriptor table: standard streams at 0..=2, then one
    /// directory descriptor per preopen.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration mixes both sandbox postures,
    /// repeats a guest mount, or names a host directory that cannot be opened.
    pub fn new(
        stdin: Box<dyn Read + Send>,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
        config: &FilesystemConfig,
    ) -> Result<Self, HostError> {
        if config.unrestricted && !config.preopens.is_empty() {
            return Err(HostError::ConflictingSandbox);
        }

        let mut table = FdTable::new();
        table.insert_at(0, FdEntry::new(FdKind::Source(stdin), rights::STDIO, 0));
        table.insert_at(1, FdEntry::new(FdKind::Sink(stdout), rights::STDIO, 0));
        table.insert_at(2, FdEntry::new(FdKind::Sink(stderr), rights::STDIO, 0));

        let mounts: Vec<(PathBuf, String)> = if config.unrestricted {
            vec![(PathBuf::from("/"), "/".to_string())]
        } else {
            config
                .preopens
                .iter()
                .map(|p| (PathBuf::from(&p.host_path), p.guest_path.clone()))
                .collect()
        };

        let mut seen: Vec<&str> = Vec::new();
        for (host_root, mount) in &mounts {
            if mount.is_empty() || mount.contains('\0') {
                return Err(HostError::InvalidGuestPath {
                    path: mount.clone(),
                });
            }
            if seen.contains(&mount.as_str()) {
                return Err(HostError::DuplicateMount {
                    guest_path: mount.clone(),
                });
            }
            seen.push(mount);

            let root = open_root(host_root, mount)?;
            let entry = FdEntry::new(
                FdKind::Dir(OpenDir {
                    host_path: root.host_root.clone(),
                    root: Arc::new(root),
                    components: Vec::new(),
                    preopen: true,
                }),
                rights::DIRECTORY,
                rights::DIRECTORY | rights::REGULAR_FILE,
            );
            let fd = table.insert(entry).map_err(|_| HostError::InvalidGuestPath {
                path: mount.clone(),
            })?;
            debug!(fd, mount = %mount, host_root = %host_root.display(), "Preopened directory");
        }

        Ok(Self {
            table,
            unrestricted: config.unrestricted,
            symlinks: config.symlinks,
        })
    }

    /// The descriptor table.
    pub fn table(&self) -> &FdTable {
        &self.table
    }

    /// The descriptor table, mutably.
    pub fn table_mut(&mut self) -> &mut FdTable {
        &mut self.table
    }

    /// Returns `true` when the sandbox is the whole host filesystem.
    pub fn is_unrestricted(&self) -> bool {
        self.unrestricted
    }

    /// Descriptor of the preopen mounted under `name`.
    pub fn open_preopened(&self, name: &str) -> Option<u32> {
        self.table.iter().find_map(|(fd, entry)| match &entry.kind {
            FdKind::Dir(dir) if dir.preopen && dir.root.mount == name => Some(fd),
            _ => None,
        })
    }

    /// Mount name of a preopened descriptor; `BADF` for anything else.
    pub fn prestat_name(&self, fd: u32) -> Result<&str, Errno> {
        match &self.table.get(fd)?.kind {
            FdKind::Dir(dir) if dir.preopen => Ok(&dir.root.mount),
            _ => Err(Errno::Badf),
        }
    }

    /// Resolve a guest path relative to directory descriptor `fd`.
    ///
    /// Symlinks are followed according to the configured policy.
    pub fn resolve(&self, fd: u32, guest_path: &str) -> Result<PathBuf, Errno> {
        self.resolve_at(fd, guest_path, true).map(|r| r.host_path)
    }

    /// Resolve a guest path, choosing whether a final symlink is followed.
    ///
    /// Escapes are rejected lexically, before any host I/O.
    pub fn resolve_at(&self, fd: u32, guest_path: &str, follow: bool) -> Result<Resolved, Errno> {
        path::validate(guest_path)?;
        let dir = self.table.get(fd)?.as_dir()?;

        let (base, relative): (&[String], &str) = if guest_path.starts_with('/') {
            match path::strip_mount(&dir.root.mount, guest_path) {
                Some(rest) if dir.root.mount.starts_with('/') => (&[], rest),
                _ => {
                    warn!(fd, path = guest_path, "Absolute path outside of preopen rejected");
                    return Err(Errno::NotCapable);
                }
            }
        } else {
            (&dir.components, guest_path)
        };

        let components = match path::normalize(base, relative, self.unrestricted) {
            Normalized::Inside(components) => components,
            Normalized::Escapes => {
                warn!(fd, path = guest_path, "Path escapes the sandbox");
                return Err(Errno::NotCapable);
            }
        };

        let host_path = if self.unrestricted {
            join(&dir.root.host_root, &components)
        } else {
            self.check_symlinks(&dir.root, &components, follow)?
        };

        Ok(Resolved {
            root: Arc::clone(&dir.root),
            components,
            host_path,
        })
    }

    fn check_symlinks(
        &self,
        root: &SandboxRoot,
        components: &[String],
        follow: bool,
    ) -> Result<PathBuf, Errno> {
        let mut current = root.host_root.clone();
        let last = components.len().saturating_sub(1);

        for (index, component) in components.iter().enumerate() {
            current.push(component);
            let Ok(meta) = fs::symlink_metadata(&current) else {
                // Nothing below a missing component can be a link yet.
                current.extend(&components[index + 1..]);
                return Ok(current);
            };
            if !meta.file_type().is_symlink() || (index == last && !follow) {
                continue;
            }

            match self.symlinks {
                SymlinkPolicy::Deny => {
                    warn!(path = %current.display(), "Symlink refused by policy");
                    return Err(Errno::NotCapable);
                }
                SymlinkPolicy::WithinRoot => {
                    let target = fs::canonicalize(&current).map_err(Errno::from)?;
                    if !target.starts_with(&root.canonical_root) {
                        warn!(
                            path = %current.display(),
                            target = %target.display(),
                            "Symlink target outside of the sandbox"
                        );
                        return Err(Errno::NotCapable);
                    }
                    current = target;
                }
            }
        }

        Ok(current)
    }

    /// Open a file or directory below `dirfd` and return the new descriptor.
    pub fn open(&mut self, dirfd: u32, guest_path: &str, request: &OpenRequest) -> Result<u32, Errno> {
        let parent = self.table.get(dirfd)?;
        parent.as_dir()?;
        parent.require(rights::PATH_OPEN)?;
        if request.oflags & oflags::CREAT != 0 {
            parent.require(rights::PATH_CREATE_FILE)?;
        }
        let inheriting = parent.rights_inheriting;

        let follow = request.dirflags & lookupflags::SYMLINK_FOLLOW != 0;
        let resolved = self.resolve_at(dirfd, guest_path, follow)?;
        let host_path = &resolved.host_path;

        if !follow && is_symlink(host_path) {
            return Err(Errno::Loop);
        }

        let meta = fs::metadata(host_path);
        let wants_dir = request.oflags & oflags::DIRECTORY != 0;
        if wants_dir {
            if request.oflags & oflags::CREAT != 0 {
                return Err(Errno::Inval);
            }
            match &meta {
                Ok(m) if m.is_dir() => {}
                Ok(_) => return Err(Errno::NotDir),
                Err(e) => return Err(Errno::from(e)),
            }
        }

        let entry = match meta {
            Ok(m) if m.is_dir() => {
                let creat_excl = oflags::CREAT | oflags::EXCL;
                if request.oflags & creat_excl == creat_excl {
                    return Err(Errno::Exist);
                }
                if request.oflags & oflags::TRUNC != 0 || request.rights_base & rights::FD_WRITE != 0 {
                    return Err(Errno::IsDir);
                }
                FdEntry::new(
                    FdKind::Dir(OpenDir {
                        root: resolved.root,
                        components: resolved.components,
                        host_path: resolved.host_path.clone(),
                        preopen: false,
                    }),
                    request.rights_base & inheriting & rights::DIRECTORY,
                    request.rights_inheriting & inheriting,
                )
            }
            _ => {
                let file = open_file(host_path, request)?;
                FdEntry::new(
                    FdKind::File(OpenFile {
                        file,
                        host_path: resolved.host_path.clone(),
                    }),
                    request.rights_base & inheriting & rights::REGULAR_FILE,
                    request.rights_inheriting & inheriting,
                )
            }
        };

        let mut entry = entry;
        entry.flags = request.fdflags;
        let fd = self.table.insert(entry)?;
        debug!(fd, path = guest_path, "Opened guest descriptor");
        Ok(fd)
    }

    /// Close a descriptor.
    pub fn close(&mut self, fd: u32) -> Result<(), Errno> {
        self.table.remove(fd).map(drop)
    }

    /// Close every descriptor.
    pub fn close_all(&mut self) {
        self.table.clear();
    }

    /// Read into `buf` at the current position.
    pub fn read(&mut self, fd: u32, buf: &mut [u8]) -> Result<usize, Errno> {
        let entry = self.table.get_mut(fd)?;
        entry.require(rights::FD_READ)?;
        match &mut entry.kind {
            FdKind::Source(source) => Ok(source.read(buf)?),
            FdKind::File(file) => Ok(file.file.read(buf)?),
            FdKind::Dir(_) => Err(Errno::IsDir),
            FdKind::Sink(_) => Err(Errno::Badf),
        }
    }

    /// Write `data` at the current position (or the end, in append mode).
    pub fn write(&mut self, fd: u32, data: &[u8]) -> Result<usize, Errno> {
        let entry = self.table.get_mut(fd)?;
        entry.require(rights::FD_WRITE)?;
        let append = entry.flags & fdflags::APPEND != 0;
        match &mut entry.kind {
            FdKind::Sink(sink) => {
                sink.write_all(data)?;
                sink.flush()?;
                Ok(data.len())
            }
            FdKind::File(file) => {
                if append {
                    file.file.seek(SeekFrom::End(0))?;
                }
                file.file.write_all(data)?;
                Ok(data.len())
            }
            FdKind::Dir(_) => Err(Errno::IsDir),
            FdKind::Source(_) => Err(Errno::Badf),
        }
    }

    /// Read at `offset` without moving the file position.
    pub fn pread(&mut self, fd: u32, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
        let file = self.positioned_file(fd, rights::FD_READ | rights::FD_SEEK)?;
        let saved = file.stream_position()?;
        file.seek(SeekFrom::Start(offset))?;
        let result = file.read(buf);
        file.seek(SeekFrom::Start(saved))?;
        Ok(result?)
    }

    /// Write at `offset` without moving the file position.
    pub fn pwrite(&mut self, fd: u32, data: &[u8], offset: u64) -> Result<usize, Errno> {
        let file = self.positioned_file(fd, rights::FD_WRITE | rights::FD_SEEK)?;
        let saved = file.stream_position()?;
        file.seek(SeekFrom::Start(offset))?;
        let result = file.write_all(data);
        file.seek(SeekFrom::Start(saved))?;
        result?;
        Ok(data.len())
    }

    fn positioned_file(&mut self, fd: u32, required: u64) -> Result<&mut File, Errno> {
        let entry = self.table.get_mut(fd)?;
        entry.require(required)?;
        match &mut entry.kind {
            FdKind::File(file) => Ok(&mut file.file),
            FdKind::Dir(_) => Err(Errno::IsDir),
            FdKind::Source(_) | FdKind::Sink(_) => Err(Errno::Spipe),
        }
    }

    /// Move the file position and return the new offset.
    pub fn seek(&mut self, fd: u32, offset: i64, whence: u8) -> Result<u64, Errno> {
        let required = if offset == 0 && whence == whence::CUR {
            rights::FD_TELL
        } else {
            rights::FD_SEEK
        };
        let target = match whence {
            whence::SET => SeekFrom::Start(u64::try_from(offset).map_err(|_| Errno::Inval)?),
            whence::CUR => SeekFrom::Current(offset),
            whence::END => SeekFrom::End(offset),
            _ => return Err(Errno::Inval),
        };
        let file = self.positioned_file(fd, required)?;
        Ok(file.seek(target)?)
    }

    /// Current file position.
    pub fn tell(&mut self, fd: u32) -> Result<u64, Errno> {
        self.seek(fd, 0, whence::CUR)
    }

    /// Flush data and metadata to storage.
    pub fn sync(&mut self, fd: u32, data_only: bool) -> Result<(), Errno> {
        let entry = self.table.get_mut(fd)?;
        entry.require(if data_only {
            rights::FD_DATASYNC
        } else {
            rights::FD_SYNC
        })?;
        match &mut entry.kind {
            FdKind::File(file) if data_only => Ok(file.file.sync_data()?),
            FdKind::File(file) => Ok(file.file.sync_all()?),
            FdKind::Sink(sink) => Ok(sink.flush()?),
            FdKind::Dir(_) | FdKind::Source(_) => Ok(()),
        }
    }

    /// Descriptor attributes.
    pub fn fdstat(&self, fd: u32) -> Result<FdStat, Errno> {
        let entry = self.table.get(fd)?;
        Ok(FdStat {
            filetype: entry.kind.filetype(),
            flags: entry.flags,
            rights_base: entry.rights_base,
            rights_inheriting: entry.rights_inheriting,
        })
    }

    /// Replace the descriptor flags.
    pub fn set_flags(&mut self, fd: u32, flags: u16) -> Result<(), Errno> {
        let entry = self.table.get_mut(fd)?;
        entry.require(rights::FD_FDSTAT_SET_FLAGS)?;
        entry.flags = flags;
        Ok(())
    }

    /// Drop rights; rights can never be added back.
    pub fn set_rights(&mut self, fd: u32, base: u64, inheriting: u64) -> Result<(), Errno> {
        let entry = self.table.get_mut(fd)?;
        if base & !entry.rights_base != 0 || inheriting & !entry.rights_inheriting != 0 {
            return Err(Errno::NotCapable);
        }
        entry.rights_base = base;
        entry.rights_inheriting = inheriting;
        Ok(())
    }

    /// Attributes of the resource behind a descriptor.
    pub fn filestat(&self, fd: u32) -> Result<FileStat, Errno> {
        let entry = self.table.get(fd)?;
        entry.require(rights::FD_FILESTAT_GET)?;
        match &entry.kind {
            FdKind::File(file) => Ok(FileStat::from_metadata(&file.file.metadata()?)),
            FdKind::Dir(dir) => Ok(FileStat::from_metadata(&fs::metadata(&dir.host_path)?)),
            FdKind::Source(_) | FdKind::Sink(_) => Ok(FileStat {
                filetype: filetype::CHARACTER_DEVICE,
                nlink: 1,
                ..FileStat::default()
            }),
        }
    }

    /// Truncate or extend a file.
    pub fn set_size(&mut self, fd: u32, size: u64) -> Result<(), Errno> {
        let file = self.regular_file(fd, rights::FD_FILESTAT_SET_SIZE)?;
        Ok(file.set_len(size)?)
    }

    /// Make sure `offset..offset+len` is backed by the file.
    pub fn allocate(&mut self, fd: u32, offset: u64, len: u64) -> Result<(), Errno> {
        let end = offset.checked_add(len).ok_or(Errno::Fbig)?;
        let file = self.regular_file(fd, rights::FD_ALLOCATE)?;
        if file.metadata()?.len() < end {
            file.set_len(end)?;
        }
        Ok(())
    }

    /// Validate an access-pattern hint; hints are otherwise ignored.
    pub fn advise(&self, fd: u32, advice: u8) -> Result<(), Errno> {
        let entry = self.table.get(fd)?;
        entry.require(rights::FD_ADVISE)?;
        if advice > 5 {
            return Err(Errno::Inval);
        }
        Ok(())
    }

    /// Set access and modification times of the resource behind `fd`.
    pub fn set_times(&mut self, fd: u32, atim: u64, mtim: u64, fst: u16) -> Result<(), Errno> {
        let times = file_times(atim, mtim, fst)?;
        let entry = self.table.get_mut(fd)?;
        entry.require(rights::FD_FILESTAT_SET_TIMES)?;
        match &entry.kind {
            FdKind::File(file) => Ok(file.file.set_times(times)?),
            FdKind::Dir(dir) => Ok(File::open(&dir.host_path)?.set_times(times)?),
            FdKind::Source(_) | FdKind::Sink(_) => Err(Errno::Badf),
        }
    }

    fn regular_file(&mut self, fd: u32, required: u64) -> Result<&mut File, Errno> {
        let entry = self.table.get_mut(fd)?;
        entry.require(required)?;
        match &mut entry.kind {
            FdKind::File(file) => Ok(&mut file.file),
            FdKind::Dir(_) => Err(Errno::IsDir),
            FdKind::Source(_) | FdKind::Sink(_) => Err(Errno::Inval),
        }
    }

    /// List a directory: `.`, `..`, then entries in byte order of their names.
    pub fn readdir(&self, fd: u32) -> Result<Vec<DirEntry>, Errno> {
        let entry = self.table.get(fd)?;
        entry.require(rights::FD_READDIR)?;
        let dir = entry.as_dir()?;

        let self_ino = fs::metadata(&dir.host_path).map(|m| FileStat::from_metadata(&m).ino)?;
        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                ino: self_ino,
                filetype: filetype::DIRECTORY,
            },
            DirEntry {
                name: "..".to_string(),
                ino: 0,
                filetype: filetype::DIRECTORY,
            },
        ];

        let mut listed = Vec::new();
        for item in fs::read_dir(&dir.host_path)? {
            let item = item?;
            let file_type = item.file_type()?;
            listed.push(DirEntry {
                name: item.file_name().to_string_lossy().into_owned(),
                ino: dir_entry_ino(&item),
                filetype: filetype_of(file_type),
            });
        }
        listed.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        entries.extend(listed);

        Ok(entries)
    }

    /// Create a directory.
    pub fn create_directory(&self, fd: u32, guest_path: &str) -> Result<(), Errno> {
        self.table.get(fd)?.require(rights::PATH_CREATE_DIRECTORY)?;
        let resolved = self.resolve_at(fd, guest_path, false)?;
        Ok(fs::create_dir(&resolved.host_path)?)
    }

    /// Remove an empty directory.
    pub fn remove_directory(&self, fd: u32, guest_path: &str) -> Result<(), Errno> {
        self.table.get(fd)?.require(rights::PATH_REMOVE_DIRECTORY)?;
        let resolved = self.resolve_at(fd, guest_path, false)?;
        if resolved.components.is_empty() {
            return Err(Errno::Inval);
        }
        Ok(fs::remove_dir(&resolved.host_path)?)
    }

    /// Remove a file or symlink.
    pub fn unlink_file(&self, fd: u32, guest_path: &str) -> Result<(), Errno> {
        self.table.get(fd)?.require(rights::PATH_UNLINK_FILE)?;
        let resolved = self.resolve_at(fd, guest_path, false)?;
        if fs::symlink_metadata(&resolved.host_path)?.is_dir() {
            return Err(Errno::IsDir);
        }
        Ok(fs::remove_file(&resolved.host_path)?)
    }

    /// Rename a file or directory, possibly across descriptors.
    pub fn rename(&self, old_fd: u32, old_path: &str, new_fd: u32, new_path: &str) -> Result<(), Errno> {
        self.table.get(old_fd)?.require(rights::PATH_RENAME_SOURCE)?;
        self.table.get(new_fd)?.require(rights::PATH_RENAME_TARGET)?;
        let from = self.resolve_at(old_fd, old_path, false)?;
        let to = self.resolve_at(new_fd, new_path, false)?;
        Ok(fs::rename(&from.host_path, &to.host_path)?)
    }

    /// Create a hard link.
    pub fn link(
        &self,
        old_fd: u32,
        old_flags: u32,
        old_path: &str,
        new_fd: u32,
        new_path: &str,
    ) -> Result<(), Errno> {
        self.table.get(old_fd)?.require(rights::PATH_LINK_SOURCE)?;
        self.table.get(new_fd)?.require(rights::PATH_LINK_TARGET)?;
        let follow = old_flags & lookupflags::SYMLINK_FOLLOW != 0;
        let from = self.resolve_at(old_fd, old_path, follow)?;
        let to = self.resolve_at(new_fd, new_path, false)?;
        Ok(fs::hard_link(&from.host_path, &to.host_path)?)
    }

    /// Create a symlink at `guest_path` pointing to `target`.
    ///
    /// In a restricted sandbox the target must stay inside the sandbox.
    pub fn symlink(&self, target: &str, fd: u32, guest_path: &str) -> Result<(), Errno> {
        self.table.get(fd)?.require(rights::PATH_SYMLINK)?;
        path::validate(target)?;
        let link = self.resolve_at(fd, guest_path, false)?;

        if !self.unrestricted {
            let parent = &link.components[..link.components.len().saturating_sub(1)];
            if target.starts_with('/') || path::normalize(parent, target, false) == Normalized::Escapes {
                warn!(symlink_target = target, "Symlink target escapes the sandbox");
                return Err(Errno::NotCapable);
            }
        }

        create_symlink(target, &link.host_path)
    }

    /// Contents of a symlink.
    pub fn readlink(&self, fd: u32, guest_path: &str) -> Result<Vec<u8>, Errno> {
        self.table.get(fd)?.require(rights::PATH_READLINK)?;
        let resolved = self.resolve_at(fd, guest_path, false)?;
        let target = fs::read_link(&resolved.host_path)?;
        Ok(target.to_string_lossy().into_owned().into_bytes())
    }

    /// Attributes of the file at a path.
    pub fn path_filestat(&self, fd: u32, flags: u32, guest_path: &str) -> Result<FileStat, Errno> {
        self.table.get(fd)?.require(rights::PATH_FILESTAT_GET)?;
        let follow = flags & lookupflags::SYMLINK_FOLLOW != 0;
        let resolved = self.resolve_at(fd, guest_path, follow)?;
        let meta = if follow {
            fs::metadata(&resolved.host_path)?
        } else {
            fs::symlink_metadata(&resolved.host_path)?
        };
        Ok(FileStat::from_metadata(&meta))
    }

    /// Set access and modification times of the file at a path.
    pub fn path_set_times(
        &self,
        fd: u32,
        flags: u32,
        guest_path: &str,
        atim: u64,
        mtim: u64,
        fst: u16,
    ) -> Result<(), Errno> {
        self.table.get(fd)?.require(rights::PATH_FILESTAT_SET_TIMES)?;
        let times = file_times(atim, mtim, fst)?;
        let follow = flags & lookupflags::SYMLINK_FOLLOW != 0;
        let resolved = self.resolve_at(fd, guest_path, follow)?;
        // Opening the path would follow a link the sandbox never checked.
        if !follow && is_symlink(&resolved.host_path) {
            warn!(fd, path = guest_path, "Refusing to set times through an unfollowed symlink");
            return Err(Errno::Loop);
        }
        Ok(File::open(&resolved.host_path)?.set_times(times)?)
    }

    /// Descriptor of the preopen whose mount holds the absolute guest `path`.
    ///
    /// The longest matching mount wins, so `/data/in` beats `/data`.
    pub fn preopen_for(&self, guest_path: &str) -> Option<u32> {
        self.table
            .iter()
            .filter_map(|(fd, entry)| match &entry.kind {
                FdKind::Dir(dir) if dir.preopen && dir.root.mount.starts_with('/') => {
                    path::strip_mount(&dir.root.mount, guest_path)
                        .map(|_| (path::mount_components(&dir.root.mount).len(), fd))
                }
                _ => None,
            })
            .max_by_key(|(depth, fd)| (*depth, std::cmp::Reverse(*fd)))
            .map(|(_, fd)| fd)
    }

    /// Check whether the file at a path exists and allows `access`.
    pub fn check_access(&self, fd: u32, flags: u32, guest_path: &str, access: Access) -> Result<(), Errno> {
        self.table.get(fd)?.require(rights::PATH_FILESTAT_GET)?;
        let follow = flags & lookupflags::SYMLINK_FOLLOW != 0;
        let resolved = self.resolve_at(fd, guest_path, follow)?;
        let meta = if follow {
            fs::metadata(&resolved.host_path)?
        } else {
            fs::symlink_metadata(&resolved.host_path)?
        };

        let mode = FileStat::from_metadata(&meta).mode;
        let denied = access.read && mode & 0o444 == 0
            || access.write && (mode & 0o222 == 0 || meta.permissions().readonly())
            || access.execute && mode & 0o111 == 0;
        if denied {
            debug!(fd, path = guest_path, ?access, mode, "Access check failed");
            return Err(Errno::Acces);
        }
        Ok(())
    }

    /// Change the permission bits of the file at a path, following symlinks.
    pub fn set_permissions(&self, fd: u32, guest_path: &str, mode: u32) -> Result<(), Errno> {
        self.table.get(fd)?.require(rights::PATH_FILESTAT_SET_TIMES)?;
        let resolved = self.resolve_at(fd, guest_path, true)?;
        let mut permissions = fs::metadata(&resolved.host_path)?.permissions();
        apply_mode(&mut permissions, mode);
        Ok(fs::set_permissions(&resolved.host_path, permissions)?)
    }

    /// Change the permission bits of the resource behind `fd`.
    pub fn set_fd_permissions(&self, fd: u32, mode: u32) -> Result<(), Errno> {
        let entry = self.table.get(fd)?;
        entry.require(rights::FD_FILESTAT_SET_TIMES)?;
        match &entry.kind {
            FdKind::File(file) => {
                let mut permissions = file.file.metadata()?.permissions();
                apply_mode(&mut permissions, mode);
                Ok(file.file.set_permissions(permissions)?)
            }
            FdKind::Dir(dir) => {
                let mut permissions = fs::metadata(&dir.host_path)?.permissions();
                apply_mode(&mut permissions, mode);
                Ok(fs::set_permissions(&dir.host_path, permissions)?)
            }
            FdKind::Source(_) | FdKind::Sink(_) => Err(Errno::Badf),
        }
    }

    /// Change the owner and group of the resource behind `fd`; `None` keeps
    /// the current value.
    pub fn set_owner(&self, fd: u32, uid: Option<u32>, gid: Option<u32>) -> Result<(), Errno> {
        let entry = self.table.get(fd)?;
        entry.require(rights::FD_FILESTAT_SET_TIMES)?;
        match &entry.kind {
            FdKind::File(file) => change_owner(Owned::File(&file.file), uid, gid),
            FdKind::Dir(dir) => change_owner(Owned::Path(&dir.host_path), uid, gid),
            FdKind::Source(_) | FdKind::Sink(_) => Err(Errno::Badf),
        }
    }
}

/// Permissions asked for by an access check; all `false` only checks existence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("open_fds", &self.table.len())
            .field("unrestricted", &self.unrestricted)
            .field("symlinks", &self.symlinks)
            .finish_non_exhaustive()
    }
}

fn open_root(host_root: &Path, mount: &str) -> Result<SandboxRoot, HostError> {
    let failed = |source| HostError::PreopenFailed {
        host_path: host_root.to_path_buf(),
        source,
    };

    let meta = fs::metadata(host_root).map_err(failed)?;
    if !meta.is_dir() {
        return Err(failed(std::io::Error::from(std::io::ErrorKind::NotADirectory)));
    }
    let canonical_root = fs::canonicalize(host_root).map_err(failed)?;

    Ok(SandboxRoot {
        host_root: host_root.to_path_buf(),
        canonical_root,
        mount: mount.to_string(),
    })
}

fn open_file(host_path: &Path, request: &OpenRequest) -> Result<File, Errno> {
    let creates = request.oflags & (oflags::CREAT | oflags::TRUNC) != 0;
    let write = creates
        || request.fdflags & fdflags::APPEND != 0
        || request.rights_base
            & (rights::FD_WRITE | rights::FD_ALLOCATE | rights::FD_FILESTAT_SET_SIZE)
            != 0;
    let read = !write || request.rights_base & rights::FD_READ != 0;

    let mut options = OpenOptions::new();
    options.read(read).write(write);
    if request.oflags & oflags::CREAT != 0 {
        if request.oflags & oflags::EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    if request.oflags & oflags::TRUNC != 0 {
        options.truncate(true);
    }

    Ok(options.open(host_path)?)
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

#[cfg(unix)]
fn apply_mode(permissions: &mut fs::Permissions, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    permissions.set_mode(mode & 0o7777);
}

#[cfg(not(unix))]
fn apply_mode(permissions: &mut fs::Permissions, mode: u32) {
    permissions.set_readonly(mode & 0o222 == 0);
}

enum Owned<'a> {
    File(&'a File),
    Path(&'a Path),
}

#[cfg(unix)]
fn change_owner(target: Owned<'_>, uid: Option<u32>, gid: Option<u32>) -> Result<(), Errno> {
    match target {
        Owned::File(file) => Ok(std::os::unix::fs::fchown(file, uid, gid)?),
        Owned::Path(path) => Ok(std::os::unix::fs::chown(path, uid, gid)?),
    }
}

#[cfg(not(unix))]
fn change_owner(_target: Owned<'_>, _uid: Option<u32>, _gid: Option<u32>) -> Result<(), Errno> {
    Err(Errno::NotSup)
}

fn join(root: &Path, components: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(components);
    path
}

fn file_times(atim: u64, mtim: u64, fst: u16) -> Result<FileTimes, Errno> {
    if fst & fstflags::ATIM != 0 && fst & fstflags::ATIM_NOW != 0
        || fst & fstflags::MTIM != 0 && fst & fstflags::MTIM_NOW != 0
    {
        return Err(Errno::Inval);
    }

    let mut times = FileTimes::new();
    if fst & fstflags::ATIM_NOW != 0 {
        times = times.set_accessed(SystemTime::now());
    } else if fst & fstflags::ATIM != 0 {
        times = times.set_accessed(UNIX_EPOCH + Duration::from_nanos(atim));
    }
    if fst & fstflags::MTIM_NOW != 0 {
        times = times.set_modified(SystemTime::now());
    } else if fst & fstflags::MTIM != 0 {
        times = times.set_modified(UNIX_EPOCH + Duration::from_nanos(mtim));
    }
    Ok(times)
}

fn nanos_since_epoch(time: std::io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

impl FileStat {
    /// Convert host metadata into WASI attributes.
    pub fn from_metadata(meta: &Metadata) -> Self {
        let (dev, ino, nlink, ctim) = inode_info(meta);
        let (mode, uid, gid, blocks) = owner_info(meta);
        Self {
            dev,
            ino,
            filetype: filetype_of(meta.file_type()),
            nlink,
            size: meta.len(),
            atim: nanos_since_epoch(meta.accessed()),
            mtim: nanos_since_epoch(meta.modified()),
            ctim,
            mode,
            uid,
            gid,
            blocks,
        }
    }
}

#[cfg(unix)]
fn owner_info(meta: &Metadata) -> (u32, u32, u32, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.mode() & 0o7777, meta.uid(), meta.gid(), meta.blocks())
}

#[cfg(not(unix))]
fn owner_info(meta: &Metadata) -> (u32, u32, u32, u64) {
    let mode = match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    };
    (mode, 0, 0, meta.len().div_ceil(512))
}

#[cfg(unix)]
fn inode_info(meta: &Metadata) -> (u64, u64, u64, u64) {
    use std::os::unix::fs::MetadataExt;

    let ctim = u64::try_from(meta.ctime())
        .unwrap_or(0)
        .saturating_mul(1_000_000_000)
        .saturating_add(u64::try_from(meta.ctime_nsec()).unwrap_or(0));
    (meta.dev(), meta.ino(), meta.nlink(), ctim)
}

#[cfg(not(unix))]
fn inode_info(meta: &Metadata) -> (u64, u64, u64, u64) {
    (0, 0, 1, nanos_since_epoch(meta.modified()))
}

#[cfg(unix)]
fn dir_entry_ino(entry: &fs::DirEntry) -> u64 {
    use std::os::unix::fs::DirEntryExt;
    entry.ino()
}

#[cfg(not(unix))]
fn dir_entry_ino(_entry: &fs::DirEntry) -> u64 {
    0
}

fn filetype_of(file_type: fs::FileType) -> u8 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_block_device() {
            return filetype::BLOCK_DEVICE;
        }
        if file_type.is_char_device() {
            return filetype::CHARACTER_DEVICE;
        }
        if file_type.is_socket() {
            return filetype::SOCKET_STREAM;
        }
    }

    if file_type.is_symlink() {
        filetype::SYMBOLIC_LINK
    } else if file_type.is_dir() {
        filetype::DIRECTORY
    } else if file_type.is_file() {
        filetype::REGULAR_FILE
    } else {
        filetype::UNKNOWN
    }
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> Result<(), Errno> {
    Ok(std::os::unix::fs::symlink(target, link)?)
}

#[cfg(not(unix))]
fn create_symlink(_target: &str, _link: &Path) -> Result<(), Errno> {
    Err(Errno::NotSup)
}
