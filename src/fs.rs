//! FUSE adapter.
//!
//! A thin loopback layer: every kernel operation is performed for real
//! against the backing directory, then the matching [`Request`] is submitted
//! to the [`Scheduler`] and the remainder of the computed duration is slept
//! off before replying. Failed operations return their errno immediately and
//! are not charged any device time.

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request as KernelRequest, TimeOrNow,
};
use indexmap::IndexMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use crate::request::Request;
use crate::scheduler::Scheduler;
use crate::TRACING_TARGET;

/// TTL for cached attributes and entries. The backing directory should only
/// change through the mount, so a short TTL is enough.
const ATTR_TTL: Duration = Duration::from_secs(1);

const ROOT_INO: u64 = 1;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),

    #[error("mount I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

/// The loopback filesystem. Owns the inode and file-handle tables and a
/// handle to the scheduler.
pub struct MolassesFs {
    backing: PathBuf,
    scheduler: Scheduler,

    /// inode -> path relative to the backing directory. The root is inode 1
    /// with an empty path.
    paths: IndexMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,

    handles: HashMap<u64, OpenFile>,
    next_fh: u64,
}

struct OpenFile {
    file: File,
    /// Relative path, as submitted with read/write/fsync/close requests.
    path: String,
}

impl MolassesFs {
    pub fn new(backing: impl Into<PathBuf>, scheduler: Scheduler) -> MolassesFs {
        let mut fs = MolassesFs {
            backing: backing.into(),
            scheduler,
            paths: IndexMap::new(),
            by_path: HashMap::new(),
            next_ino: ROOT_INO + 1,
            handles: HashMap::new(),
            next_fh: 1,
        };
        fs.paths.insert(ROOT_INO, PathBuf::new());
        fs.by_path.insert(PathBuf::new(), ROOT_INO);
        fs
    }

    /// Submit `request` and sleep off whatever portion of the computed
    /// duration the real operation has not already used up.
    fn pay(&self, request: Request) {
        let started = request.timestamp;
        let duration = self.scheduler.schedule_blocking(request);
        if let Some(remaining) = duration.checked_sub(started.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    fn rel_path(&self, ino: u64) -> Option<&PathBuf> {
        self.paths.get(&ino)
    }

    fn abs_path(&self, ino: u64) -> Option<PathBuf> {
        self.rel_path(ino).map(|rel| self.backing.join(rel))
    }

    fn child_rel(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.rel_path(parent).map(|rel| rel.join(name))
    }

    /// The inode for a relative path, allocating one on first sight.
    fn ino_for_path(&mut self, rel: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(rel) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, rel.to_path_buf());
        self.by_path.insert(rel.to_path_buf(), ino);
        ino
    }

    fn forget_path(&mut self, rel: &Path) {
        if let Some(ino) = self.by_path.remove(rel) {
            self.paths.swap_remove(&ino);
        }
    }

    /// Rewrite table entries after a rename, including everything under a
    /// renamed directory.
    fn rename_tracked(&mut self, from: &Path, to: &Path) {
        self.forget_path(to);

        let moved: Vec<(u64, PathBuf)> = self
            .paths
            .iter()
            .filter_map(|(&ino, rel)| {
                rel.strip_prefix(from)
                    .ok()
                    .map(|suffix| (ino, to.join(suffix)))
            })
            .collect();

        for (ino, new_rel) in moved {
            if let Some(old_rel) = self.paths.insert(ino, new_rel.clone()) {
                self.by_path.remove(&old_rel);
            }
            self.by_path.insert(new_rel, ino);
        }
    }

    fn attr(&mut self, rel: &Path) -> io::Result<FileAttr> {
        let meta = std::fs::symlink_metadata(self.backing.join(rel))?;
        let ino = self.ino_for_path(rel);
        Ok(to_file_attr(ino, &meta))
    }

    fn request_path(&self, rel: &Path) -> String {
        rel.to_string_lossy().into_owned()
    }
}

// ── Attribute conversion ────────────────────────────────────────────────────

fn to_file_type(meta: &std::fs::Metadata) -> FileType {
    let ft = meta.file_type();
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn to_system_time(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0)
            + Duration::from_nanos(nanos as u64)
    }
}

fn to_file_attr(ino: u64, meta: &std::fs::Metadata) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: to_system_time(meta.atime(), meta.atime_nsec()),
        mtime: to_system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: to_system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: SystemTime::UNIX_EPOCH,
        kind: to_file_type(meta),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn timespec_for(time: Option<TimeOrNow>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(time)) => {
            let since_epoch = time
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or(Duration::ZERO);
            libc::timespec {
                tv_sec: since_epoch.as_secs() as libc::time_t,
                tv_nsec: since_epoch.subsec_nanos() as _,
            }
        }
    }
}

/// Last-resort errno fetch after a failed libc call.
fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

impl Filesystem for MolassesFs {
    fn init(&mut self, _req: &KernelRequest<'_>, _config: &mut KernelConfig) -> Result<(), i32> {
        Ok(())
    }

    fn lookup(&mut self, _req: &KernelRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let started = Instant::now();
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.attr(&rel) {
            Ok(attr) => {
                self.pay(Request::metadata(started));
                reply.entry(&ATTR_TTL, &attr, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getattr(&mut self, _req: &KernelRequest<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let started = Instant::now();
        let Some(rel) = self.rel_path(ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.attr(&rel) {
            Ok(attr) => {
                self.pay(Request::metadata(started));
                reply.attr(&ATTR_TTL, &attr);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &KernelRequest<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let started = Instant::now();
        let Some(rel) = self.rel_path(ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        let abs = self.backing.join(&rel);

        let result = (|| -> io::Result<()> {
            if let Some(mode) = mode {
                std::fs::set_permissions(
                    &abs,
                    std::os::unix::fs::PermissionsExt::from_mode(mode),
                )?;
            }
            if uid.is_some() || gid.is_some() {
                std::os::unix::fs::chown(&abs, uid, gid)?;
            }
            if let Some(size) = size {
                match fh.and_then(|fh| self.handles.get(&fh)) {
                    Some(open) => open.file.set_len(size)?,
                    None => OpenOptions::new().write(true).open(&abs)?.set_len(size)?,
                }
            }
            if atime.is_some() || mtime.is_some() {
                let times = [timespec_for(atime), timespec_for(mtime)];
                let c_path = cstring(&abs)?;
                let rc = unsafe {
                    libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0)
                };
                if rc != 0 {
                    return Err(last_os_error());
                }
            }
            Ok(())
        })();

        match result.and_then(|()| self.attr(&rel)) {
            Ok(attr) => {
                self.pay(Request::metadata(started));
                reply.attr(&ATTR_TTL, &attr);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readlink(&mut self, _req: &KernelRequest<'_>, ino: u64, reply: ReplyData) {
        let started = Instant::now();
        let Some(abs) = self.abs_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match std::fs::read_link(abs) {
            Ok(target) => {
                self.pay(Request::metadata(started));
                reply.data(target.as_os_str().as_bytes());
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn mknod(
        &mut self,
        _req: &KernelRequest<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let started = Instant::now();
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let abs = self.backing.join(&rel);

        let result = (|| -> io::Result<()> {
            let c_path = cstring(&abs)?;
            let rc = unsafe {
                libc::mknod(c_path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t)
            };
            if rc != 0 {
                return Err(last_os_error());
            }
            Ok(())
        })();

        match result.and_then(|()| self.attr(&rel)) {
            Ok(attr) => {
                self.pay(Request::metadata(started));
                reply.entry(&ATTR_TTL, &attr, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &KernelRequest<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let started = Instant::now();
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let abs = self.backing.join(&rel);

        let result = std::fs::create_dir(&abs).and_then(|()| {
            std::fs::set_permissions(&abs, std::os::unix::fs::PermissionsExt::from_mode(mode))
        });

        match result.and_then(|()| self.attr(&rel)) {
            Ok(attr) => {
                self.pay(Request::metadata(started));
                reply.entry(&ATTR_TTL, &attr, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn unlink(&mut self, _req: &KernelRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let started = Instant::now();
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        match std::fs::remove_file(self.backing.join(&rel)) {
            Ok(()) => {
                self.forget_path(&rel);
                self.pay(Request::metadata(started));
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rmdir(&mut self, _req: &KernelRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let started = Instant::now();
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        match std::fs::remove_dir(self.backing.join(&rel)) {
            Ok(()) => {
                self.forget_path(&rel);
                self.pay(Request::metadata(started));
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn symlink(
        &mut self,
        _req: &KernelRequest<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let started = Instant::now();
        let Some(rel) = self.child_rel(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = std::os::unix::fs::symlink(target, self.backing.join(&rel));
        match result.and_then(|()| self.attr(&rel)) {
            Ok(attr) => {
                self.pay(Request::metadata(started));
                reply.entry(&ATTR_TTL, &attr, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &KernelRequest<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let started = Instant::now();
        let (Some(from), Some(to)) = (
            self.child_rel(parent, name),
            self.child_rel(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };

        match std::fs::rename(self.backing.join(&from), self.backing.join(&to)) {
            Ok(()) => {
                self.rename_tracked(&from, &to);
                self.pay(Request::metadata(started));
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn link(
        &mut self,
        _req: &KernelRequest<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let started = Instant::now();
        let (Some(source), Some(rel)) =
            (self.abs_path(ino), self.child_rel(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = std::fs::hard_link(source, self.backing.join(&rel));
        match result.and_then(|()| self.attr(&rel)) {
            Ok(attr) => {
                self.pay(Request::metadata(started));
                reply.entry(&ATTR_TTL, &attr, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn open(&mut self, _req: &KernelRequest<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let started = Instant::now();
        let Some(rel) = self.rel_path(ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        let abs = self.backing.join(&rel);

        let (read, write) = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => (true, false),
        };

        match OpenOptions::new()
            .read(read)
            .write(write)
            .custom_flags(flags & !libc::O_ACCMODE)
            .open(&abs)
        {
            Ok(file) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                let path = self.request_path(&rel);
                self.handles.insert(fh, OpenFile { file, path });

                self.pay(Request::open(self.request_path(&rel), started));
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &KernelRequest<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let started = Instant::now();
        let Some(open) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let offset = u64::try_from(offset).unwrap_or(0);

        let mut buf = vec![0u8; size as usize];
        let result = (|| -> io::Result<usize> {
            let mut filled = 0;
            // read_at can return short; keep going until EOF or full.
            while filled < buf.len() {
                let n = open.file.read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(filled)
        })();

        match result {
            Ok(filled) => {
                buf.truncate(filled);
                let path = open.path.clone();
                self.pay(Request::read(path, offset, filled as u64, started));
                reply.data(&buf);
            }
            Err(err) => {
                warn!(target: TRACING_TARGET, ino, offset, size, error = %err, "read failed");
                reply.error(errno(&err));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &KernelRequest<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let started = Instant::now();
        let Some(open) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let offset = u64::try_from(offset).unwrap_or(0);

        match open.file.write_all_at(data, offset) {
            Ok(()) => {
                let path = open.path.clone();
                self.pay(Request::write(path, offset, data.len() as u64, started));
                reply.written(data.len() as u32);
            }
            Err(err) => {
                warn!(target: TRACING_TARGET, ino, offset, error = %err, "write failed");
                reply.error(errno(&err));
            }
        }
    }

    fn flush(
        &mut self,
        _req: &KernelRequest<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let started = Instant::now();
        if self.handles.contains_key(&fh) {
            self.pay(Request::metadata(started));
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    fn release(
        &mut self,
        _req: &KernelRequest<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let started = Instant::now();
        match self.handles.remove(&fh) {
            Some(open) => {
                // Dropping the File closes the backing fd.
                drop(open.file);
                self.pay(Request::close(open.path, started));
                reply.ok();
            }
            None => reply.error(libc::EBADF),
        }
    }

    fn fsync(
        &mut self,
        _req: &KernelRequest<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let started = Instant::now();
        let Some(open) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let result = if datasync {
            open.file.sync_data()
        } else {
            open.file.sync_all()
        };

        match result {
            Ok(()) => {
                let path = open.path.clone();
                self.pay(Request::fsync(path, started));
                reply.ok();
            }
            Err(err) => {
                warn!(target: TRACING_TARGET, ino, error = %err, "fsync failed");
                reply.error(errno(&err));
            }
        }
    }

    fn opendir(&mut self, _req: &KernelRequest<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let started = Instant::now();
        let Some(abs) = self.abs_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // Directories are enumerated per readdir call; opendir just checks
        // the directory is there.
        match std::fs::read_dir(abs) {
            Ok(_) => {
                self.pay(Request::metadata(started));
                reply.opened(0, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &KernelRequest<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let started = Instant::now();
        let Some(rel) = self.rel_path(ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        let abs = self.backing.join(&rel);

        let parent_ino = match rel.parent() {
            Some(parent) => self.ino_for_path(&parent.to_path_buf()),
            None => ROOT_INO,
        };

        let mut entries: Vec<(u64, FileType, std::ffi::OsString)> = vec![
            (ino, FileType::Directory, ".".into()),
            (parent_ino, FileType::Directory, "..".into()),
        ];

        let children = match std::fs::read_dir(&abs) {
            Ok(children) => children,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };
        for child in children.flatten() {
            let child_rel = rel.join(child.file_name());
            let kind = match child.file_type() {
                Ok(ft) if ft.is_dir() => FileType::Directory,
                Ok(ft) if ft.is_symlink() => FileType::Symlink,
                _ => FileType::RegularFile,
            };
            let child_ino = self.ino_for_path(&child_rel);
            entries.push((child_ino, kind, child.file_name()));
        }

        self.pay(Request::metadata(started));

        for (i, (child_ino, kind, name)) in entries
            .iter()
            .enumerate()
            .skip(offset.max(0) as usize)
        {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &KernelRequest<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        let started = Instant::now();
        // opendir hands out fh 0 and keeps no per-directory state, so there
        // is nothing to tear down; closing the directory still costs a
        // metadata op.
        self.pay(Request::metadata(started));
        reply.ok();
    }

    fn statfs(&mut self, _req: &KernelRequest<'_>, ino: u64, reply: ReplyStatfs) {
        let started = Instant::now();
        let Some(abs) = self.abs_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = (|| -> io::Result<libc::statvfs> {
            let c_path = cstring(&abs)?;
            let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
            if rc != 0 {
                return Err(last_os_error());
            }
            Ok(stat)
        })();

        match result {
            Ok(stat) => {
                self.pay(Request::metadata(started));
                reply.statfs(
                    stat.f_blocks,
                    stat.f_bfree,
                    stat.f_bavail,
                    stat.f_files,
                    stat.f_ffree,
                    stat.f_bsize as u32,
                    stat.f_namemax as u32,
                    stat.f_frsize as u32,
                );
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &KernelRequest<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let started = Instant::now();
        let Some(abs) = self.abs_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = (|| -> io::Result<()> {
            let c_path = cstring(&abs)?;
            let c_name = CString::new(name.as_bytes())
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
            let rc = unsafe {
                libc::lsetxattr(
                    c_path.as_ptr(),
                    c_name.as_ptr(),
                    value.as_ptr().cast(),
                    value.len(),
                    flags,
                )
            };
            if rc != 0 {
                return Err(last_os_error());
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.pay(Request::metadata(started));
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &KernelRequest<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let started = Instant::now();
        let Some(abs) = self.abs_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = (|| -> io::Result<Vec<u8>> {
            let c_path = cstring(&abs)?;
            let c_name = CString::new(name.as_bytes())
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
            let len = unsafe {
                libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
            };
            if len < 0 {
                return Err(last_os_error());
            }
            let mut buf = vec![0u8; len as usize];
            let len = unsafe {
                libc::lgetxattr(
                    c_path.as_ptr(),
                    c_name.as_ptr(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if len < 0 {
                return Err(last_os_error());
            }
            buf.truncate(len as usize);
            Ok(buf)
        })();

        match result {
            Ok(value) => {
                self.pay(Request::metadata(started));
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() <= size as usize {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn listxattr(&mut self, _req: &KernelRequest<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let started = Instant::now();
        let Some(abs) = self.abs_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = (|| -> io::Result<Vec<u8>> {
            let c_path = cstring(&abs)?;
            let len = unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
            if len < 0 {
                return Err(last_os_error());
            }
            let mut buf = vec![0u8; len as usize];
            let len =
                unsafe { libc::llistxattr(c_path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
            if len < 0 {
                return Err(last_os_error());
            }
            buf.truncate(len as usize);
            Ok(buf)
        })();

        match result {
            Ok(names) => {
                self.pay(Request::metadata(started));
                if size == 0 {
                    reply.size(names.len() as u32);
                } else if names.len() <= size as usize {
                    reply.data(&names);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn removexattr(
        &mut self,
        _req: &KernelRequest<'_>,
        ino: u64,
        name: &OsStr,
        reply: ReplyEmpty,
    ) {
        let started = Instant::now();
        let Some(abs) = self.abs_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = (|| -> io::Result<()> {
            let c_path = cstring(&abs)?;
            let c_name = CString::new(name.as_bytes())
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
            let rc = unsafe { libc::lremovexattr(c_path.as_ptr(), c_name.as_ptr()) };
            if rc != 0 {
                return Err(last_os_error());
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.pay(Request::metadata(started));
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn access(&mut self, _req: &KernelRequest<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let started = Instant::now();
        let Some(abs) = self.abs_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = (|| -> io::Result<()> {
            let c_path = cstring(&abs)?;
            let rc = unsafe { libc::access(c_path.as_ptr(), mask) };
            if rc != 0 {
                return Err(last_os_error());
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.pay(Request::metadata(started));
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn create(
        &mut self,
        _req: &KernelRequest<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let started = Instant::now();
        let Some(rel) = self.child_rel(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let abs = self.backing.join(&rel);

        let (read, write) = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => (true, false),
        };

        let result = OpenOptions::new()
            .read(read)
            .write(write)
            .create(true)
            .custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT))
            .mode(mode)
            .open(&abs);

        match result.and_then(|file| self.attr(&rel).map(|attr| (file, attr))) {
            Ok((file, attr)) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                let path = self.request_path(&rel);
                self.handles.insert(fh, OpenFile { file, path });

                self.pay(Request::open(self.request_path(&rel), started));
                reply.created(&ATTR_TTL, &attr, 0, fh, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn fallocate(
        &mut self,
        _req: &KernelRequest<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let started = Instant::now();
        let Some(open) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let result = (|| -> io::Result<()> {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::fallocate(open.file.as_raw_fd(), mode, offset, length) };
            if rc != 0 {
                return Err(last_os_error());
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                let path = open.path.clone();
                let offset = u64::try_from(offset).unwrap_or(0);
                let length = u64::try_from(length).unwrap_or(0);
                self.pay(Request::allocate(path, offset, length, started));
                reply.ok();
            }
            Err(err) => {
                warn!(target: TRACING_TARGET, ino, offset, length, error = %err, "fallocate failed");
                reply.error(errno(&err));
            }
        }
    }
}

// ── Mount entrypoints ───────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("molasses".to_owned()),
        MountOption::DefaultPermissions,
    ];

    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

/// Mount the filesystem at `mountpoint`, proxying to `backing`. Blocks until
/// the filesystem is unmounted.
pub fn mount(
    backing: impl Into<PathBuf>,
    mountpoint: impl AsRef<Path>,
    scheduler: Scheduler,
    options: &MountOptions,
) -> Result<(), MountError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(MountError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }

    let fs = MolassesFs::new(backing, scheduler);
    fuser::mount2(fs, mountpoint, &build_mount_options(options))?;
    Ok(())
}

/// Mount in the background, returning a session handle. The filesystem is
/// unmounted when the handle is dropped.
pub fn mount_background(
    backing: impl Into<PathBuf>,
    mountpoint: impl AsRef<Path>,
    scheduler: Scheduler,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, MountError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(MountError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }

    let fs = MolassesFs::new(backing, scheduler);
    let session = fuser::spawn_mount2(fs, mountpoint, &build_mount_options(options))?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    fn test_fs() -> (tempfile::TempDir, MolassesFs) {
        let backing = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(DeviceConfig::hdd7200rpm());
        let fs = MolassesFs::new(backing.path(), scheduler);
        (backing, fs)
    }

    #[tokio::test]
    async fn inode_table_reuses_inodes_per_path() {
        let (_backing, mut fs) = test_fs();

        let ino = fs.ino_for_path(Path::new("a.log"));
        assert_ne!(ino, ROOT_INO);
        assert_eq!(fs.ino_for_path(Path::new("a.log")), ino);
        assert_ne!(fs.ino_for_path(Path::new("b.log")), ino);
    }

    #[tokio::test]
    async fn rename_remaps_a_directory_and_its_children() {
        let (_backing, mut fs) = test_fs();

        let dir = fs.ino_for_path(Path::new("logs"));
        let file = fs.ino_for_path(Path::new("logs/a.log"));

        fs.rename_tracked(Path::new("logs"), Path::new("archive"));

        assert_eq!(fs.rel_path(dir), Some(&PathBuf::from("archive")));
        assert_eq!(fs.rel_path(file), Some(&PathBuf::from("archive/a.log")));
        assert_eq!(fs.ino_for_path(Path::new("archive/a.log")), file);
        assert_eq!(fs.rel_path(ROOT_INO), Some(&PathBuf::new()));
    }

    #[tokio::test]
    async fn rename_onto_an_existing_path_drops_the_old_entry() {
        let (_backing, mut fs) = test_fs();

        let old = fs.ino_for_path(Path::new("a.log"));
        let clobbered = fs.ino_for_path(Path::new("b.log"));

        fs.rename_tracked(Path::new("a.log"), Path::new("b.log"));

        assert_eq!(fs.rel_path(old), Some(&PathBuf::from("b.log")));
        assert_eq!(fs.rel_path(clobbered), None);
        assert_eq!(fs.ino_for_path(Path::new("b.log")), old);
    }

    #[tokio::test]
    async fn forgotten_paths_lose_their_inode() {
        let (_backing, mut fs) = test_fs();

        let ino = fs.ino_for_path(Path::new("a.log"));
        fs.forget_path(Path::new("a.log"));

        assert_eq!(fs.rel_path(ino), None);
        assert_ne!(fs.ino_for_path(Path::new("a.log")), ino);
    }
}
