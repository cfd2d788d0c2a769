//! File-system boundary consumed by the engine.
//!
//! The engine never touches `std::fs` directly: everything goes through
//! [`FileSystem`] and [`FileHandle`], implemented by [`LocalFs`] for real
//! disks and [`MemFs`] for tests and fault injection.

mod local;
mod memory;

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

pub use local::LocalFs;
pub use memory::{Fault, FaultOp, MemFs, VolumeSpec};

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
    /// Symbolic link; `to_dir` when it points at a directory.
    Symlink { to_dir: bool },
}

/// Metadata the engine needs about a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub kind: EntryKind,
    pub len: u64,
    pub readonly: bool,
    pub compressed: bool,
    pub encrypted: bool,
    pub modified: SystemTime,
    pub accessed: SystemTime,
    pub created: Option<SystemTime>,
    /// Volume (device) identifier.
    pub volume: u64,
    /// File identifier within the volume (inode).
    pub file_id: u64,
}

impl FileMeta {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink { .. })
    }

    /// Same underlying file (hard link or case-only rename).
    pub fn same_file(&self, other: &FileMeta) -> bool {
        self.volume == other.volume && self.file_id == other.file_id
    }

    pub fn times(&self) -> FileTimes {
        FileTimes {
            modified: Some(self.modified),
            accessed: Some(self.accessed),
            created: self.created,
        }
    }
}

/// Timestamps to apply; `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTimes {
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

/// Ownership and permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Security {
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Which parts of a [`Security`] were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityApplied {
    pub mode: bool,
    pub owner: bool,
}

impl SecurityApplied {
    pub fn is_complete(&self) -> bool {
        self.mode && self.owner
    }
}

/// Media class of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeKind {
    Network,
    /// Local disk, SSD, USB disk, optical or RAM disk.
    Fast,
    /// Floppy-class media.
    Removable,
}

/// Capabilities and state of the volume holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub id: u64,
    pub kind: VolumeKind,
    pub free_space: Option<u64>,
    pub supports_streams: bool,
    pub supports_compression: bool,
    pub supports_encryption: bool,
    pub supports_security: bool,
}

/// How to open a file for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if it exists.
    CreateNew,
    /// Create or truncate.
    Truncate,
    /// Open an existing file without truncating (resume).
    Existing,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub meta: FileMeta,
}

/// An open file (or alternate stream) supporting positioned I/O.
pub trait FileHandle: Send + Sync + std::fmt::Debug {
    /// Read up to `buf.len()` bytes at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    /// Write up to `buf.len()` bytes at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
    /// Authoritative current length.
    fn size(&self) -> io::Result<u64>;
    fn set_len(&self, len: u64) -> io::Result<()>;
    /// Make written data durable.
    fn flush(&self) -> io::Result<()>;
    /// Requests on this handle complete inside the issuing call.
    fn completes_inline(&self) -> bool {
        false
    }
}

/// Read until `buf` is full or end of file.
pub fn read_full_at(handle: &dyn FileHandle, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match handle.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Write all of `buf`; a short count means the device is full.
pub fn write_full_at(handle: &dyn FileHandle, buf: &[u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match handle.write_at(&buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Error reported for a short write.
pub fn disk_full(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::StorageFull,
        format!("not enough space to write {}", path.display()),
    )
}

/// Outcome of an overlapped request: the buffer comes back with the result.
#[derive(Debug)]
pub struct IoCompletion {
    pub buf: Vec<u8>,
    pub result: io::Result<usize>,
}

/// An overlapped read or write.
#[derive(Debug)]
pub enum IoRequest {
    /// Completed inside the issuing call.
    Ready(IoCompletion),
    /// Running on the blocking pool.
    Pending(JoinHandle<IoCompletion>),
}

impl IoRequest {
    /// Completed already (non-blocking).
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Ready(_) => true,
            Self::Pending(handle) => handle.is_finished(),
        }
    }

    pub fn completed_inline(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Wait for the request to finish.
    pub async fn wait(self) -> IoCompletion {
        match self {
            Self::Ready(done) => done,
            Self::Pending(handle) => match handle.await {
                Ok(done) => done,
                Err(e) => IoCompletion {
                    buf: Vec::new(),
                    result: Err(io::Error::other(format!("I/O task failed: {e}"))),
                },
            },
        }
    }
}

/// Start reading `len` bytes at `offset` into `buf`.
pub fn begin_read(
    handle: &Arc<dyn FileHandle>,
    mut buf: Vec<u8>,
    len: usize,
    offset: u64,
) -> IoRequest {
    buf.resize(len, 0);
    if handle.completes_inline() {
        let result = read_full_at(handle.as_ref(), &mut buf[..len], offset);
        return IoRequest::Ready(IoCompletion { buf, result });
    }
    let handle = Arc::clone(handle);
    IoRequest::Pending(tokio::task::spawn_blocking(move || {
        let result = read_full_at(handle.as_ref(), &mut buf[..len], offset);
        IoCompletion { buf, result }
    }))
}

/// Start writing the first `len` bytes of `buf` at `offset`.
pub fn begin_write(handle: &Arc<dyn FileHandle>, buf: Vec<u8>, len: usize, offset: u64) -> IoRequest {
    let len = len.min(buf.len());
    if handle.completes_inline() {
        let result = write_full_at(handle.as_ref(), &buf[..len], offset);
        return IoRequest::Ready(IoCompletion { buf, result });
    }
    let handle = Arc::clone(handle);
    IoRequest::Pending(tokio::task::spawn_blocking(move || {
        let result = write_full_at(handle.as_ref(), &buf[..len], offset);
        IoCompletion { buf, result }
    }))
}

/// Operations the engine performs on a file system.
pub trait FileSystem: Send + Sync + std::fmt::Debug {
    /// Metadata following symlinks.
    fn metadata(&self, path: &Path) -> io::Result<FileMeta>;
    /// Metadata of the path itself.
    fn symlink_metadata(&self, path: &Path) -> io::Result<FileMeta>;

    fn open_read(&self, path: &Path) -> io::Result<Arc<dyn FileHandle>>;
    fn open_write(&self, path: &Path, mode: OpenMode) -> io::Result<Arc<dyn FileHandle>>;

    fn set_times(&self, path: &Path, times: FileTimes) -> io::Result<()>;
    fn set_readonly(&self, path: &Path, readonly: bool) -> io::Result<()>;

    fn security(&self, path: &Path) -> io::Result<Security>;
    /// Apply as much of `security` as permitted.
    fn set_security(&self, path: &Path, security: &Security) -> io::Result<SecurityApplied>;

    /// Names of the alternate data streams of `path`.
    fn list_streams(&self, path: &Path) -> io::Result<Vec<String>>;
    fn open_stream_read(&self, path: &Path, name: &str) -> io::Result<Arc<dyn FileHandle>>;
    fn create_stream(&self, path: &Path, name: &str) -> io::Result<Arc<dyn FileHandle>>;
    fn remove_stream(&self, path: &Path, name: &str) -> io::Result<()>;

    fn set_compressed(&self, path: &Path, compressed: bool) -> io::Result<()>;
    fn set_encrypted(&self, path: &Path, encrypted: bool) -> io::Result<()>;

    /// Rename within a volume; fails with `CrossesDevices` otherwise.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn remove_file_to_trash(&self, path: &Path) -> io::Result<()>;
    fn create_dir(&self, path: &Path) -> io::Result<()>;
    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
    /// Remove a directory link without touching its target.
    fn remove_dir_link(&self, path: &Path) -> io::Result<()>;
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    fn volume_info(&self, path: &Path) -> io::Result<VolumeInfo>;

    /// Whether `path` exists (without following a final symlink).
    fn exists(&self, path: &Path) -> bool {
        self.symlink_metadata(path).is_ok()
    }
}
