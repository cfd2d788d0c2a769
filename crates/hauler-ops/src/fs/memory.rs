//! In-memory file system with volumes, capacity limits and fault injection.
//!
//! Used by the test suites to exercise the engine without touching a real
//! disk: a volume can be declared "network" to force the pipelined
//! strategy, a capacity turns writes past it into short writes (disk full),
//! and [`Fault`]s make individual calls fail.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;

use super::{
    DirEntry, EntryKind, FileHandle, FileMeta, FileSystem, FileTimes, OpenMode, Security,
    SecurityApplied, VolumeInfo, VolumeKind,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Calls a [`Fault`] can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Open,
    Read,
    Write,
    SetLen,
    Flush,
    Rename,
    Remove,
    SetTimes,
    SetSecurity,
    CreateDir,
    Streams,
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub struct Fault {
    op: FaultOp,
    path: PathBuf,
    min_offset: u64,
    kind: io::ErrorKind,
    remaining: usize,
}

impl Fault {
    /// Fail the next `op` on `path` once with a generic error.
    pub fn new(op: FaultOp, path: impl Into<PathBuf>) -> Self {
        Self {
            op,
            path: path.into(),
            min_offset: 0,
            kind: io::ErrorKind::Other,
            remaining: 1,
        }
    }

    /// Only fire for reads/writes reaching `offset` or beyond.
    pub fn at_offset(mut self, offset: u64) -> Self {
        self.min_offset = offset;
        self
    }

    pub fn kind(mut self, kind: io::ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Fire this many times.
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = n;
        self
    }
}

/// Declaration of a volume mounted at a path prefix.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    prefix: PathBuf,
    kind: VolumeKind,
    capacity: Option<u64>,
    streams: bool,
    compression: bool,
    encryption: bool,
    security: bool,
}

impl VolumeSpec {
    pub fn new(prefix: impl Into<PathBuf>, kind: VolumeKind) -> Self {
        Self {
            prefix: prefix.into(),
            kind,
            capacity: None,
            streams: true,
            compression: false,
            encryption: false,
            security: true,
        }
    }

    /// Limit the bytes stored on the volume.
    pub fn capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn streams(mut self, supported: bool) -> Self {
        self.streams = supported;
        self
    }

    pub fn compression(mut self, supported: bool) -> Self {
        self.compression = supported;
        self
    }

    pub fn encryption(mut self, supported: bool) -> Self {
        self.encryption = supported;
        self
    }

    pub fn security(mut self, supported: bool) -> Self {
        self.security = supported;
        self
    }
}

#[derive(Debug)]
struct Volume {
    id: u64,
    spec: VolumeSpec,
    usage: Mutex<Usage>,
}

#[derive(Debug)]
struct Usage {
    used: u64,
    capacity: Option<u64>,
}

impl Volume {
    /// Reserve up to `want` more bytes; returns what was granted.
    fn grow(&self, want: u64) -> u64 {
        let mut usage = lock(&self.usage);
        let granted = match usage.capacity {
            Some(cap) => want.min(cap.saturating_sub(usage.used)),
            None => want,
        };
        usage.used += granted;
        granted
    }

    fn shrink(&self, by: u64) {
        let mut usage = lock(&self.usage);
        usage.used = usage.used.saturating_sub(by);
    }

    fn free(&self) -> Option<u64> {
        let usage = lock(&self.usage);
        usage.capacity.map(|c| c.saturating_sub(usage.used))
    }
}

#[derive(Debug)]
struct FileData {
    id: u64,
    bytes: Vec<u8>,
    readonly: bool,
    compressed: bool,
    encrypted: bool,
    modified: SystemTime,
    accessed: SystemTime,
    created: SystemTime,
    security: Security,
    streams: BTreeMap<String, Arc<Mutex<FileData>>>,
}

impl FileData {
    fn new(id: u64, bytes: Vec<u8>) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            bytes,
            readonly: false,
            compressed: false,
            encrypted: false,
            modified: now,
            accessed: now,
            created: now,
            security: Security {
                mode: 0o644,
                uid: Some(1000),
                gid: Some(1000),
            },
            streams: BTreeMap::new(),
        }
    }

    fn stored_len(&self) -> u64 {
        self.bytes.len() as u64
            + self
                .streams
                .values()
                .map(|s| lock(s).bytes.len() as u64)
                .sum::<u64>()
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(Arc<Mutex<FileData>>),
    Dir(Arc<Mutex<FileData>>),
    Symlink { target: PathBuf, to_dir: bool },
}

#[derive(Debug)]
struct Shared {
    faults: Mutex<Vec<Fault>>,
    inline: AtomicBool,
    owner_changes_allowed: AtomicBool,
}

impl Shared {
    fn check(&self, op: FaultOp, path: &Path, end_offset: u64) -> io::Result<()> {
        let mut faults = lock(&self.faults);
        if let Some(fault) = faults.iter_mut().find(|f| {
            f.op == op && f.path == path && f.remaining > 0 && end_offset >= f.min_offset
        }) {
            fault.remaining -= 1;
            return Err(io::Error::new(
                fault.kind,
                format!("injected {op:?} fault on {}", path.display()),
            ));
        }
        Ok(())
    }
}

/// In-memory [`FileSystem`].
#[derive(Debug, Clone)]
pub struct MemFs {
    nodes: Arc<RwLock<HashMap<PathBuf, Node>>>,
    volumes: Arc<RwLock<Vec<Arc<Volume>>>>,
    trash: Arc<Mutex<Vec<PathBuf>>>,
    shared: Arc<Shared>,
    next_id: Arc<AtomicU64>,
}

impl MemFs {
    /// Create a file system holding only `/` on an unlimited fast volume.
    pub fn new() -> Self {
        let fs = Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            volumes: Arc::new(RwLock::new(Vec::new())),
            trash: Arc::new(Mutex::new(Vec::new())),
            shared: Arc::new(Shared {
                faults: Mutex::new(Vec::new()),
                inline: AtomicBool::new(true),
                owner_changes_allowed: AtomicBool::new(true),
            }),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        fs.add_volume(VolumeSpec::new("/", VolumeKind::Fast));
        let root = fs.new_data(Vec::new());
        fs.write_nodes().insert(PathBuf::from("/"), Node::Dir(root));
        fs
    }

    fn read_nodes(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PathBuf, Node>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_nodes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PathBuf, Node>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_data(&self, bytes: Vec<u8>) -> Arc<Mutex<FileData>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Arc::new(Mutex::new(FileData::new(id, bytes)))
    }

    /// Mount a volume; the longest matching prefix wins.
    pub fn add_volume(&self, spec: VolumeSpec) {
        let mut volumes = self.volumes.write().unwrap_or_else(PoisonError::into_inner);
        let id = volumes.len() as u64 + 1;
        volumes.push(Arc::new(Volume {
            id,
            usage: Mutex::new(Usage {
                used: 0,
                capacity: spec.capacity,
            }),
            spec,
        }));
    }

    /// Change a volume's capacity (None = unlimited).
    pub fn set_capacity(&self, prefix: impl AsRef<Path>, capacity: Option<u64>) {
        let volumes = self.volumes.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = volumes.iter().find(|v| v.spec.prefix == prefix.as_ref()) {
            lock(&v.usage).capacity = capacity;
        }
    }

    fn volume_of(&self, path: &Path) -> Arc<Volume> {
        let volumes = self.volumes.read().unwrap_or_else(PoisonError::into_inner);
        volumes
            .iter()
            .filter(|v| path.starts_with(&v.spec.prefix))
            .max_by_key(|v| v.spec.prefix.components().count())
            .or_else(|| volumes.first())
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(Volume {
                    id: 0,
                    spec: VolumeSpec::new("/", VolumeKind::Fast),
                    usage: Mutex::new(Usage {
                        used: 0,
                        capacity: None,
                    }),
                })
            })
    }

    /// Complete I/O requests inline (true) or on the blocking pool (false).
    pub fn set_inline_completion(&self, inline: bool) {
        self.shared.inline.store(inline, Ordering::SeqCst);
    }

    /// Allow or refuse owner changes in `set_security`.
    pub fn set_owner_changes_allowed(&self, allowed: bool) {
        self.shared
            .owner_changes_allowed
            .store(allowed, Ordering::SeqCst);
    }

    /// Schedule a failure.
    pub fn inject(&self, fault: Fault) {
        lock(&self.shared.faults).push(fault);
    }

    /// Drop all scheduled failures.
    pub fn clear_faults(&self) {
        lock(&self.shared.faults).clear();
    }

    fn ensure_parents(&self, path: &Path) {
        let mut missing = Vec::new();
        let mut cur = path.parent();
        {
            let nodes = self.read_nodes();
            while let Some(p) = cur {
                if nodes.contains_key(p) {
                    break;
                }
                missing.push(p.to_path_buf());
                cur = p.parent();
            }
        }
        for dir in missing.into_iter().rev() {
            let data = self.new_data(Vec::new());
            self.write_nodes().insert(dir, Node::Dir(data));
        }
    }

    /// Create (or replace) a file with the given content and parents.
    pub fn add_file(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        let path = path.into();
        self.ensure_parents(&path);
        let bytes = data.into();
        self.volume_of(&path).grow(bytes.len() as u64);
        let node = Node::File(self.new_data(bytes));
        self.write_nodes().insert(path, node);
    }

    /// Create a directory and its parents.
    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        if self.read_nodes().contains_key(&path) {
            return;
        }
        self.ensure_parents(&path);
        let node = Node::Dir(self.new_data(Vec::new()));
        self.write_nodes().insert(path, node);
    }

    /// Create a symbolic link.
    pub fn add_symlink(&self, path: impl Into<PathBuf>, target: impl Into<PathBuf>, to_dir: bool) {
        let path = path.into();
        self.ensure_parents(&path);
        self.write_nodes().insert(
            path,
            Node::Symlink {
                target: target.into(),
                to_dir,
            },
        );
    }

    /// Attach an alternate stream to an existing file.
    pub fn add_stream(&self, path: &Path, name: &str, data: impl Into<Vec<u8>>) -> io::Result<()> {
        let file = self.data_of(path)?;
        let bytes = data.into();
        self.volume_of(path).grow(bytes.len() as u64);
        let stream = self.new_data(bytes);
        lock(&file).streams.insert(name.to_string(), stream);
        Ok(())
    }

    /// Content of a file.
    pub fn get_data(&self, path: &Path) -> Option<Vec<u8>> {
        match self.read_nodes().get(path) {
            Some(Node::File(data)) => Some(lock(data).bytes.clone()),
            _ => None,
        }
    }

    /// Content of an alternate stream.
    pub fn get_stream(&self, path: &Path, name: &str) -> Option<Vec<u8>> {
        let file = self.data_of(path).ok()?;
        let file = lock(&file);
        file.streams.get(name).map(|s| lock(s).bytes.clone())
    }

    /// Paths moved to the trash so far.
    pub fn trashed(&self) -> Vec<PathBuf> {
        lock(&self.trash).clone()
    }

    /// All paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.read_nodes().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn node(&self, path: &Path) -> io::Result<Node> {
        self.read_nodes()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn resolve(&self, path: &Path) -> io::Result<(PathBuf, Node)> {
        let mut path = path.to_path_buf();
        for _ in 0..8 {
            match self.node(&path)? {
                Node::Symlink { target, .. } => path = target,
                node => return Ok((path, node)),
            }
        }
        Err(io::Error::other("too many levels of symbolic links"))
    }

    fn data_of(&self, path: &Path) -> io::Result<Arc<Mutex<FileData>>> {
        match self.resolve(path)?.1 {
            Node::File(data) | Node::Dir(data) => Ok(data),
            Node::Symlink { .. } => Err(io::Error::other("unresolved link")),
        }
    }

    fn meta_of(&self, path: &Path, node: &Node) -> FileMeta {
        let volume = self.volume_of(path).id;
        match node {
            Node::File(data) | Node::Dir(data) => {
                let d = lock(data);
                FileMeta {
                    kind: if matches!(node, Node::Dir(_)) {
                        EntryKind::Dir
                    } else {
                        EntryKind::File
                    },
                    len: d.bytes.len() as u64,
                    readonly: d.readonly,
                    compressed: d.compressed,
                    encrypted: d.encrypted,
                    modified: d.modified,
                    accessed: d.accessed,
                    created: Some(d.created),
                    volume,
                    file_id: d.id,
                }
            }
            Node::Symlink { to_dir, .. } => FileMeta {
                kind: EntryKind::Symlink { to_dir: *to_dir },
                len: 0,
                readonly: false,
                compressed: false,
                encrypted: false,
                modified: SystemTime::UNIX_EPOCH,
                accessed: SystemTime::UNIX_EPOCH,
                created: None,
                volume,
                file_id: 0,
            },
        }
    }

    fn parent_is_dir(&self, path: &Path) -> io::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no parent"))?;
        match self.resolve(parent)?.1 {
            Node::Dir(_) => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                parent.display().to_string(),
            )),
        }
    }

    fn handle(&self, path: &Path, data: Arc<Mutex<FileData>>) -> Arc<dyn FileHandle> {
        Arc::new(MemHandle {
            path: path.to_path_buf(),
            data,
            volume: self.volume_of(path),
            shared: Arc::clone(&self.shared),
        })
    }

    fn children(&self, path: &Path) -> Vec<PathBuf> {
        self.read_nodes()
            .keys()
            .filter(|p| p.parent() == Some(path) && p.as_path() != path)
            .cloned()
            .collect()
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct MemHandle {
    path: PathBuf,
    data: Arc<Mutex<FileData>>,
    volume: Arc<Volume>,
    shared: Arc<Shared>,
}

impl FileHandle for MemHandle {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.shared
            .check(FaultOp::Read, &self.path, offset + buf.len() as u64)?;
        let data = lock(&self.data);
        let len = data.bytes.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(data.bytes.len() - start);
        buf[..n].copy_from_slice(&data.bytes[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.shared
            .check(FaultOp::Write, &self.path, offset + buf.len() as u64)?;
        let mut data = lock(&self.data);
        let cur = data.bytes.len() as u64;
        let end = offset + buf.len() as u64;
        let growth = end.saturating_sub(cur.max(offset));
        let gap = offset.saturating_sub(cur);
        let granted = self.volume.grow(growth + gap);
        if granted < gap {
            self.volume.shrink(granted);
            return Ok(0);
        }
        let writable = (buf.len() as u64).min(cur.saturating_sub(offset) + (granted - gap)) as usize;
        let new_len = (offset as usize + writable).max(data.bytes.len());
        data.bytes.resize(new_len, 0);
        let start = offset as usize;
        data.bytes[start..start + writable].copy_from_slice(&buf[..writable]);
        data.modified = SystemTime::now();
        Ok(writable)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(lock(&self.data).bytes.len() as u64)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.shared.check(FaultOp::SetLen, &self.path, len)?;
        let mut data = lock(&self.data);
        let cur = data.bytes.len() as u64;
        if len > cur {
            let granted = self.volume.grow(len - cur);
            if granted < len - cur {
                self.volume.shrink(granted);
                return Err(super::disk_full(&self.path));
            }
        } else {
            self.volume.shrink(cur - len);
        }
        data.bytes.resize(len as usize, 0);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.shared.check(FaultOp::Flush, &self.path, 0)
    }

    fn completes_inline(&self) -> bool {
        self.shared.inline.load(Ordering::SeqCst)
    }
}

impl FileSystem for MemFs {
    fn metadata(&self, path: &Path) -> io::Result<FileMeta> {
        let (resolved, node) = self.resolve(path)?;
        Ok(self.meta_of(&resolved, &node))
    }

    fn symlink_metadata(&self, path: &Path) -> io::Result<FileMeta> {
        let node = self.node(path)?;
        Ok(self.meta_of(path, &node))
    }

    fn open_read(&self, path: &Path) -> io::Result<Arc<dyn FileHandle>> {
        self.shared.check(FaultOp::Open, path, 0)?;
        match self.resolve(path)?.1 {
            Node::File(data) => Ok(self.handle(path, data)),
            _ => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                path.display().to_string(),
            )),
        }
    }

    fn open_write(&self, path: &Path, mode: OpenMode) -> io::Result<Arc<dyn FileHandle>> {
        self.shared.check(FaultOp::Open, path, 0)?;
        self.parent_is_dir(path)?;
        let existing = self.read_nodes().get(path).cloned();
        match (existing, mode) {
            (Some(Node::File(_)), OpenMode::CreateNew) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                path.display().to_string(),
            )),
            (Some(Node::File(data)), OpenMode::Existing) => Ok(self.handle(path, data)),
            (Some(Node::File(data)), OpenMode::Truncate) => {
                {
                    let mut d = lock(&data);
                    if d.readonly {
                        return Err(io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            path.display().to_string(),
                        ));
                    }
                    self.volume_of(path).shrink(d.bytes.len() as u64);
                    d.bytes.clear();
                }
                Ok(self.handle(path, data))
            }
            (Some(_), _) => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                path.display().to_string(),
            )),
            (None, OpenMode::Existing) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                path.display().to_string(),
            )),
            (None, _) => {
                let data = self.new_data(Vec::new());
                self.write_nodes()
                    .insert(path.to_path_buf(), Node::File(Arc::clone(&data)));
                Ok(self.handle(path, data))
            }
        }
    }

    fn set_times(&self, path: &Path, times: FileTimes) -> io::Result<()> {
        self.shared.check(FaultOp::SetTimes, path, 0)?;
        let data = self.data_of(path)?;
        let mut d = lock(&data);
        if let Some(t) = times.modified {
            d.modified = t;
        }
        if let Some(t) = times.accessed {
            d.accessed = t;
        }
        if let Some(t) = times.created {
            d.created = t;
        }
        Ok(())
    }

    fn set_readonly(&self, path: &Path, readonly: bool) -> io::Result<()> {
        let data = self.data_of(path)?;
        lock(&data).readonly = readonly;
        Ok(())
    }

    fn security(&self, path: &Path) -> io::Result<Security> {
        let data = self.data_of(path)?;
        let security = lock(&data).security;
        Ok(security)
    }

    fn set_security(&self, path: &Path, security: &Security) -> io::Result<SecurityApplied> {
        self.shared.check(FaultOp::SetSecurity, path, 0)?;
        if !self.volume_of(path).spec.security {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "volume has no permissions",
            ));
        }
        let data = self.data_of(path)?;
        let mut d = lock(&data);
        d.security.mode = security.mode;
        let owner = self.shared.owner_changes_allowed.load(Ordering::SeqCst);
        if owner {
            d.security.uid = security.uid;
            d.security.gid = security.gid;
        }
        Ok(SecurityApplied { mode: true, owner })
    }

    fn list_streams(&self, path: &Path) -> io::Result<Vec<String>> {
        self.shared.check(FaultOp::Streams, path, 0)?;
        let data = self.data_of(path)?;
        let names = lock(&data).streams.keys().cloned().collect();
        Ok(names)
    }

    fn open_stream_read(&self, path: &Path, name: &str) -> io::Result<Arc<dyn FileHandle>> {
        let data = self.data_of(path)?;
        let stream = lock(&data)
            .streams
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))?;
        Ok(self.handle(path, stream))
    }

    fn create_stream(&self, path: &Path, name: &str) -> io::Result<Arc<dyn FileHandle>> {
        self.shared.check(FaultOp::Streams, path, 0)?;
        if !self.volume_of(path).spec.streams {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "volume has no alternate streams",
            ));
        }
        let data = self.data_of(path)?;
        let stream = self.new_data(Vec::new());
        if let Some(old) = lock(&data)
            .streams
            .insert(name.to_string(), Arc::clone(&stream))
        {
            self.volume_of(path).shrink(lock(&old).bytes.len() as u64);
        }
        Ok(self.handle(path, stream))
    }

    fn remove_stream(&self, path: &Path, name: &str) -> io::Result<()> {
        let data = self.data_of(path)?;
        if let Some(old) = lock(&data).streams.remove(name) {
            self.volume_of(path).shrink(lock(&old).bytes.len() as u64);
        }
        Ok(())
    }

    fn set_compressed(&self, path: &Path, compressed: bool) -> io::Result<()> {
        if !self.volume_of(path).spec.compression {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "volume does not support compression",
            ));
        }
        let data = self.data_of(path)?;
        lock(&data).compressed = compressed;
        Ok(())
    }

    fn set_encrypted(&self, path: &Path, encrypted: bool) -> io::Result<()> {
        if !self.volume_of(path).spec.encryption {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "volume does not support encryption",
            ));
        }
        let data = self.data_of(path)?;
        lock(&data).encrypted = encrypted;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.shared.check(FaultOp::Rename, from, 0)?;
        let from_volume = self.volume_of(from);
        let to_volume = self.volume_of(to);
        if from_volume.id != to_volume.id {
            return Err(io::Error::new(
                io::ErrorKind::CrossesDevices,
                "rename across volumes",
            ));
        }
        let node = self.node(from)?;
        if let Node::File(data) | Node::Dir(data) = &node {
            if lock(data).readonly {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    from.display().to_string(),
                ));
            }
        }
        self.parent_is_dir(to)?;

        let mut nodes = self.write_nodes();
        match nodes.get(to) {
            Some(Node::File(old)) if !matches!(node, Node::Dir(_)) => {
                let len = lock(old).stored_len();
                to_volume.shrink(len);
            }
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    to.display().to_string(),
                ));
            }
            None => {}
        }

        let moved: Vec<PathBuf> = nodes
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(n) = nodes.remove(&old) {
                let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
                let new = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                nodes.insert(new, n);
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.shared.check(FaultOp::Remove, path, 0)?;
        match self.node(path)? {
            Node::File(data) => {
                let d = lock(&data);
                if d.readonly {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        path.display().to_string(),
                    ));
                }
                self.volume_of(path).shrink(d.stored_len());
            }
            Node::Symlink { .. } => {}
            Node::Dir(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::IsADirectory,
                    path.display().to_string(),
                ));
            }
        }
        self.write_nodes().remove(path);
        Ok(())
    }

    fn remove_file_to_trash(&self, path: &Path) -> io::Result<()> {
        self.remove_file(path)?;
        lock(&self.trash).push(path.to_path_buf());
        Ok(())
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.shared.check(FaultOp::CreateDir, path, 0)?;
        self.parent_is_dir(path)?;
        if self.read_nodes().contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                path.display().to_string(),
            ));
        }
        let node = Node::Dir(self.new_data(Vec::new()));
        self.write_nodes().insert(path.to_path_buf(), node);
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.shared.check(FaultOp::Remove, path, 0)?;
        match self.node(path)? {
            Node::Dir(data) => {
                if lock(&data).readonly {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        path.display().to_string(),
                    ));
                }
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    path.display().to_string(),
                ));
            }
        }
        if !self.children(path).is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::DirectoryNotEmpty,
                path.display().to_string(),
            ));
        }
        self.write_nodes().remove(path);
        Ok(())
    }

    fn remove_dir_link(&self, path: &Path) -> io::Result<()> {
        self.shared.check(FaultOp::Remove, path, 0)?;
        match self.node(path)? {
            Node::Symlink { to_dir: true, .. } => {
                self.write_nodes().remove(path);
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory link", path.display()),
            )),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let (resolved, node) = self.resolve(path)?;
        if !matches!(node, Node::Dir(_)) {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                path.display().to_string(),
            ));
        }
        let mut children = self.children(&resolved);
        children.sort();
        children
            .into_iter()
            .map(|child| {
                let node = self.node(&child)?;
                Ok(DirEntry {
                    name: child.file_name().map(|n| n.to_os_string()).unwrap_or_default(),
                    meta: self.meta_of(&child, &node),
                })
            })
            .collect()
    }

    fn volume_info(&self, path: &Path) -> io::Result<VolumeInfo> {
        let volume = self.volume_of(path);
        Ok(VolumeInfo {
            id: volume.id,
            kind: volume.spec.kind,
            free_space: volume.free(),
            supports_streams: volume.spec.streams,
            supports_compression: volume.spec.compression,
            supports_encryption: volume.spec.encryption,
            supports_security: volume.spec.security,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_read() {
        let fs = MemFs::new();
        fs.add_file("/a/b/c.txt", b"data".to_vec());
        assert!(fs.metadata(Path::new("/a/b")).unwrap().is_dir());
        assert_eq!(fs.metadata(Path::new("/a/b/c.txt")).unwrap().len, 4);
        assert_eq!(fs.read_dir(Path::new("/a")).unwrap().len(), 1);
    }

    #[test]
    fn test_capacity_short_write() {
        let fs = MemFs::new();
        fs.add_volume(VolumeSpec::new("/vol", VolumeKind::Fast).capacity(10));
        fs.add_dir("/vol");
        let h = fs
            .open_write(Path::new("/vol/f"), OpenMode::CreateNew)
            .unwrap();
        assert_eq!(h.write_at(&[1; 8], 0).unwrap(), 8);
        assert_eq!(h.write_at(&[2; 8], 8).unwrap(), 2);
        // Overwriting inside the file needs no space.
        assert_eq!(h.write_at(&[3; 4], 0).unwrap(), 4);

        fs.set_capacity("/vol", Some(100));
        assert_eq!(h.write_at(&[4; 8], 10).unwrap(), 8);
        assert_eq!(fs.volume_info(Path::new("/vol/f")).unwrap().free_space, Some(82));
    }

    #[test]
    fn test_fault_fires_once() {
        let fs = MemFs::new();
        fs.add_file("/f", vec![0; 100]);
        fs.inject(Fault::new(FaultOp::Read, "/f").at_offset(50));
        let h = fs.open_read(Path::new("/f")).unwrap();
        let mut buf = [0; 10];
        assert!(h.read_at(&mut buf, 0).is_ok());
        assert!(h.read_at(&mut buf, 45).is_err());
        assert!(h.read_at(&mut buf, 45).is_ok());
    }

    #[test]
    fn test_rename_moves_subtree() {
        let fs = MemFs::new();
        fs.add_file("/src/d/x", b"x".to_vec());
        fs.add_dir("/dst");
        fs.rename(Path::new("/src/d"), Path::new("/dst/d")).unwrap();
        assert_eq!(fs.get_data(Path::new("/dst/d/x")), Some(b"x".to_vec()));
        assert!(!fs.exists(Path::new("/src/d")));
    }

    #[test]
    fn test_rename_across_volumes_fails() {
        let fs = MemFs::new();
        fs.add_volume(VolumeSpec::new("/net", VolumeKind::Network));
        fs.add_file("/a", b"x".to_vec());
        fs.add_dir("/net");
        let err = fs.rename(Path::new("/a"), Path::new("/net/a")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::CrossesDevices);
    }

    #[test]
    fn test_readonly_blocks_remove() {
        let fs = MemFs::new();
        fs.add_file("/f", b"x".to_vec());
        fs.set_readonly(Path::new("/f"), true).unwrap();
        assert_eq!(
            fs.remove_file(Path::new("/f")).unwrap_err().kind(),
            io::ErrorKind::PermissionDenied
        );
        fs.set_readonly(Path::new("/f"), false).unwrap();
        fs.remove_file(Path::new("/f")).unwrap();
    }

    #[test]
    fn test_remove_dir_not_empty() {
        let fs = MemFs::new();
        fs.add_file("/d/f", b"x".to_vec());
        assert_eq!(
            fs.remove_dir(Path::new("/d")).unwrap_err().kind(),
            io::ErrorKind::DirectoryNotEmpty
        );
    }

    #[test]
    fn test_streams() {
        let fs = MemFs::new();
        fs.add_file("/f", b"x".to_vec());
        fs.add_stream(Path::new("/f"), "meta", b"tag".to_vec())
            .unwrap();
        assert_eq!(fs.list_streams(Path::new("/f")).unwrap(), vec!["meta"]);
        assert_eq!(fs.get_stream(Path::new("/f"), "meta"), Some(b"tag".to_vec()));
    }
}
