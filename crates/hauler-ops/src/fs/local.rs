//! [`FileSystem`] backed by the local disks.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use filetime::FileTime;
use sysinfo::Disks;
use tracing::debug;

use super::{
    DirEntry, EntryKind, FileHandle, FileMeta, FileSystem, FileTimes, OpenMode, Security,
    SecurityApplied, VolumeInfo, VolumeKind,
};

/// Extended-attribute namespace holding alternate streams.
#[cfg(unix)]
const STREAM_PREFIX: &str = "user.";

/// The real file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

fn to_meta(meta: &fs::Metadata, kind: EntryKind) -> FileMeta {
    #[cfg(unix)]
    let (volume, file_id) = {
        use std::os::unix::fs::MetadataExt;
        (meta.dev(), meta.ino())
    };
    #[cfg(not(unix))]
    let (volume, file_id) = (0, 0);

    let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
    FileMeta {
        kind,
        len: meta.len(),
        readonly: meta.permissions().readonly(),
        compressed: false,
        encrypted: false,
        modified,
        accessed: meta.accessed().unwrap_or(modified),
        created: meta.created().ok(),
        volume,
        file_id,
    }
}

fn kind_of(path: &Path, meta: &fs::Metadata) -> EntryKind {
    if meta.file_type().is_symlink() {
        let to_dir = fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false);
        EntryKind::Symlink { to_dir }
    } else if meta.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::File
    }
}

#[derive(Debug)]
struct LocalHandle {
    file: File,
}

impl FileHandle for LocalHandle {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
        }
        #[cfg(windows)]
        {
            std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::write_at(&self.file, buf, offset)
        }
        #[cfg(windows)]
        {
            std::os::windows::fs::FileExt::seek_write(&self.file, buf, offset)
        }
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// An alternate stream held in memory and stored as an extended attribute
/// on flush.
#[cfg(unix)]
#[derive(Debug)]
struct XattrStream {
    path: PathBuf,
    key: String,
    data: Mutex<Vec<u8>>,
}

#[cfg(unix)]
impl FileHandle for XattrStream {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.lock().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(len as usize, 0);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        xattr::set(&self.path, &self.key, data.as_slice())
    }

    fn completes_inline(&self) -> bool {
        true
    }
}

fn unsupported(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, format!("{what} not supported"))
}

impl FileSystem for LocalFs {
    fn metadata(&self, path: &Path) -> io::Result<FileMeta> {
        let meta = fs::metadata(path)?;
        let kind = if meta.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        Ok(to_meta(&meta, kind))
    }

    fn symlink_metadata(&self, path: &Path) -> io::Result<FileMeta> {
        let meta = fs::symlink_metadata(path)?;
        Ok(to_meta(&meta, kind_of(path, &meta)))
    }

    fn open_read(&self, path: &Path) -> io::Result<Arc<dyn FileHandle>> {
        let file = File::open(path)?;
        Ok(Arc::new(LocalHandle { file }))
    }

    fn open_write(&self, path: &Path, mode: OpenMode) -> io::Result<Arc<dyn FileHandle>> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        match mode {
            OpenMode::CreateNew => options.create_new(true),
            OpenMode::Truncate => options.create(true).truncate(true),
            OpenMode::Existing => &mut options,
        };
        let file = options.open(path)?;
        Ok(Arc::new(LocalHandle { file }))
    }

    fn set_times(&self, path: &Path, times: FileTimes) -> io::Result<()> {
        match (times.accessed, times.modified) {
            (Some(a), Some(m)) => filetime::set_file_times(
                path,
                FileTime::from_system_time(a),
                FileTime::from_system_time(m),
            ),
            (None, Some(m)) => filetime::set_file_mtime(path, FileTime::from_system_time(m)),
            (Some(a), None) => filetime::set_file_atime(path, FileTime::from_system_time(a)),
            (None, None) => Ok(()),
        }
    }

    fn set_readonly(&self, path: &Path, readonly: bool) -> io::Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = perms.mode();
            perms.set_mode(if readonly { mode & !0o222 } else { mode | 0o200 });
        }
        #[cfg(not(unix))]
        perms.set_readonly(readonly);
        fs::set_permissions(path, perms)
    }

    fn security(&self, path: &Path) -> io::Result<Security> {
        let meta = fs::metadata(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Ok(Security {
                mode: meta.mode() & 0o7777,
                uid: Some(meta.uid()),
                gid: Some(meta.gid()),
            })
        }
        #[cfg(not(unix))]
        Ok(Security {
            mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
            uid: None,
            gid: None,
        })
    }

    fn set_security(&self, path: &Path, security: &Security) -> io::Result<SecurityApplied> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(security.mode))?;
            let owner = match std::os::unix::fs::chown(path, security.uid, security.gid) {
                Ok(()) => true,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    debug!(path = %path.display(), "owner not applied: {e}");
                    false
                }
                Err(e) => return Err(e),
            };
            Ok(SecurityApplied { mode: true, owner })
        }
        #[cfg(not(unix))]
        {
            self.set_readonly(path, security.mode & 0o200 == 0)?;
            Ok(SecurityApplied {
                mode: true,
                owner: false,
            })
        }
    }

    fn list_streams(&self, path: &Path) -> io::Result<Vec<String>> {
        #[cfg(unix)]
        {
            let names = xattr::list(path)?
                .filter_map(|name| name.into_string().ok())
                .filter_map(|name| name.strip_prefix(STREAM_PREFIX).map(str::to_string))
                .collect();
            Ok(names)
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Ok(Vec::new())
        }
    }

    fn open_stream_read(&self, path: &Path, name: &str) -> io::Result<Arc<dyn FileHandle>> {
        #[cfg(unix)]
        {
            let key = format!("{STREAM_PREFIX}{name}");
            let data = xattr::get(path, &key)?
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, key.clone()))?;
            Ok(Arc::new(XattrStream {
                path: path.to_path_buf(),
                key,
                data: Mutex::new(data),
            }))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, name);
            Err(unsupported("alternate streams"))
        }
    }

    fn create_stream(&self, path: &Path, name: &str) -> io::Result<Arc<dyn FileHandle>> {
        #[cfg(unix)]
        {
            let key = format!("{STREAM_PREFIX}{name}");
            xattr::set(path, &key, &[])?;
            Ok(Arc::new(XattrStream {
                path: path.to_path_buf(),
                key,
                data: Mutex::new(Vec::new()),
            }))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, name);
            Err(unsupported("alternate streams"))
        }
    }

    fn remove_stream(&self, path: &Path, name: &str) -> io::Result<()> {
        #[cfg(unix)]
        {
            xattr::remove(path, format!("{STREAM_PREFIX}{name}"))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, name);
            Err(unsupported("alternate streams"))
        }
    }

    fn set_compressed(&self, _path: &Path, _compressed: bool) -> io::Result<()> {
        Err(unsupported("compression"))
    }

    fn set_encrypted(&self, _path: &Path, _encrypted: bool) -> io::Result<()> {
        Err(unsupported("encryption"))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_file_to_trash(&self, path: &Path) -> io::Result<()> {
        trash::delete(path).map_err(|e| io::Error::other(e.to_string()))
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn remove_dir_link(&self, path: &Path) -> io::Result<()> {
        let meta = fs::symlink_metadata(path)?;
        if !meta.file_type().is_symlink() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory link", path.display()),
            ));
        }
        #[cfg(windows)]
        {
            fs::remove_dir(path)
        }
        #[cfg(not(windows))]
        {
            fs::remove_file(path)
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let child = entry.path();
            let meta = fs::symlink_metadata(&child)?;
            entries.push(DirEntry {
                name: entry.file_name(),
                meta: to_meta(&meta, kind_of(&child, &meta)),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn volume_info(&self, path: &Path) -> io::Result<VolumeInfo> {
        let probe = existing_ancestor(path);
        let id = fs::metadata(&probe).map(|m| to_meta(&m, EntryKind::Dir).volume)?;
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| probe.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().components().count());

        let (kind, free_space) = match disk {
            Some(disk) => {
                let fs_type = disk.file_system().to_str().unwrap_or("");
                let kind = if ["nfs", "cifs", "smb", "sshfs", "afp", "9p"]
                    .iter()
                    .any(|n| fs_type.contains(n))
                {
                    VolumeKind::Network
                } else {
                    VolumeKind::Fast
                };
                (kind, Some(disk.available_space()))
            }
            None => (VolumeKind::Fast, None),
        };

        Ok(VolumeInfo {
            id,
            kind,
            free_space,
            supports_streams: cfg!(unix),
            supports_compression: false,
            supports_encryption: false,
            supports_security: true,
        })
    }
}

/// Nearest existing ancestor of `path` (the path itself when it exists).
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_positioned_io() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let fs = LocalFs::new();

        let h = fs.open_write(&path, OpenMode::CreateNew).unwrap();
        assert_eq!(h.write_at(b"world", 6).unwrap(), 5);
        assert_eq!(h.write_at(b"hello ", 0).unwrap(), 6);
        assert_eq!(h.size().unwrap(), 11);

        let r = fs.open_read(&path).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(r.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");

        assert!(fs.open_write(&path, OpenMode::CreateNew).is_err());
    }

    #[test]
    fn test_metadata_and_read_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b"), b"xy").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let fs = LocalFs::new();

        let entries = fs.read_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert!(entries[0].meta.is_dir());
        assert_eq!(entries[1].meta.len, 2);
    }

    #[test]
    fn test_readonly_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let fs = LocalFs::new();

        fs.set_readonly(&path, true).unwrap();
        assert!(fs.metadata(&path).unwrap().readonly);
        fs.set_readonly(&path, false).unwrap();
        assert!(!fs.metadata(&path).unwrap().readonly);
    }

    #[test]
    fn test_volume_info_for_missing_target() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let here = fs.volume_info(dir.path()).unwrap();
        let missing = fs.volume_info(&dir.path().join("not/yet")).unwrap();
        assert_eq!(here.id, missing.id);
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_link_removal_keeps_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("real");
        let link = dir.path().join("link");
        std::fs::create_dir(&target).unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let fs = LocalFs::new();

        let meta = fs.symlink_metadata(&link).unwrap();
        assert_eq!(meta.kind, EntryKind::Symlink { to_dir: true });
        fs.remove_dir_link(&link).unwrap();
        assert!(target.exists());
        assert!(!link.exists());
    }
}
