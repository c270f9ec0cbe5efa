//! Storage collaborators.
//!
//! Command handlers never touch the filesystem directly: each anchor carries
//! a [`FileProvider`] for file content and an [`XattrStore`] for extended
//! attributes. [`LocalProvider`] maps those operations onto `tokio::fs`
//! beneath a share root, with traversal protection: resolved paths must
//! remain within the root.
//!
//! Timestamps are converted to Windows FILETIME format (100-nanosecond
//! intervals since January 1, 1601).

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Windows FILETIME epoch offset from Unix epoch (100-ns intervals).
const FILETIME_UNIX_DIFF: u64 = 116_444_736_000_000_000;

/// Metadata about a file or directory, using Windows FILETIME timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub end_of_file: u64,
    pub allocation_size: u64,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub change_time: u64,
    pub is_directory: bool,
}

/// Convert a `SystemTime` to a Windows FILETIME value.
pub fn system_time_to_filetime(t: SystemTime) -> u64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as u64 / 100 + FILETIME_UNIX_DIFF,
        Err(_) => FILETIME_UNIX_DIFF,
    }
}

/// The current time as a FILETIME.
pub fn filetime_now() -> u64 {
    system_time_to_filetime(SystemTime::now())
}

/// How a file is to be opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

/// An open file returned by a [`FileProvider`].
#[async_trait]
pub trait FileHandle: Send + Sync {
    /// Read up to `length` bytes at `offset`; a short result means end of file.
    async fn read_at(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>>;
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize>;
    async fn flush(&mut self) -> io::Result<()>;
}

/// File content operations for one share.
#[async_trait]
pub trait FileProvider: Send + Sync {
    async fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn FileHandle>>;
    async fn stat(&self, path: &Path) -> io::Result<FileInfo>;
    async fn mkdir(&self, path: &Path) -> io::Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn remove(&self, path: &Path) -> io::Result<()>;
    /// Entries of a directory, excluding `.` and `..`.
    async fn list(&self, path: &Path) -> io::Result<Vec<FileInfo>>;
}

/// Extended attributes keyed by (path, key).
#[async_trait]
pub trait XattrStore: Send + Sync {
    async fn get(&self, path: &Path, key: &str) -> io::Result<Vec<u8>>;
    async fn set(&self, path: &Path, key: &str, value: &[u8]) -> io::Result<()>;
    async fn delete(&self, path: &Path, key: &str) -> io::Result<()>;
    async fn list(&self, path: &Path) -> io::Result<Vec<String>>;
}

/// Safely resolve a relative SMB path within a share root.
///
/// Converts backslashes to forward slashes, strips leading separators,
/// canonicalizes via the filesystem, and verifies the result is inside `root`.
/// Returns `None` if the path escapes the root (traversal attack).
pub fn safe_resolve(root: &Path, relative: &str) -> Option<PathBuf> {
    let cleaned = relative.replace('\\', "/");
    let cleaned = cleaned.trim_start_matches('/');

    if cleaned.split('/').any(|c| c == "..") {
        return None;
    }

    let candidate = if cleaned.is_empty() {
        root.to_path_buf()
    } else {
        root.join(cleaned)
    };
    let root_canon = root.canonicalize().ok()?;

    if candidate.exists() {
        let canon = candidate.canonicalize().ok()?;
        if canon.starts_with(&root_canon) {
            Some(canon)
        } else {
            warn!(path = ?candidate, "path traversal detected");
            None
        }
    } else {
        // Not created yet: the parent must exist inside the root.
        let parent = candidate.parent()?;
        let parent_canon = parent.canonicalize().ok()?;
        if parent_canon.starts_with(&root_canon) {
            Some(parent_canon.join(candidate.file_name()?))
        } else {
            warn!(path = ?candidate, "path traversal detected");
            None
        }
    }
}

/// [`FileProvider`] over the local filesystem beneath `root`.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalProvider { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-check an absolute path against the root.
    fn guard(&self, path: &Path) -> io::Result<PathBuf> {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        safe_resolve(&self.root, &relative.to_string_lossy()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::PermissionDenied, "path escapes share root")
        })
    }
}

async fn stat_path(path: &Path) -> io::Result<FileInfo> {
    let meta = fs::metadata(path).await?;
    let name = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let size = meta.len();
    let modified = meta.modified().unwrap_or(UNIX_EPOCH);
    let accessed = meta.accessed().unwrap_or(UNIX_EPOCH);
    let created = meta.created().unwrap_or(modified);

    Ok(FileInfo {
        name,
        end_of_file: size,
        allocation_size: (size + 4095) & !4095, // round up to 4K block
        creation_time: system_time_to_filetime(created),
        last_access_time: system_time_to_filetime(accessed),
        last_write_time: system_time_to_filetime(modified),
        change_time: system_time_to_filetime(modified),
        is_directory: meta.is_dir(),
    })
}

#[async_trait]
impl FileProvider for LocalProvider {
    async fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn FileHandle>> {
        let path = self.guard(path)?;
        if fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(Box::new(DirectoryHandle));
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(flags.write || flags.truncate)
            .create(flags.create)
            .truncate(flags.truncate)
            .open(&path)
            .await?;
        debug!(path = ?path, ?flags, "opened file");
        Ok(Box::new(LocalFile { file }))
    }

    async fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        stat_path(&self.guard(path)?).await
    }

    async fn mkdir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(self.guard(path)?).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(self.guard(from)?, self.guard(to)?).await
    }

    /// Delete a file or empty directory.
    async fn remove(&self, path: &Path) -> io::Result<()> {
        let path = self.guard(path)?;
        if fs::metadata(&path).await?.is_dir() {
            fs::remove_dir(&path).await
        } else {
            fs::remove_file(&path).await
        }
    }

    async fn list(&self, path: &Path) -> io::Result<Vec<FileInfo>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(self.guard(path)?).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            match stat_path(&entry.path()).await {
                Ok(info) => entries.push(info),
                Err(e) => debug!("Skipping entry {:?}: {}", entry.path(), e),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

struct LocalFile {
    file: fs::File,
}

#[async_trait]
impl FileHandle for LocalFile {
    async fn read_at(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        self.file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.file.seek(io::SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(data.len())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.file.sync_all().await
    }
}

/// Directories are opened for metadata and enumeration only.
struct DirectoryHandle;

fn is_a_directory() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "handle refers to a directory")
}

#[async_trait]
impl FileHandle for DirectoryHandle {
    async fn read_at(&mut self, _offset: u64, _length: usize) -> io::Result<Vec<u8>> {
        Err(is_a_directory())
    }

    async fn write_at(&mut self, _offset: u64, _data: &[u8]) -> io::Result<usize> {
        Err(is_a_directory())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Provider for shares without backing storage (the named-pipe share).
/// Every operation fails with `NotFound`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStorage;

fn no_storage() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "share has no storage")
}

#[async_trait]
impl FileProvider for NoStorage {
    async fn open(&self, _path: &Path, _flags: OpenFlags) -> io::Result<Box<dyn FileHandle>> {
        Err(no_storage())
    }

    async fn stat(&self, _path: &Path) -> io::Result<FileInfo> {
        Err(no_storage())
    }

    async fn mkdir(&self, _path: &Path) -> io::Result<()> {
        Err(no_storage())
    }

    async fn rename(&self, _from: &Path, _to: &Path) -> io::Result<()> {
        Err(no_storage())
    }

    async fn remove(&self, _path: &Path) -> io::Result<()> {
        Err(no_storage())
    }

    async fn list(&self, _path: &Path) -> io::Result<Vec<FileInfo>> {
        Err(no_storage())
    }
}

/// In-memory [`XattrStore`].
#[derive(Debug, Default)]
pub struct MemoryXattrStore {
    attrs: Mutex<HashMap<PathBuf, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryXattrStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, HashMap<PathBuf, BTreeMap<String, Vec<u8>>>>> {
        self.attrs
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "xattr store poisoned"))
    }
}

fn no_attribute(key: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no attribute {}", key))
}

#[async_trait]
impl XattrStore for MemoryXattrStore {
    async fn get(&self, path: &Path, key: &str) -> io::Result<Vec<u8>> {
        self.lock()?
            .get(path)
            .and_then(|m| m.get(key))
            .cloned()
            .ok_or_else(|| no_attribute(key))
    }

    async fn set(&self, path: &Path, key: &str, value: &[u8]) -> io::Result<()> {
        self.lock()?
            .entry(path.to_path_buf())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &Path, key: &str) -> io::Result<()> {
        let mut attrs = self.lock()?;
        let removed = attrs.get_mut(path).and_then(|m| m.remove(key));
        match removed {
            Some(_) => Ok(()),
            None => Err(no_attribute(key)),
        }
    }

    async fn list(&self, path: &Path) -> io::Result<Vec<String>> {
        Ok(self
            .lock()?
            .get(path)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }
}
