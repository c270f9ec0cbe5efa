//! Per-session resource table: anchors (shares), the active anchor, the
//! open-file map and file-id minting.
//!
//! A file id is 16 bytes: the little-endian tree id (8 bytes) followed by
//! the little-endian per-session file counter (8 bytes). The all-zero id
//! is never minted; the all-0xFF id stands for "the file most recently
//! created in this chain".

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ServerError;
use crate::smb2::status::NtStatus;
use crate::vfs::{FileHandle, FileProvider, MemoryXattrStore, NoStorage, XattrStore};

/// Name of the share hosting the RPC pipes.
pub const NAMED_PIPE_SHARE: &str = "IPC$";

/// Pipe answering share enumeration.
pub const SRVSVC_PIPE: &str = "srvsvc";

/// Tree ids are unique across all sessions of the process.
static NEXT_TREE_ID: AtomicU32 = AtomicU32::new(1);

fn mint_tree_id() -> u32 {
    NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A named share.
pub struct Anchor {
    pub name: String,
    pub root: PathBuf,
    pub tree_id: u32,
    pub provider: Arc<dyn FileProvider>,
    pub xattrs: Arc<dyn XattrStore>,
}

impl Anchor {
    /// Register a share, minting its tree id.
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        provider: Arc<dyn FileProvider>,
        xattrs: Arc<dyn XattrStore>,
    ) -> Self {
        Anchor {
            name: name.into(),
            root: root.into(),
            tree_id: mint_tree_id(),
            provider,
            xattrs,
        }
    }

    /// The storage-less share that hosts the RPC pipes.
    pub fn named_pipe() -> Self {
        Self::new(
            NAMED_PIPE_SHARE,
            PathBuf::new(),
            Arc::new(NoStorage),
            Arc::new(MemoryXattrStore::new()),
        )
    }

    pub fn is_named_pipe(&self) -> bool {
        self.name.eq_ignore_ascii_case(NAMED_PIPE_SHARE)
    }

    /// Lookup key: anchors are matched by upper-cased name.
    pub fn key(&self) -> String {
        self.name.to_uppercase()
    }

    /// Join the root with a client path. Backslashes are separators; empty
    /// and `.` components are dropped and `..` is refused.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ServerError> {
        join_within(&self.root, relative).ok_or(ServerError::Resource(NtStatus::AccessDenied))
    }
}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anchor")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("tree_id", &self.tree_id)
            .finish()
    }
}

/// A 16-byte SMB2 file id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub const NIL: Guid = Guid([0; 16]);
    pub const SENTINEL: Guid = Guid([0xFF; 16]);

    pub fn new(tree_id: u32, sequence: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&(tree_id as u64).to_le_bytes());
        bytes[8..].copy_from_slice(&sequence.to_le_bytes());
        Guid(bytes)
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Self::SENTINEL
    }

    pub fn bytes(&self) -> [u8; 16] {
        self.0
    }

    /// Per-session file counter half, reported as the file index number.
    pub fn sequence(&self) -> u64 {
        let mut half = [0u8; 8];
        half.copy_from_slice(&self.0[8..]);
        u64::from_le_bytes(half)
    }
}

impl From<[u8; 16]> for Guid {
    fn from(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// One-shot action applied when a handle is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    Delete,
    Rename { new_path: PathBuf, replace_existing: bool },
    DeleteAttribute { key: String },
}

/// What an open file id refers to.
pub enum Handle {
    File(Box<dyn FileHandle>),
    /// Extended attribute `key` of the entry's path.
    Xattr { key: String },
    /// The RPC pipe; reads and writes go to the DCE/RPC engine.
    Pipe,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::File(_) => write!(f, "File"),
            Handle::Xattr { key } => write!(f, "Xattr({})", key),
            Handle::Pipe => write!(f, "Pipe"),
        }
    }
}

/// An entry in the open-file map.
#[derive(Debug)]
pub struct OpenFile {
    pub anchor: Arc<Anchor>,
    /// Absolute path (for an attribute handle, the path of its file).
    pub path: PathBuf,
    pub handle: Handle,
    pub pending: Option<PendingAction>,
}

impl OpenFile {
    pub fn new(anchor: Arc<Anchor>, path: PathBuf, handle: Handle) -> Self {
        OpenFile { anchor, path, handle, pending: None }
    }

    /// Register the action to run at close, replacing any earlier one.
    pub fn defer(&mut self, action: PendingAction) {
        if let Some(previous) = self.pending.replace(action) {
            debug!(?previous, "pending close action replaced");
        }
    }
}

/// Split `name:com.apple.key` into the file name and the attribute key.
/// A trailing `:$DATA` stream type is dropped.
pub fn split_xattr_name(name: &str) -> Option<(&str, &str)> {
    let colon = name.find(':')?;
    let (path, stream) = name.split_at(colon);
    if !stream.contains(":com.apple.") {
        return None;
    }
    let key = &stream[1..];
    Some((path, key.strip_suffix(":$DATA").unwrap_or(key)))
}

/// Everything a session's handlers can reach.
#[derive(Debug, Default)]
pub struct ResourceTable {
    anchors: Vec<Arc<Anchor>>,
    active: Option<Arc<Anchor>>,
    files: std::collections::HashMap<Guid, OpenFile>,
    file_seq: u64,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the anchors a user may reach. Called once, after
    /// authentication; a share registered twice keeps its first entry.
    pub fn register_anchors(&mut self, anchors: Vec<Anchor>) {
        for anchor in anchors {
            if self.find_anchor(&anchor.name).is_some() {
                warn!(share = %anchor.name, "duplicate share ignored");
                continue;
            }
            debug!(share = %anchor.name, tree_id = anchor.tree_id, "share registered");
            self.anchors.push(Arc::new(anchor));
        }
    }

    pub fn anchors(&self) -> &[Arc<Anchor>] {
        &self.anchors
    }

    pub fn find_anchor(&self, name: &str) -> Option<&Arc<Anchor>> {
        let key = name.to_uppercase();
        self.anchors.iter().find(|a| a.key() == key)
    }

    /// Switch the current share. Unknown names leave the active share
    /// unchanged.
    pub fn set_active_anchor(&mut self, name: &str) -> Result<Arc<Anchor>, ServerError> {
        let anchor = self
            .find_anchor(name)
            .cloned()
            .ok_or(ServerError::Resource(NtStatus::NetworkNameDeleted))?;
        self.active = Some(anchor.clone());
        Ok(anchor)
    }

    pub fn active_anchor(&self) -> Result<&Arc<Anchor>, ServerError> {
        self.active
            .as_ref()
            .ok_or(ServerError::Resource(NtStatus::NetworkNameDeleted))
    }

    /// Resolve a client path against the active anchor.
    pub fn resolve_path(&self, relative: &str) -> Result<PathBuf, ServerError> {
        self.active_anchor()?.resolve(relative)
    }

    /// Mint the next file id for `tree_id`.
    pub fn create_handle(&mut self, tree_id: u32) -> Guid {
        self.file_seq += 1;
        Guid::new(tree_id, self.file_seq)
    }

    pub fn open(&mut self, guid: Guid, file: OpenFile) {
        debug!(file_id = %guid, path = ?file.path, handle = ?file.handle, "file opened");
        self.files.insert(guid, file);
    }

    pub fn get(&self, guid: &Guid) -> Result<&OpenFile, ServerError> {
        self.files.get(guid).ok_or(ServerError::Resource(NtStatus::FileClosed))
    }

    pub fn get_mut(&mut self, guid: &Guid) -> Result<&mut OpenFile, ServerError> {
        self.files
            .get_mut(guid)
            .ok_or(ServerError::Resource(NtStatus::FileClosed))
    }

    pub fn is_open(&self, guid: &Guid) -> bool {
        self.files.contains_key(guid)
    }

    pub fn open_count(&self) -> usize {
        self.files.len()
    }

    /// Map the sentinel id to `latest`; any other id is returned unchanged.
    pub fn resolve_sentinel(guid: Guid, latest: Guid) -> Guid {
        if guid.is_sentinel() {
            latest
        } else {
            guid
        }
    }

    /// Close a handle: run its pending action, then drop the entry.
    /// A failing action is logged; the handle is closed regardless.
    pub async fn close(&mut self, guid: &Guid) -> Result<OpenFile, ServerError> {
        let entry = self.get_mut(guid)?;
        if let Some(action) = entry.pending.take() {
            if let Err(e) = run_action(&entry.anchor, &entry.path, &action).await {
                warn!(file_id = %guid, ?action, "close action failed: {}", e);
            }
        }
        let entry = self.files.remove(guid).ok_or(ServerError::Resource(NtStatus::FileClosed))?;
        debug!(file_id = %guid, "file closed");
        Ok(entry)
    }
}

fn join_within(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for component in relative.split(['\\', '/']) {
        match component {
            "" | "." => {}
            ".." => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

async fn run_action(anchor: &Anchor, path: &Path, action: &PendingAction) -> std::io::Result<()> {
    match action {
        PendingAction::Delete => anchor.provider.remove(path).await,
        PendingAction::Rename { new_path, replace_existing } => {
            if *replace_existing && anchor.provider.stat(new_path).await.is_ok() {
                anchor.provider.remove(new_path).await?;
            }
            anchor.provider.rename(path, new_path).await
        }
        PendingAction::DeleteAttribute { key } => anchor.xattrs.delete(path, key).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{LocalProvider, OpenFlags};
    use tempfile::TempDir;

    fn local_anchor(name: &str, root: &Path) -> Anchor {
        Anchor::new(
            name,
            root,
            Arc::new(LocalProvider::new(root)),
            Arc::new(MemoryXattrStore::new()),
        )
    }

    fn table_with(root: &Path) -> ResourceTable {
        let mut table = ResourceTable::new();
        table.register_anchors(vec![local_anchor("Public", root), Anchor::named_pipe()]);
        table.set_active_anchor("public").unwrap();
        table
    }

    #[test]
    fn test_guid_layout() {
        let guid = Guid::new(3, 1);
        assert_eq!(guid.bytes(), [3, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(guid.sequence(), 1);
        assert!(!guid.is_nil());
        assert!(Guid::SENTINEL.is_sentinel());
    }

    #[test]
    fn test_tree_ids_are_distinct() {
        let a = Anchor::named_pipe();
        let b = Anchor::named_pipe();
        assert_ne!(a.tree_id, b.tree_id);
    }

    #[test]
    fn test_active_anchor_switching() {
        let tmp = TempDir::new().unwrap();
        let mut table = table_with(tmp.path());
        assert_eq!(table.active_anchor().unwrap().name, "Public");
        assert!(table.set_active_anchor("ipc$").unwrap().is_named_pipe());
        assert!(table.set_active_anchor("missing").is_err());
        assert_eq!(table.active_anchor().unwrap().name, NAMED_PIPE_SHARE);
    }

    #[test]
    fn test_resolve_path() {
        let tmp = TempDir::new().unwrap();
        let table = table_with(tmp.path());
        assert_eq!(table.resolve_path("").unwrap(), tmp.path());
        assert_eq!(table.resolve_path("a\\b.txt").unwrap(), tmp.path().join("a").join("b.txt"));
        assert!(table.resolve_path("a\\..\\..\\etc").is_err());
    }

    #[test]
    fn test_counter_is_per_session() {
        let mut one = ResourceTable::new();
        let mut two = ResourceTable::new();
        assert_eq!(one.create_handle(7), Guid::new(7, 1));
        assert_eq!(one.create_handle(7), Guid::new(7, 2));
        assert_eq!(two.create_handle(7), Guid::new(7, 1));
    }

    #[test]
    fn test_sentinel_resolution() {
        let latest = Guid::new(1, 4);
        assert_eq!(ResourceTable::resolve_sentinel(Guid::SENTINEL, latest), latest);
        let other = Guid::new(1, 2);
        assert_eq!(ResourceTable::resolve_sentinel(other, latest), other);
    }

    #[test]
    fn test_split_xattr_name() {
        assert_eq!(
            split_xattr_name("a.txt:com.apple.FinderInfo"),
            Some(("a.txt", "com.apple.FinderInfo"))
        );
        assert_eq!(
            split_xattr_name("a.txt:com.apple.metadata:_kMDItemUserTags:$DATA"),
            Some(("a.txt", "com.apple.metadata:_kMDItemUserTags"))
        );
        assert_eq!(split_xattr_name("a.txt:AFP_AfpInfo"), None);
        assert_eq!(split_xattr_name("plain.txt"), None);
    }

    #[tokio::test]
    async fn test_close_twice() {
        let tmp = TempDir::new().unwrap();
        let mut table = table_with(tmp.path());
        let anchor = table.active_anchor().unwrap().clone();
        let guid = table.create_handle(anchor.tree_id);
        table.open(guid, OpenFile::new(anchor, tmp.path().to_path_buf(), Handle::Pipe));

        assert!(table.close(&guid).await.is_ok());
        assert!(!table.is_open(&guid));
        match table.close(&guid).await {
            Err(ServerError::Resource(NtStatus::FileClosed)) => {}
            other => panic!("expected FileClosed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_delete_on_close_fires_once() {
        let tmp = TempDir::new().unwrap();
        let mut table = table_with(tmp.path());
        let anchor = table.active_anchor().unwrap().clone();
        let path = tmp.path().join("doomed.txt");
        let handle = anchor
            .provider
            .open(&path, OpenFlags { write: true, create: true, truncate: false })
            .await
            .unwrap();
        let guid = table.create_handle(anchor.tree_id);
        let mut entry = OpenFile::new(anchor, path.clone(), Handle::File(handle));
        entry.defer(PendingAction::Delete);
        table.open(guid, entry);

        assert!(path.exists());
        let closed = table.close(&guid).await.unwrap();
        assert!(closed.pending.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_rename_on_close_replaces_target() {
        let tmp = TempDir::new().unwrap();
        let mut table = table_with(tmp.path());
        let anchor = table.active_anchor().unwrap().clone();
        std::fs::write(tmp.path().join("from.txt"), "new").unwrap();
        std::fs::write(tmp.path().join("to.txt"), "old").unwrap();

        let guid = table.create_handle(anchor.tree_id);
        let mut entry = OpenFile::new(anchor, tmp.path().join("from.txt"), Handle::Pipe);
        entry.defer(PendingAction::Delete);
        entry.defer(PendingAction::Rename {
            new_path: tmp.path().join("to.txt"),
            replace_existing: true,
        });
        table.open(guid, entry);
        table.close(&guid).await.unwrap();

        assert!(!tmp.path().join("from.txt").exists());
        assert_eq!(std::fs::read_to_string(tmp.path().join("to.txt")).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_delete_attribute_on_close() {
        let tmp = TempDir::new().unwrap();
        let mut table = table_with(tmp.path());
        let anchor = table.active_anchor().unwrap().clone();
        let path = tmp.path().join("tagged.txt");
        anchor.xattrs.set(&path, "com.apple.FinderInfo", b"x").await.unwrap();

        let guid = table.create_handle(anchor.tree_id);
        let key = "com.apple.FinderInfo".to_string();
        let mut entry = OpenFile::new(anchor.clone(), path.clone(), Handle::Xattr { key: key.clone() });
        entry.defer(PendingAction::DeleteAttribute { key });
        table.open(guid, entry);
        table.close(&guid).await.unwrap();

        assert!(anchor.xattrs.get(&path, "com.apple.FinderInfo").await.is_err());
    }
}
