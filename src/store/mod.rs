// src/store/mod.rs

//! Content-addressed object store
//!
//! The engine talks to the store through [`ObjectStore`]: content, tree and
//! commit objects addressed by SHA-256, named references, a partial-commit
//! flag, and a single writer transaction that stages reference updates until
//! it commits. [`FsRepo`] is the on-disk implementation.
//!
//! Content objects hold file bytes only. Mode, ownership and extended
//! attributes (including security labels) live in the tree entry, so two
//! files that differ only in label share one content object.

mod checkout;
mod repo;
mod tree;
mod write;

pub use checkout::{CheckoutOptions, CheckoutStats, OverwriteMode, checkout_commit};
pub use repo::FsRepo;
pub use tree::{MutableTree, walk_tree};
pub use write::{CommitModifier, FileOverride, OverrideTable, write_directory};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// Commit metadata: string keys to JSON values, serialized in key order
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Extended attribute name carrying the security label
pub const XATTR_SELINUX: &str = "security.selinux";
/// Extended attribute name carrying file capabilities
pub const XATTR_CAPS: &str = "security.capability";

/// Permission bits, ownership and extended attributes of one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Permission bits only (`mode & 0o7777`)
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, String>,
}

impl FileMeta {
    pub fn new(mode: u32) -> Self {
        Self {
            mode: mode & 0o7777,
            uid: 0,
            gid: 0,
            xattrs: BTreeMap::new(),
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.xattrs.get(XATTR_SELINUX).map(String::as_str)
    }
}

/// What a tree entry points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryKind {
    File { content: String, size: u64 },
    Symlink { target: String },
    Dir { tree: String },
}

/// One named entry in a directory tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    #[serde(flatten)]
    pub kind: EntryKind,
    pub meta: FileMeta,
}

/// A directory listing, entries sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }
}

/// A commit object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub parent: Option<String>,
    pub subject: String,
    /// Seconds since the epoch
    pub timestamp: i64,
    pub root_tree: String,
    pub root_meta: FileMeta,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Commit {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(|v| v.as_bool())
    }
}

/// Counters reported when a transaction commits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub metadata_objects_written: u64,
    pub content_objects_written: u64,
    pub content_bytes_written: u64,
    pub refs_updated: u64,
}

/// Read/write primitives of a content-addressed store
///
/// At most one writer transaction is open at a time. Object writes and ref
/// updates require an open transaction; ref updates become visible only
/// when it commits. Commits written inside a transaction stay flagged
/// partial until then.
pub trait ObjectStore: Send + Sync {
    fn resolve_ref(&self, name: &str) -> Result<Option<String>>;
    /// All refs starting with `prefix`, sorted by name
    fn list_refs(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    fn load_commit(&self, checksum: &str) -> Result<Commit>;
    fn load_tree(&self, checksum: &str) -> Result<Tree>;
    fn read_content(&self, checksum: &str) -> Result<Vec<u8>>;
    fn has_content(&self, checksum: &str) -> bool;
    /// Materialize a content object at `dest`, sharing storage when `hardlink` is set
    fn checkout_content(&self, checksum: &str, dest: &Path, hardlink: bool) -> Result<()>;

    fn write_content(&self, data: &[u8]) -> Result<String>;
    /// Store a content object read from `reader`; returns its checksum and size
    fn write_content_from(&self, reader: &mut dyn Read) -> Result<(String, u64)>;
    fn write_tree(&self, tree: &Tree) -> Result<String>;
    fn write_commit(&self, commit: &Commit) -> Result<String>;

    fn is_partial(&self, checksum: &str) -> Result<bool>;
    fn set_partial(&self, checksum: &str, partial: bool) -> Result<()>;

    fn begin_transaction(&self) -> Result<()>;
    /// Stage a ref update; `None` deletes the ref
    fn transaction_set_ref(&self, name: &str, checksum: Option<&str>) -> Result<()>;
    fn commit_transaction(&self) -> Result<TransactionStats>;
    fn abort_transaction(&self) -> Result<()>;
}

/// Resolve a ref to its commit, if both exist
pub fn resolve_commit(store: &dyn ObjectStore, name: &str) -> Result<Option<(String, Commit)>> {
    match store.resolve_ref(name)? {
        Some(checksum) => {
            let commit = store.load_commit(&checksum)?;
            Ok(Some((checksum, commit)))
        }
        None => Ok(None),
    }
}

/// Scoped writer transaction that aborts unless committed
pub struct StoreTransaction<'a> {
    store: &'a dyn ObjectStore,
    done: bool,
}

impl<'a> StoreTransaction<'a> {
    pub fn begin(store: &'a dyn ObjectStore) -> Result<Self> {
        store.begin_transaction()?;
        Ok(Self { store, done: false })
    }

    pub fn set_ref(&self, name: &str, checksum: &str) -> Result<()> {
        self.store.transaction_set_ref(name, Some(checksum))
    }

    pub fn commit(mut self) -> Result<TransactionStats> {
        self.done = true;
        self.store.commit_transaction()
    }

    pub fn abort(mut self) -> Result<()> {
        self.done = true;
        self.store.abort_transaction()
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        if !self.done
            && let Err(e) = self.store.abort_transaction()
        {
            tracing::warn!("Failed to abort store transaction: {}", e);
        }
    }
}

/// Validate a ref name: non-empty `/`-separated components, no `.` or `..`
pub fn validate_ref_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.split('/').all(|c| {
            !c.is_empty() && c != "." && c != ".." && !c.ends_with(".lock") && c.chars().all(|ch| !ch.is_control())
        });
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidPath(format!("Invalid ref name '{}'", name)))
    }
}
