// src/store/repo.rs

//! On-disk object store
//!
//! Layout under the repository root:
//!
//! ```text
//! config                     repository format marker
//! objects/ab/cdef....file    content objects (raw bytes)
//! objects/ab/cdef....tree    tree objects (JSON)
//! objects/ab/cdef....commit  commit objects (JSON)
//! refs/heads/<name>          ref files holding a commit checksum
//! state/<checksum>.partial   partial-commit markers
//! tmp/                       staging area for atomic writes
//! txn.lock                   writer lock held for a transaction's lifetime
//! ```
//!
//! Objects are written to `tmp/` and renamed into place, so a crash never
//! leaves a truncated object under its final name.

use super::{Commit, ObjectStore, TransactionStats, Tree, validate_ref_name};
use crate::error::{Error, Result};
use crate::hash;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REPO_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RepoConfig {
    version: u32,
}

#[derive(Debug, Clone, Copy)]
enum ObjectKind {
    Content,
    Tree,
    Commit,
}

impl ObjectKind {
    fn extension(self) -> &'static str {
        match self {
            Self::Content => "file",
            Self::Tree => "tree",
            Self::Commit => "commit",
        }
    }
}

struct ActiveTransaction {
    id: Uuid,
    /// Held for the transaction's lifetime; dropping it releases the lock
    lock: File,
    refs: BTreeMap<String, Option<String>>,
    commits: Vec<String>,
    stats: TransactionStats,
}

/// Filesystem-backed [`ObjectStore`]
pub struct FsRepo {
    root: PathBuf,
    txn: Mutex<Option<ActiveTransaction>>,
}

impl FsRepo {
    /// Create a repository at `root`, or open it if one already exists
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["objects", "refs/heads", "state", "tmp"] {
            fs::create_dir_all(root.join(dir))?;
        }

        let config_path = root.join("config");
        if !config_path.exists() {
            let config = serde_json::to_vec(&RepoConfig {
                version: REPO_FORMAT_VERSION,
            })?;
            fs::write(&config_path, config)?;
            info!("Initialized object store at {}", root.display());
        }

        Self::open(root)
    }

    /// Open an existing repository
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let config_path = root.join("config");
        let bytes = fs::read(&config_path).map_err(|e| {
            Error::StoreError(format!("No object store at {}: {}", root.display(), e))
        })?;
        let config: RepoConfig = serde_json::from_slice(&bytes)?;
        if config.version != REPO_FORMAT_VERSION {
            return Err(Error::StoreError(format!(
                "Unsupported object store version {} at {}",
                config.version,
                root.display()
            )));
        }

        debug!("Opened object store at {}", root.display());
        Ok(Self {
            root,
            txn: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, checksum: &str, kind: ObjectKind) -> PathBuf {
        let (prefix, rest) = checksum.split_at(checksum.len().min(2));
        self.root
            .join("objects")
            .join(prefix)
            .join(format!("{}.{}", rest, kind.extension()))
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join("refs/heads").join(name)
    }

    fn partial_path(&self, checksum: &str) -> PathBuf {
        self.root.join("state").join(format!("{}.partial", checksum))
    }

    fn check_checksum(checksum: &str) -> Result<()> {
        if hash::is_sha256_hex(checksum) {
            Ok(())
        } else {
            Err(Error::StoreError(format!("Invalid object checksum '{}'", checksum)))
        }
    }

    fn with_txn<T>(&self, f: impl FnOnce(&mut ActiveTransaction) -> Result<T>) -> Result<T> {
        let mut guard = self
            .txn
            .lock()
            .map_err(|_| Error::StoreError("transaction state poisoned".to_string()))?;
        match guard.as_mut() {
            Some(txn) => f(txn),
            None => Err(Error::StoreError(
                "object store write outside of a transaction".to_string(),
            )),
        }
    }

    /// Write `data` atomically to `dest` via the staging directory
    fn write_atomic(&self, dest: &Path, data: &[u8], mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = NamedTempFile::new_in(self.root.join("tmp"))?;
        tmp.write_all(data)?;
        tmp.as_file().set_permissions(fs::Permissions::from_mode(mode))?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest)
            .map_err(|e| Error::IoError(format!("Failed to persist {}: {}", dest.display(), e)))?;
        Ok(())
    }

    /// Store an object, returning its checksum and whether it was new
    fn write_object(&self, data: &[u8], kind: ObjectKind) -> Result<(String, bool)> {
        let checksum = hash::sha256(data);
        let path = self.object_path(&checksum, kind);
        if path.exists() {
            return Ok((checksum, false));
        }
        let mode = match kind {
            ObjectKind::Content => 0o644,
            _ => 0o444,
        };
        self.write_atomic(&path, data, mode)?;
        Ok((checksum, true))
    }

    fn read_object(&self, checksum: &str, kind: ObjectKind) -> Result<Vec<u8>> {
        Self::check_checksum(checksum)?;
        let path = self.object_path(checksum, kind);
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                Error::NotFound(format!("{} object {}", kind.extension(), checksum))
            }
            _ => Error::IoError(format!("Failed to read {}: {}", path.display(), e)),
        })
    }

    fn refs_under(&self, dir: &Path, prefix: &str, out: &mut Vec<(String, String)>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let full = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            if entry.file_type()?.is_dir() {
                self.refs_under(&entry.path(), &full, out)?;
            } else {
                let checksum = fs::read_to_string(entry.path())?.trim().to_string();
                out.push((full, checksum));
            }
        }
        Ok(())
    }

    fn apply_ref(&self, name: &str, checksum: Option<&str>) -> Result<()> {
        let path = self.ref_path(name);
        match checksum {
            Some(c) => self.write_atomic(&path, format!("{}\n", c).as_bytes(), 0o644),
            None => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

impl ObjectStore for FsRepo {
    fn resolve_ref(&self, name: &str) -> Result<Option<String>> {
        validate_ref_name(name)?;
        match fs::read_to_string(self.ref_path(name)) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                Ok(None)
            }
            Err(e) => Err(Error::IoError(format!("Failed to read ref {}: {}", name, e))),
        }
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        self.refs_under(&self.root.join("refs/heads"), "", &mut out)?;
        out.retain(|(name, _)| name.starts_with(prefix));
        out.sort();
        Ok(out)
    }

    fn load_commit(&self, checksum: &str) -> Result<Commit> {
        let bytes = self.read_object(checksum, ObjectKind::Commit)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn load_tree(&self, checksum: &str) -> Result<Tree> {
        let bytes = self.read_object(checksum, ObjectKind::Tree)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn read_content(&self, checksum: &str) -> Result<Vec<u8>> {
        let content = self.read_object(checksum, ObjectKind::Content)?;
        let actual = hash::sha256(&content);
        if actual != checksum {
            return Err(Error::ChecksumMismatch {
                what: "content object".to_string(),
                expected: checksum.to_string(),
                actual,
            });
        }
        Ok(content)
    }

    fn has_content(&self, checksum: &str) -> bool {
        hash::is_sha256_hex(checksum) && self.object_path(checksum, ObjectKind::Content).exists()
    }

    fn checkout_content(&self, checksum: &str, dest: &Path, hardlink: bool) -> Result<()> {
        Self::check_checksum(checksum)?;
        let src = self.object_path(checksum, ObjectKind::Content);
        if hardlink {
            match fs::hard_link(&src, dest) {
                Ok(()) => return Ok(()),
                // Cross-device or unsupported: fall back to a copy
                Err(e) if e.kind() != ErrorKind::AlreadyExists && e.kind() != ErrorKind::NotFound => {
                    debug!("Hardlink of {} failed ({}), copying", checksum, e);
                }
                Err(e) => {
                    return Err(Error::IoError(format!(
                        "Failed to link {} to {}: {}",
                        checksum,
                        dest.display(),
                        e
                    )));
                }
            }
        }
        fs::copy(&src, dest).map_err(|e| {
            Error::IoError(format!("Failed to copy {} to {}: {}", checksum, dest.display(), e))
        })?;
        Ok(())
    }

    fn write_content(&self, data: &[u8]) -> Result<String> {
        self.with_txn(|_| Ok(()))?;
        let (checksum, new) = self.write_object(data, ObjectKind::Content)?;
        if new {
            self.with_txn(|txn| {
                txn.stats.content_objects_written += 1;
                txn.stats.content_bytes_written += data.len() as u64;
                Ok(())
            })?;
        }
        Ok(checksum)
    }

    fn write_content_from(&self, reader: &mut dyn Read) -> Result<(String, u64)> {
        use std::os::unix::fs::PermissionsExt;

        self.with_txn(|_| Ok(()))?;
        let mut tmp = NamedTempFile::new_in(self.root.join("tmp"))?;
        let mut hasher = hash::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            size += n as u64;
        }

        let checksum = hasher.finalize();
        let path = self.object_path(&checksum, ObjectKind::Content);
        if path.exists() {
            return Ok((checksum, size));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        tmp.as_file().set_permissions(fs::Permissions::from_mode(0o644))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|e| Error::IoError(format!("Failed to persist {}: {}", path.display(), e)))?;
        self.with_txn(|txn| {
            txn.stats.content_objects_written += 1;
            txn.stats.content_bytes_written += size;
            Ok(())
        })?;
        Ok((checksum, size))
    }

    fn write_tree(&self, tree: &Tree) -> Result<String> {
        self.with_txn(|_| Ok(()))?;
        let bytes = serde_json::to_vec(tree)?;
        let (checksum, new) = self.write_object(&bytes, ObjectKind::Tree)?;
        if new {
            self.with_txn(|txn| {
                txn.stats.metadata_objects_written += 1;
                Ok(())
            })?;
        }
        Ok(checksum)
    }

    fn write_commit(&self, commit: &Commit) -> Result<String> {
        self.with_txn(|_| Ok(()))?;
        let bytes = serde_json::to_vec(commit)?;
        let checksum = hash::sha256(&bytes);
        let existed = self.object_path(&checksum, ObjectKind::Commit).exists();
        // Rewriting a commit left behind by an aborted transaction completes it
        let pending = !existed || self.is_partial(&checksum)?;
        if !existed {
            // Flag before the object appears so a crash never leaves an unflagged half
            self.set_partial(&checksum, true)?;
            self.write_object(&bytes, ObjectKind::Commit)?;
        }
        self.with_txn(|txn| {
            if !existed {
                txn.stats.metadata_objects_written += 1;
            }
            if pending {
                txn.commits.push(checksum.clone());
            }
            Ok(())
        })?;
        Ok(checksum)
    }

    fn is_partial(&self, checksum: &str) -> Result<bool> {
        Self::check_checksum(checksum)?;
        Ok(self.partial_path(checksum).exists())
    }

    fn set_partial(&self, checksum: &str, partial: bool) -> Result<()> {
        Self::check_checksum(checksum)?;
        let path = self.partial_path(checksum);
        if partial {
            fs::write(&path, b"")?;
        } else {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn begin_transaction(&self) -> Result<()> {
        let mut guard = self
            .txn
            .lock()
            .map_err(|_| Error::StoreError("transaction state poisoned".to_string()))?;
        if guard.is_some() {
            return Err(Error::StoreError("a transaction is already active".to_string()));
        }

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join("txn.lock"))?;
        lock.try_lock_exclusive().map_err(|e| {
            Error::StoreError(format!(
                "Object store at {} is locked by another writer: {}",
                self.root.display(),
                e
            ))
        })?;

        let id = Uuid::new_v4();
        debug!("Began store transaction {}", id);
        *guard = Some(ActiveTransaction {
            id,
            lock,
            refs: BTreeMap::new(),
            commits: Vec::new(),
            stats: TransactionStats::default(),
        });
        Ok(())
    }

    fn transaction_set_ref(&self, name: &str, checksum: Option<&str>) -> Result<()> {
        validate_ref_name(name)?;
        if let Some(c) = checksum {
            Self::check_checksum(c)?;
        }
        self.with_txn(|txn| {
            txn.refs.insert(name.to_string(), checksum.map(str::to_string));
            Ok(())
        })
    }

    fn commit_transaction(&self) -> Result<TransactionStats> {
        let mut guard = self
            .txn
            .lock()
            .map_err(|_| Error::StoreError("transaction state poisoned".to_string()))?;
        let mut txn = guard
            .take()
            .ok_or_else(|| Error::StoreError("no active transaction to commit".to_string()))?;

        for checksum in &txn.commits {
            self.set_partial(checksum, false)?;
        }
        for (name, checksum) in &txn.refs {
            self.apply_ref(name, checksum.as_deref())?;
        }
        txn.stats.refs_updated = txn.refs.len() as u64;

        if let Err(e) = FileExt::unlock(&txn.lock) {
            warn!("Failed to release store lock: {}", e);
        }
        info!(
            "Committed store transaction {}: {} content objects ({} bytes), {} metadata objects, {} refs",
            txn.id,
            txn.stats.content_objects_written,
            txn.stats.content_bytes_written,
            txn.stats.metadata_objects_written,
            txn.stats.refs_updated
        );
        Ok(txn.stats)
    }

    fn abort_transaction(&self) -> Result<()> {
        let mut guard = self
            .txn
            .lock()
            .map_err(|_| Error::StoreError("transaction state poisoned".to_string()))?;
        if let Some(txn) = guard.take() {
            // Written objects stay; commits remain flagged partial and refs untouched
            debug!(
                "Aborted store transaction {} ({} staged refs dropped)",
                txn.id,
                txn.refs.len()
            );
            if let Err(e) = FileExt::unlock(&txn.lock) {
                warn!("Failed to release store lock: {}", e);
            }
        }
        Ok(())
    }
}
