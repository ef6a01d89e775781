// src/store/checkout.rs

//! Materializing stored trees onto disk
//!
//! Regular files are hardlinked to their content object when the entry is
//! root-owned, mode 0644 and carries no extended attributes, since a shared
//! inode cannot hold per-tree metadata. Everything else is copied.

use super::{EntryKind, FileMeta, ObjectStore};
use crate::error::{Error, Result};
use crate::hash;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;
use tracing::debug;

/// What to do when a checkout meets an existing path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteMode {
    /// Any existing non-directory is a conflict
    None,
    /// Existing paths win; new entries are skipped
    AddFiles,
    /// Existing paths are replaced
    UnionFiles,
    /// Existing paths must have identical content and mode
    UnionIdentical,
}

/// Options for [`checkout_commit`]
#[derive(Debug, Clone, Copy)]
pub struct CheckoutOptions<'a> {
    pub mode: OverwriteMode,
    /// Relative paths (no leading slash) to leave out
    pub skip: Option<&'a HashSet<String>>,
    /// Never hardlink into the store
    pub force_copy: bool,
}

impl Default for CheckoutOptions<'_> {
    fn default() -> Self {
        Self {
            mode: OverwriteMode::None,
            skip: None,
            force_copy: false,
        }
    }
}

/// Counters for one checkout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckoutStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub skipped: u64,
}

/// Check out the root tree of `commit` into `dest`, which is created if missing
pub fn checkout_commit(
    store: &dyn ObjectStore,
    commit: &str,
    dest: &Path,
    opts: &CheckoutOptions<'_>,
) -> Result<CheckoutStats> {
    let commit = store.load_commit(commit)?;
    let mut stats = CheckoutStats::default();
    if !dest.exists() {
        fs::create_dir_all(dest)?;
        apply_meta(dest, &commit.root_meta, false)?;
    }
    checkout_tree(store, &commit.root_tree, dest, "", opts, &mut stats)?;
    debug!(
        "Checked out {} files, {} dirs, {} symlinks into {} ({} skipped)",
        stats.files,
        stats.dirs,
        stats.symlinks,
        dest.display(),
        stats.skipped
    );
    Ok(stats)
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn apply_meta(path: &Path, meta: &FileMeta, symlink: bool) -> Result<()> {
    if is_root() {
        std::os::unix::fs::lchown(path, Some(meta.uid), Some(meta.gid))
            .map_err(|e| Error::IoError(format!("Failed to chown {}: {}", path.display(), e)))?;
    }
    if !symlink {
        fs::set_permissions(path, fs::Permissions::from_mode(meta.mode))?;
    }
    Ok(())
}

fn can_hardlink(meta: &FileMeta, opts: &CheckoutOptions<'_>) -> bool {
    !opts.force_copy && meta.mode == 0o644 && meta.uid == 0 && meta.gid == 0 && meta.xattrs.is_empty()
}

fn checkout_tree(
    store: &dyn ObjectStore,
    tree: &str,
    dir: &Path,
    prefix: &str,
    opts: &CheckoutOptions<'_>,
    stats: &mut CheckoutStats,
) -> Result<()> {
    let tree = store.load_tree(tree)?;
    for entry in &tree.entries {
        let rel = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", prefix, entry.name)
        };
        let path = dir.join(&entry.name);

        if opts.skip.is_some_and(|s| s.contains(&rel)) {
            stats.skipped += 1;
            continue;
        }

        let existing = match fs::symlink_metadata(&path) {
            Ok(m) => Some(m),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match &entry.kind {
            EntryKind::Dir { tree } => {
                match existing {
                    Some(m) if m.is_dir() => {}
                    Some(_) if opts.mode == OverwriteMode::UnionFiles => {
                        fs::remove_file(&path)?;
                        fs::create_dir(&path)?;
                        apply_meta(&path, &entry.meta, false)?;
                    }
                    Some(_) => {
                        return Err(Error::FileTypeConflict(format!(
                            "/{} exists and is not a directory",
                            rel
                        )));
                    }
                    None => {
                        fs::create_dir(&path)?;
                        apply_meta(&path, &entry.meta, false)?;
                    }
                }
                stats.dirs += 1;
                checkout_tree(store, tree, &path, &rel, opts, stats)?;
            }
            EntryKind::File { content, .. } => {
                if let Some(m) = existing {
                    if !resolve_existing(&path, &rel, &m, opts.mode, || {
                        Ok(m.is_file()
                            && m.permissions().mode() & 0o7777 == entry.meta.mode
                            && hash::sha256_reader(fs::File::open(&path)?)? == *content)
                    })? {
                        stats.skipped += 1;
                        continue;
                    }
                }
                let hardlink = can_hardlink(&entry.meta, opts);
                store.checkout_content(content, &path, hardlink)?;
                if !hardlink {
                    apply_meta(&path, &entry.meta, false)?;
                }
                stats.files += 1;
            }
            EntryKind::Symlink { target } => {
                if let Some(m) = existing {
                    if !resolve_existing(&path, &rel, &m, opts.mode, || {
                        Ok(m.file_type().is_symlink() && fs::read_link(&path)? == Path::new(target))
                    })? {
                        stats.skipped += 1;
                        continue;
                    }
                }
                symlink(target, &path)?;
                apply_meta(&path, &entry.meta, true)?;
                stats.symlinks += 1;
            }
        }
    }
    Ok(())
}

/// Decide what to do with an existing non-directory entry in the way
///
/// Returns `true` when the new entry should be written (the old one has
/// been removed), `false` when it should be skipped.
fn resolve_existing(
    path: &Path,
    rel: &str,
    existing: &fs::Metadata,
    mode: OverwriteMode,
    identical: impl FnOnce() -> Result<bool>,
) -> Result<bool> {
    if existing.is_dir() {
        return Err(Error::FileTypeConflict(format!(
            "/{} is a directory in the target",
            rel
        )));
    }
    match mode {
        OverwriteMode::None => Err(Error::Conflict(format!("/{} already exists", rel))),
        OverwriteMode::AddFiles => Ok(false),
        OverwriteMode::UnionFiles => {
            fs::remove_file(path)?;
            Ok(true)
        }
        OverwriteMode::UnionIdentical => {
            if identical()? {
                Ok(false)
            } else {
                Err(Error::Conflict(format!(
                    "/{} differs from the file already checked out",
                    rel
                )))
            }
        }
    }
}
