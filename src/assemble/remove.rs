// src/assemble/remove.rs

//! Taking leaving packages out of the scratch root
//!
//! Files go first, together with the tmpfiles.d fragment the importer
//! generated for the package. Directories are queued and removed deepest
//! first in a second pass; a directory that still has content belongs to
//! someone else as well and is left alone.

use crate::error::{Error, Result};
use crate::import::ImportOptions;
use crate::import::filter::tree_path;
use crate::import::tmpfiles::TmpfilesFragment;
use crate::packages::PackageHeader;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

/// Counters for one removal pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveStats {
    pub files: usize,
    pub dirs: usize,
    /// Paths left in place because another package still wants them
    pub kept: usize,
}

/// Delete one non-directory path; missing paths are fine
pub(crate) fn remove_path(root: &Path, rel: &str) -> Result<bool> {
    let path = root.join(rel);
    match fs::symlink_metadata(&path) {
        Ok(md) if md.is_dir() => {
            warn!("/{} is a directory in the tree, not removing it as a file", rel);
            Ok(false)
        }
        Ok(_) => {
            fs::remove_file(&path)
                .map_err(|e| Error::IoError(format!("Failed to remove /{}: {}", rel, e)))?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::IoError(format!("Failed to stat /{}: {}", rel, e))),
    }
}

/// Remove the files of `headers` from `root`, except paths in `keep`
pub fn remove_packages(
    root: &Path,
    headers: &[&PackageHeader],
    keep: &HashSet<String>,
    opts: &ImportOptions,
) -> Result<RemoveStats> {
    let mut stats = RemoveStats::default();
    // Deepest first, then reverse name order
    let mut dirs: BTreeSet<(Reverse<usize>, Reverse<String>)> = BTreeSet::new();

    for header in headers {
        debug!("Removing files of {}", header.nevra);
        for f in &header.files {
            let Some(rel) = tree_path(&f.path, opts) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            if keep.contains(&rel) {
                stats.kept += 1;
                continue;
            }
            if f.is_dir() {
                let depth = rel.matches('/').count();
                dirs.insert((Reverse(depth), Reverse(rel)));
            } else if remove_path(root, &rel)? {
                stats.files += 1;
            }
        }

        let fragment = TmpfilesFragment::path_for(&header.nevra.name);
        if keep.contains(&fragment) {
            stats.kept += 1;
        } else if remove_path(root, &fragment)? {
            stats.files += 1;
        }
    }

    for (_, Reverse(rel)) in dirs {
        match fs::remove_dir(root.join(&rel)) {
            Ok(()) => stats.dirs += 1,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty) => {}
            Err(e) if e.kind() == ErrorKind::NotADirectory => {
                warn!("/{} is no longer a directory, leaving it", rel);
            }
            Err(e) => return Err(Error::IoError(format!("Failed to remove /{}: {}", rel, e))),
        }
    }

    debug!(
        "Removed {} files and {} directories ({} kept)",
        stats.files, stats.dirs, stats.kept
    );
    Ok(stats)
}
