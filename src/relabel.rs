// src/relabel.rs

//! Relabel pipeline
//!
//! A cached package commit records the checksum of the policy its labels
//! came from. When the active policy differs, the package is checked out
//! into a private directory (always copying, so store content is never
//! touched), and rewritten with fresh labels if any label actually
//! changes. Otherwise only the recorded policy checksum is updated: the new
//! commit points at the same root tree.

use crate::cache_key::cache_branch_for;
use crate::error::{Error, Result};
use crate::import::META_POLICY;
use crate::packages::PackageRecord;
use crate::policy::{LabelPolicy, label_path};
use crate::pool::WorkerPool;
use crate::store::{
    CheckoutOptions, Commit, CommitModifier, EntryKind, FileOverride, ObjectStore, OverrideTable,
    StoreTransaction, TransactionStats, XATTR_CAPS, checkout_commit, walk_tree, write_directory,
};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// Full `st_mode` of a tree entry
fn entry_mode(kind: &EntryKind, perms: u32) -> u32 {
    let fmt = match kind {
        EntryKind::File { .. } => 0o100000,
        EntryKind::Symlink { .. } => 0o120000,
        EntryKind::Dir { .. } => 0o040000,
    };
    fmt | perms
}

/// Result of relabeling one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelabelOutcome {
    pub commit: String,
    /// Whether any label differed from the stored one
    pub changed: bool,
}

/// Counters for one relabel phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelabelReport {
    pub relabeled: usize,
    /// Packages whose labels actually changed
    pub changed: usize,
    pub stats: TransactionStats,
}

/// Labels recorded in `root_tree` that differ from what `policy` says, plus
/// the capability overrides needed to write it back
fn compare_labels(
    store: &dyn ObjectStore,
    root: &Commit,
    policy: &dyn LabelPolicy,
) -> Result<(usize, OverrideTable)> {
    let mut differing = 0;
    let mut overrides = OverrideTable::new();

    let wanted = policy.label("/", 0o040000 | root.root_meta.mode);
    if wanted.as_deref() != root.root_meta.label() {
        differing += 1;
    }

    walk_tree(store, &root.root_tree, &mut |rel, entry| {
        let wanted = policy.label(&label_path(rel), entry_mode(&entry.kind, entry.meta.mode));
        if wanted.as_deref() != entry.meta.label() {
            differing += 1;
        }
        if entry.meta.uid != 0 || entry.meta.gid != 0 || entry.meta.xattrs.contains_key(XATTR_CAPS) {
            overrides.insert(
                rel.to_string(),
                FileOverride {
                    uid: entry.meta.uid,
                    gid: entry.meta.gid,
                    caps: entry.meta.xattrs.get(XATTR_CAPS).cloned(),
                },
            );
        }
        Ok(())
    })?;
    Ok((differing, overrides))
}

/// Relabel the cached commit of `pkg` under `policy`; needs an open transaction
///
/// `workdir` receives a private scratch directory that is removed again.
pub fn relabel_package(
    store: &dyn ObjectStore,
    policy: &dyn LabelPolicy,
    pkg: &PackageRecord,
    workdir: &Path,
) -> Result<RelabelOutcome> {
    let branch = cache_branch_for(&pkg.nevra);
    let old = store
        .resolve_ref(&branch)?
        .ok_or_else(|| Error::NotFound(format!("cached commit for {}", pkg.nevra)))?;
    let commit = store.load_commit(&old)?;

    let (differing, overrides) = compare_labels(store, &commit, policy)?;
    let mut updated = commit.clone();
    updated
        .metadata
        .insert(META_POLICY.to_string(), Value::from(policy.checksum()));

    if differing > 0 {
        let scratch = tempfile::Builder::new()
            .prefix("relabel-")
            .tempdir_in(workdir)
            .map_err(|e| Error::IoError(format!("Failed to create scratch directory: {}", e)))?;
        let root = scratch.path().join("root");
        let opts = CheckoutOptions {
            force_copy: true,
            ..Default::default()
        };
        checkout_commit(store, &old, &root, &opts)?;

        let modifier = CommitModifier {
            policy: Some(policy),
            overrides: Some(&overrides),
            canonical_ownership: true,
        };
        let (tree, meta) = write_directory(store, &root, &modifier)?;
        updated.root_tree = tree;
        updated.root_meta = meta;
        debug!("Relabeled {} ({} labels changed)", pkg.nevra, differing);
    } else {
        debug!("Labels of {} already match, updating policy checksum only", pkg.nevra);
    }

    let checksum = store.write_commit(&updated)?;
    store.transaction_set_ref(&branch, Some(&checksum))?;
    Ok(RelabelOutcome {
        commit: checksum,
        changed: differing > 0,
    })
}

/// Relabel `packages` on `pool` in one store transaction
pub fn relabel_all(
    pool: &WorkerPool,
    store: &dyn ObjectStore,
    policy: &dyn LabelPolicy,
    packages: &[PackageRecord],
    workdir: &Path,
) -> Result<RelabelReport> {
    if packages.is_empty() {
        return Ok(RelabelReport::default());
    }
    info!("Relabeling {} packages", packages.len());

    let txn = StoreTransaction::begin(store)?;
    let outcomes = pool.run("relabel", packages, |pkg| {
        relabel_package(store, policy, pkg, workdir)
    })?;
    let stats = txn.commit()?;

    let changed = outcomes.iter().filter(|o| o.changed).count();
    info!("Relabeled {} packages ({} changed)", outcomes.len(), changed);
    Ok(RelabelReport {
        relabeled: outcomes.len(),
        changed,
        stats,
    })
}
