// src/commit.rs

//! Commit writer
//!
//! Writes an assembled root back into the store and publishes it under the
//! treespec's ref. Ownership comes from the assembly's override table, never
//! from the build host, and labels come from the active policy. The walk,
//! the commit object and the ref update share one store transaction.

use crate::assemble::AssemblyReport;
use crate::error::{Error, Result};
use crate::hash;
use crate::model::Treespec;
use crate::policy::LabelPolicy;
use crate::store::{
    Commit, CommitModifier, Metadata, ObjectStore, StoreTransaction, TransactionStats,
    validate_ref_name, write_directory,
};
use serde_json::{Value, json};
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use tracing::info;

/// Reproducibility fingerprint of the compose
pub const META_FINGERPRINT: &str = "treeforge.fingerprint";
/// Canonical treespec the tree was composed from
pub const META_TREESPEC: &str = "treeforge.treespec";
pub const META_PACKAGES: &str = "treeforge.packages";
/// Base packages removed or replaced
pub const META_REMOVED: &str = "treeforge.removed";
/// Package count and SHA-256 of the embedded package database
pub const META_RPMDB: &str = "treeforge.rpmdb";
/// Checksum of the label policy, absent when unlabeled
pub const META_POLICY: &str = "treeforge.policy";

/// Where and how to publish an assembled root
#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    pub treespec: &'a Treespec,
    pub fingerprint: &'a str,
    pub subject: String,
    /// Explicit parent; defaults to the ref's current commit
    pub parent: Option<&'a str>,
    /// Seconds since the epoch; defaults to now
    pub timestamp: Option<i64>,
    /// Package database path relative to the root
    pub rpmdb_path: &'a Path,
}

/// A published commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTree {
    pub commit: String,
    pub parent: Option<String>,
    pub stats: TransactionStats,
}

/// Fingerprint recorded on a commit
pub fn commit_fingerprint(commit: &Commit) -> Option<&str> {
    commit.meta_str(META_FINGERPRINT)
}

fn rpmdb_checksum(path: &Path) -> Result<Option<String>> {
    match File::open(path) {
        Ok(f) => Ok(Some(hash::sha256_reader(f)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn metadata(root: &Path, report: &AssemblyReport, policy: Option<&dyn LabelPolicy>, req: &CommitRequest<'_>) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    metadata.insert(META_FINGERPRINT.to_string(), Value::from(req.fingerprint));
    metadata.insert(
        META_TREESPEC.to_string(),
        serde_json::to_value(req.treespec.canonicalize())?,
    );
    let packages: Vec<String> = report.packages.iter().map(ToString::to_string).collect();
    metadata.insert(META_PACKAGES.to_string(), json!(packages));
    let removed: Vec<String> = report.removed.iter().map(ToString::to_string).collect();
    metadata.insert(META_REMOVED.to_string(), json!(removed));
    if let Some(checksum) = rpmdb_checksum(&root.join(req.rpmdb_path))? {
        metadata.insert(
            META_RPMDB.to_string(),
            json!({ "packages": report.packages.len(), "sha256": checksum }),
        );
    }
    if let Some(policy) = policy {
        metadata.insert(META_POLICY.to_string(), Value::from(policy.checksum()));
    }
    Ok(metadata)
}

/// Write `root` as a commit on the treespec's ref
pub fn write_commit(
    store: &dyn ObjectStore,
    root: &Path,
    report: &AssemblyReport,
    policy: Option<&dyn LabelPolicy>,
    req: &CommitRequest<'_>,
) -> Result<CommittedTree> {
    let ref_name = req.treespec.ref_name.as_str();
    validate_ref_name(ref_name)?;
    if !root.is_dir() {
        return Err(Error::NotFound(format!("assembled root {}", root.display())));
    }

    let parent = match req.parent {
        Some(p) => Some(p.to_string()),
        None => store.resolve_ref(ref_name)?,
    };
    let metadata = metadata(root, report, policy, req)?;

    let txn = StoreTransaction::begin(store)?;
    let modifier = CommitModifier {
        policy,
        overrides: Some(&report.overrides),
        canonical_ownership: true,
    };
    let (root_tree, root_meta) = write_directory(store, root, &modifier)?;
    let commit = Commit {
        parent: parent.clone(),
        subject: req.subject.clone(),
        timestamp: req.timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp()),
        root_tree,
        root_meta,
        metadata,
    };
    let checksum = store.write_commit(&commit)?;
    txn.set_ref(ref_name, &checksum)?;
    let stats = txn.commit()?;

    info!(
        "Committed {} as {} ({} content objects, {} bytes)",
        ref_name, checksum, stats.content_objects_written, stats.content_bytes_written
    );
    Ok(CommittedTree {
        commit: checksum,
        parent,
        stats,
    })
}
