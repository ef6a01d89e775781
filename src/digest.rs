// src/digest.rs

//! Reproducibility fingerprint
//!
//! The fingerprint covers the canonical treespec, the build options that
//! shape the tree (documentation, layout handling, colors, special packages
//! and the label policy) and, for every package the goal installs, updates,
//! downgrades or removes, its action and its own content checksum.
//! Store-local details such as commit checksums never enter it, so a
//! package resolved from a repository and the same package taken from the
//! cache hash the same.

use crate::error::Result;
use crate::hash::Hasher;
use crate::model::{TreeOptions, Treespec};
use crate::resolver::Goal;

/// Fingerprint of a treespec, the options it is built with and its resolved goal
pub fn state_fingerprint(treespec: &Treespec, options: &TreeOptions<'_>, goal: &Goal) -> Result<String> {
    let mut hasher = Hasher::new();
    hasher.update(&treespec.canonical_bytes()?);
    hasher.update(&serde_json::to_vec(options)?);

    let mut packages: Vec<_> = goal.packages.iter().collect();
    packages.sort_by(|a, b| a.nevra.cmp(&b.nevra).then(a.action.cmp(&b.action)));
    for pkg in packages {
        hasher.update_str(pkg.action.as_str());
        hasher.update_str(&pkg.nevra.to_string());
        hasher.update_str(pkg.repodata_checksum.as_deref().unwrap_or(""));
    }
    Ok(hasher.finalize())
}
