// src/assemble/disposition.rs

//! Transaction-wide file disposition
//!
//! On multilib systems two packages may ship the same path in different
//! colors (32-bit and 64-bit ELF). Which copy ends up in the tree depends
//! on every package the transaction removes, keeps and installs, so this
//! is computed once for the whole transaction before the scratch root is
//! touched:
//!
//! - a removed file stays on disk when a surviving package still owns the
//!   path, or when it is the preferred color and a new package only brings
//!   a non-preferred copy
//! - a new file is skipped when another owner holds a preferred copy and
//!   this one is not preferred, or when its color is outside the
//!   transaction color
//! - an existing non-preferred file is deleted before checkout when a new
//!   package brings the preferred copy

use crate::import::ImportOptions;
use crate::import::filter::tree_path;
use crate::packages::{Nevra, PackageHeader};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Color settings of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorPolicy {
    /// Colors the transaction may contain
    pub transaction: u32,
    /// Color that wins a path shared by different colors
    pub preferred: u32,
}

impl ColorPolicy {
    fn is_preferred(&self, color: u32) -> bool {
        color & self.preferred != 0
    }

    /// Whether a file of color `a` beats one of color `b` at the same path
    fn beats(&self, a: u32, b: u32) -> bool {
        a != 0 && b != 0 && a != b && self.is_preferred(a) && !self.is_preferred(b)
    }
}

/// Result of the analysis, keyed by tree-relative path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDisposition {
    /// Paths of leaving packages that must not be deleted
    pub keep: HashSet<String>,
    /// Per new package, paths left out of its checkout
    pub skip: HashMap<Nevra, HashSet<String>>,
    /// Existing paths deleted before checkout so a preferred copy can take their place
    pub replace: HashSet<String>,
}

impl FileDisposition {
    pub fn skip_for(&self, nevra: &Nevra) -> Option<&HashSet<String>> {
        self.skip.get(nevra).filter(|s| !s.is_empty())
    }

    pub fn skipped(&self) -> usize {
        self.skip.values().map(HashSet::len).sum()
    }
}

/// Analyze a transaction
///
/// `base` holds every package of the base tree and `leaving` the identities
/// among them that are removed or replaced; `new` holds the packages being
/// installed.
pub fn analyze(
    base: &[PackageHeader],
    leaving: &HashSet<Nevra>,
    new: &[&PackageHeader],
    colors: ColorPolicy,
    opts: &ImportOptions,
) -> FileDisposition {
    let mut out = FileDisposition::default();

    // Paths present on disk after removal, with the colors of their copies
    let mut surviving: HashMap<String, Vec<u32>> = HashMap::new();
    for h in base.iter().filter(|h| !leaving.contains(&h.nevra)) {
        for f in h.files.iter().filter(|f| !f.ghost) {
            if let Some(p) = tree_path(&f.path, opts) {
                surviving.entry(p).or_default().push(if f.is_dir() { 0 } else { f.color });
            }
        }
    }

    let mut incoming: HashMap<String, Vec<(usize, u32)>> = HashMap::new();
    for (i, h) in new.iter().enumerate() {
        for f in h.files.iter().filter(|f| !f.ghost && !f.is_dir()) {
            if let Some(p) = tree_path(&f.path, opts) {
                incoming.entry(p).or_default().push((i, f.color));
            }
        }
    }

    for h in base.iter().filter(|h| leaving.contains(&h.nevra)) {
        for f in h.files.iter().filter(|f| !f.ghost) {
            let Some(p) = tree_path(&f.path, opts) else {
                continue;
            };
            if surviving.contains_key(&p) {
                out.keep.insert(p);
                continue;
            }
            if f.is_dir() {
                continue;
            }
            let outranked = incoming
                .get(&p)
                .is_some_and(|copies| copies.iter().any(|&(_, cn)| colors.beats(f.color, cn)));
            if outranked {
                surviving.entry(p.clone()).or_default().push(f.color);
                out.keep.insert(p);
            }
        }
    }

    for (i, h) in new.iter().enumerate() {
        let mut skip = HashSet::new();
        for f in h.files.iter().filter(|f| !f.ghost && !f.is_dir()) {
            let cn = f.color;
            if cn == 0 {
                continue;
            }
            let Some(p) = tree_path(&f.path, opts) else {
                continue;
            };
            if cn & colors.transaction == 0 {
                skip.insert(p);
                continue;
            }
            let on_disk = surviving.get(&p).map(Vec::as_slice).unwrap_or_default();
            let others = incoming
                .get(&p)
                .into_iter()
                .flatten()
                .filter(|&&(j, _)| j != i)
                .map(|&(_, c)| c);
            let beaten = on_disk.iter().copied().chain(others).any(|co| colors.beats(co, cn));
            if beaten {
                skip.insert(p);
            } else if on_disk.iter().any(|&co| colors.beats(cn, co)) {
                out.replace.insert(p);
            }
        }
        if !skip.is_empty() {
            out.skip.insert(h.nevra.clone(), skip);
        }
    }

    debug!(
        "File disposition: {} kept, {} skipped, {} replaced",
        out.keep.len(),
        out.skipped(),
        out.replace.len()
    );
    out
}
