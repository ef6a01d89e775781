// src/import/filter.rs

//! Path translation for imported package content
//!
//! Package payloads use the traditional filesystem layout. Trees keep all
//! read-only content under `/usr`, so every packaged path is either moved
//! into place, turned into a tmpfiles.d directive, or left out:
//!
//! - `/etc` becomes `usr/etc` and `/boot` becomes `usr/lib/ostree-boot`
//! - `/opt` becomes `usr/lib/opt` when relocation is enabled
//! - `/run` and `/var` content becomes tmpfiles.d lines, except the package
//!   database under `/var/lib/rpm`
//! - documentation is dropped when building without docs
//! - anything else outside `/usr` (and the `/bin`, `/lib` style symlink
//!   roots) is unsupported

use crate::error::{Error, Result};
use tracing::warn;

/// Options that change which packaged paths end up in the tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    pub nodocs: bool,
    pub skip_unsupported: bool,
    pub relocate_opt: bool,
}

/// What happens to one packaged path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Store under this tree-relative path
    Keep(String),
    /// Describe in a tmpfiles.d fragment instead of storing content
    Tmpfiles,
    /// Leave out of the tree
    Skip,
}

/// Whether an absolute path may appear in a tree as-is
pub fn is_compliant(path: &str) -> bool {
    if matches!(path, "/" | "/usr" | "/bin" | "/sbin" | "/lib" | "/lib64") {
        return true;
    }
    if ["/bin/", "/sbin/", "/lib/", "/lib64/"]
        .iter()
        .any(|p| path.starts_with(p))
    {
        return true;
    }
    path.starts_with("/usr/") && !is_under(path, "/usr/local")
}

fn is_under(path: &str, dir: &str) -> bool {
    path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

fn reroot(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        Some(to.to_string())
    } else {
        path.strip_prefix(from)
            .filter(|rest| rest.starts_with('/'))
            .map(|rest| format!("{}{}", to, rest))
    }
}

/// Decide what happens to packaged path `path` (absolute)
pub fn disposition(path: &str, doc: bool, opts: &ImportOptions) -> Result<Disposition> {
    if !path.starts_with('/') || path.split('/').any(|c| c == "..") {
        return Err(Error::PathTraversal(path.to_string()));
    }
    if opts.nodocs && doc {
        return Ok(Disposition::Skip);
    }
    if path == "/run" || path == "/var" || is_under(path, "/var/lib/rpm") {
        return Ok(Disposition::Skip);
    }
    if is_under(path, "/run") || is_under(path, "/var") {
        return Ok(Disposition::Tmpfiles);
    }

    let translated = reroot(path, "/etc", "/usr/etc")
        .or_else(|| reroot(path, "/boot", "/usr/lib/ostree-boot"))
        .or_else(|| {
            opts.relocate_opt
                .then(|| reroot(path, "/opt", "/usr/lib/opt"))
                .flatten()
        })
        .unwrap_or_else(|| path.to_string());

    if !is_compliant(&translated) {
        if opts.skip_unsupported {
            warn!("Skipping unsupported path {}", path);
            return Ok(Disposition::Skip);
        }
        return Err(Error::UnsupportedContent(format!(
            "{} is outside the supported filesystem layout",
            path
        )));
    }
    Ok(Disposition::Keep(
        translated.trim_start_matches('/').to_string(),
    ))
}

/// Tree-relative location of packaged path `path`, if it is stored at all
pub fn tree_path(path: &str, opts: &ImportOptions) -> Option<String> {
    match disposition(path, false, &ImportOptions { nodocs: false, ..*opts }) {
        Ok(Disposition::Keep(rel)) => Some(rel),
        _ => None,
    }
}
