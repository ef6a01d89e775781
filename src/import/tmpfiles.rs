// src/import/tmpfiles.rs

//! tmpfiles.d fragments for runtime paths
//!
//! Content under `/var` and `/run` is not stored in the tree. Directories
//! and symlinks become `d` and `L` lines so they are created at boot;
//! empty regular files become `f` lines. Non-empty files cannot be
//! expressed and are dropped with a warning.

use crate::packages::HeaderFile;
use tracing::warn;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Directory holding generated fragments, relative to the tree root
pub const TMPFILES_DIR: &str = "usr/lib/tmpfiles.d";

/// Accumulates tmpfiles.d lines for one package
#[derive(Debug, Default)]
pub struct TmpfilesFragment {
    lines: Vec<String>,
}

impl TmpfilesFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Add one packaged entry of `size` bytes; `target` is the symlink target
    pub fn add(&mut self, path: &str, mode: u32, size: u64, target: &[u8], header: Option<&HeaderFile>) {
        let user = header.map_or("root", |h| h.user.as_str());
        let group = header.map_or("root", |h| h.group.as_str());
        let perms = mode & 0o7777;

        match mode & S_IFMT {
            S_IFDIR => self
                .lines
                .push(format!("d {} {:04o} {} {} - -", path, perms, user, group)),
            S_IFLNK => {
                let target = String::from_utf8_lossy(target);
                self.lines.push(format!("L {} - - - - {}", path, target));
            }
            S_IFREG if size == 0 => self
                .lines
                .push(format!("f {} {:04o} {} {} - -", path, perms, user, group)),
            _ => warn!("Ignoring non-directory/non-symlink {} in runtime directory", path),
        }
    }

    /// Fragment path for package `name`, relative to the tree root
    pub fn path_for(name: &str) -> String {
        format!("{}/pkg-{}.conf", TMPFILES_DIR, name)
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}
