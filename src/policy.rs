// src/policy.rs

//! Security label policy
//!
//! A policy maps an absolute path and file mode to a label. The engine only
//! needs two things from it: labels for the files it writes, and a checksum
//! identifying the policy so cached package commits can tell whether their
//! labels are stale.
//!
//! [`FileContextsPolicy`] reads the SELinux `file_contexts` text format:
//!
//! ```text
//! /usr/bin(/.*)?         system_u:object_r:bin_t:s0
//! /etc/shadow        --  system_u:object_r:shadow_t:s0
//! /var/run           -l  system_u:object_r:var_run_t:s0
//! /tmp/.*                <<none>>
//! ```
//!
//! The last matching line wins.

use crate::error::{Error, Result};
use crate::hash;
use regex::Regex;
use std::path::Path;
use tracing::debug;

const S_IFMT: u32 = 0o170000;

/// Opaque label policy with a stable checksum
pub trait LabelPolicy: Send + Sync {
    /// Identifies the policy contents; equal checksums mean equal labels
    fn checksum(&self) -> &str;

    /// Label for an absolute path with the given full `st_mode`
    fn label(&self, path: &str, mode: u32) -> Option<String>;
}

/// Path under which a tree-relative path is labeled
///
/// Trees keep configuration under `usr/etc`; it is labeled as `/etc`.
pub fn label_path(rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if rel == "usr/etc" {
        "/etc".to_string()
    } else if let Some(rest) = rel.strip_prefix("usr/etc/") {
        format!("/etc/{}", rest)
    } else {
        format!("/{}", rel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileType {
    Any,
    Regular,
    Dir,
    Symlink,
    Char,
    Block,
    Socket,
    Fifo,
}

impl FileType {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "--" => Self::Regular,
            "-d" => Self::Dir,
            "-l" => Self::Symlink,
            "-c" => Self::Char,
            "-b" => Self::Block,
            "-s" => Self::Socket,
            "-p" => Self::Fifo,
            _ => return None,
        })
    }

    fn matches(self, mode: u32) -> bool {
        let fmt = mode & S_IFMT;
        match self {
            Self::Any => true,
            Self::Regular => fmt == 0o100000,
            Self::Dir => fmt == 0o040000,
            Self::Symlink => fmt == 0o120000,
            Self::Char => fmt == 0o020000,
            Self::Block => fmt == 0o060000,
            Self::Socket => fmt == 0o140000,
            Self::Fifo => fmt == 0o010000,
        }
    }
}

struct Rule {
    regex: Regex,
    file_type: FileType,
    /// `None` for `<<none>>`
    context: Option<String>,
}

/// Policy loaded from a `file_contexts` file
pub struct FileContextsPolicy {
    rules: Vec<Rule>,
    checksum: String,
}

impl FileContextsPolicy {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read policy {}: {}", path.display(), e))
        })?;
        let policy = Self::parse(&text)?;
        debug!(
            "Loaded label policy {} ({} rules, checksum {})",
            path.display(),
            policy.rules.len(),
            policy.checksum
        );
        Ok(policy)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (pattern, file_type, context) = match fields.as_slice() {
                [p, c] => (*p, FileType::Any, *c),
                [p, t, c] => {
                    let ft = FileType::parse(t).ok_or_else(|| {
                        Error::ConfigError(format!(
                            "policy line {}: unknown file type '{}'",
                            lineno + 1,
                            t
                        ))
                    })?;
                    (*p, ft, *c)
                }
                _ => {
                    return Err(Error::ConfigError(format!(
                        "policy line {}: expected 2 or 3 fields",
                        lineno + 1
                    )));
                }
            };
            let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                Error::ConfigError(format!("policy line {}: {}", lineno + 1, e))
            })?;
            rules.push(Rule {
                regex,
                file_type,
                context: (context != "<<none>>").then(|| context.to_string()),
            });
        }

        Ok(Self {
            rules,
            checksum: hash::sha256(text.as_bytes()),
        })
    }
}

impl LabelPolicy for FileContextsPolicy {
    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn label(&self, path: &str, mode: u32) -> Option<String> {
        self.rules
            .iter()
            .rev()
            .find(|r| r.file_type.matches(mode) && r.regex.is_match(path))
            .and_then(|r| r.context.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTEXTS: &str = "\
# comment
/.*                     system_u:object_r:default_t:s0
/usr(/.*)?              system_u:object_r:usr_t:s0
/usr/bin(/.*)?          system_u:object_r:bin_t:s0
/etc/shadow         --  system_u:object_r:shadow_t:s0
/tmp/.*                 <<none>>
";

    #[test]
    fn test_last_match_wins() {
        let policy = FileContextsPolicy::parse(CONTEXTS).unwrap();
        assert_eq!(
            policy.label("/usr/bin/ls", 0o100755).as_deref(),
            Some("system_u:object_r:bin_t:s0")
        );
        assert_eq!(
            policy.label("/usr/share", 0o040755).as_deref(),
            Some("system_u:object_r:usr_t:s0")
        );
        assert_eq!(
            policy.label("/opt", 0o040755).as_deref(),
            Some("system_u:object_r:default_t:s0")
        );
    }

    #[test]
    fn test_file_type_and_none() {
        let policy = FileContextsPolicy::parse(CONTEXTS).unwrap();
        assert_eq!(
            policy.label("/etc/shadow", 0o100000).as_deref(),
            Some("system_u:object_r:shadow_t:s0")
        );
        // Directory named shadow does not match the `--` rule
        assert_eq!(
            policy.label("/etc/shadow", 0o040755).as_deref(),
            Some("system_u:object_r:default_t:s0")
        );
        assert_eq!(policy.label("/tmp/x", 0o100644), None);
    }

    #[test]
    fn test_checksum_tracks_text() {
        let a = FileContextsPolicy::parse(CONTEXTS).unwrap();
        let b = FileContextsPolicy::parse(CONTEXTS).unwrap();
        let c = FileContextsPolicy::parse("/.* system_u:object_r:etc_t:s0\n").unwrap();
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn test_parse_errors() {
        assert!(FileContextsPolicy::parse("/x -q ctx\n").is_err());
        assert!(FileContextsPolicy::parse("/x\n").is_err());
        assert!(FileContextsPolicy::parse("/x( ctx\n").is_err());
    }

    #[test]
    fn test_label_path() {
        assert_eq!(label_path("usr/etc/passwd"), "/etc/passwd");
        assert_eq!(label_path("usr/etc"), "/etc");
        assert_eq!(label_path("usr/bin/ls"), "/usr/bin/ls");
        assert_eq!(label_path("usr/etcetera"), "/usr/etcetera");
    }
}
