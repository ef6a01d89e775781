// src/packages/header.rs

//! Normalized package header
//!
//! The header is everything the assembly engine needs from a package after
//! its content has been imported: the file list with ownership, colors and
//! flags, install-time scripts, and dependency names for ordering. It is
//! serialized into the package commit's metadata so that a cached package
//! can be installed without the original package file.

use super::Nevra;
use crate::error::Result;
use crate::hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// File color: no ELF class
pub const COLOR_NONE: u32 = 0;
/// File color: 32-bit ELF
pub const COLOR_32: u32 = 1;
/// File color: 64-bit ELF
pub const COLOR_64: u32 = 2;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// One file entry from the package header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderFile {
    /// Absolute path as packaged, e.g. `/etc/foo.conf`
    pub path: String,
    /// Full `st_mode` including the file type bits
    pub mode: u32,
    #[serde(default = "root_name")]
    pub user: String,
    #[serde(default = "root_name")]
    pub group: String,
    /// File capabilities in text form, e.g. `cap_net_raw=ep`
    #[serde(default)]
    pub caps: Option<String>,
    #[serde(default)]
    pub doc: bool,
    #[serde(default)]
    pub config: bool,
    #[serde(default)]
    pub ghost: bool,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub linkto: Option<String>,
}

fn root_name() -> String {
    "root".to_string()
}

impl HeaderFile {
    pub fn new(path: &str, mode: u32) -> Self {
        Self {
            path: path.to_string(),
            mode,
            user: root_name(),
            group: root_name(),
            caps: None,
            doc: false,
            config: false,
            ghost: false,
            color: COLOR_NONE,
            digest: None,
            linkto: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Whether ownership or capabilities differ from what a plain checkout produces
    pub fn needs_override(&self) -> bool {
        self.user != "root" || self.group != "root" || self.caps.as_deref().is_some_and(|c| !c.is_empty())
    }
}

/// Install-time script slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptKind {
    /// `%pre`, run before any overrides are applied
    PreIn,
    /// `%post`, run after the package's overrides
    PostIn,
    /// `%posttrans`, run once all packages are in place
    PostTrans,
    /// `%transfiletriggerin`, run when the transaction touched a watched prefix
    TransFileTriggerIn,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreIn => "%prein",
            Self::PostIn => "%post",
            Self::PostTrans => "%posttrans",
            Self::TransFileTriggerIn => "%transfiletriggerin",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A script carried in the header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderScript {
    pub kind: ScriptKind,
    pub interpreter: String,
    pub body: String,
    /// Path prefixes watched by file triggers
    #[serde(default)]
    pub prefixes: Vec<String>,
}

/// Normalized header of one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageHeader {
    pub nevra: Nevra,
    /// Build time in seconds since the epoch
    #[serde(default)]
    pub buildtime: i64,
    #[serde(default)]
    pub files: Vec<HeaderFile>,
    #[serde(default)]
    pub scripts: Vec<HeaderScript>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
}

impl PackageHeader {
    pub fn new(nevra: Nevra) -> Self {
        Self {
            nevra,
            buildtime: 0,
            files: Vec::new(),
            scripts: Vec::new(),
            requires: Vec::new(),
            provides: Vec::new(),
        }
    }

    /// Serialized header bytes, as stored in commit metadata and the package database
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// SHA-256 of the serialized header
    pub fn sha256(&self) -> Result<String> {
        Ok(hash::sha256(&self.to_bytes()?))
    }

    pub fn file(&self, path: &str) -> Option<&HeaderFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn script(&self, kind: ScriptKind) -> Option<&HeaderScript> {
        self.scripts.iter().find(|s| s.kind == kind)
    }
}
