// src/packages/mod.rs

//! Package identities, resolver records and package file readers
//!
//! The resolver hands the engine a list of [`PackageRecord`]s. Package files
//! are opened through a [`PackageReader`], which yields a normalized
//! [`PackageHeader`] plus the uncompressed cpio payload.

pub mod cpio;
pub mod header;
pub mod rpm;
#[cfg(test)]
pub(crate) mod testutil;

pub use header::{HeaderFile, HeaderScript, PackageHeader, ScriptKind};
pub use rpm::RpmReader;

use crate::error::{Error, Result};
use crate::version::{RpmVersion, rpmvercmp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Full package identity: name, epoch, version, release, architecture
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nevra {
    pub name: String,
    #[serde(default)]
    pub epoch: u64,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl Nevra {
    pub fn new(name: &str, epoch: u64, version: &str, release: &str, arch: &str) -> Self {
        Self {
            name: name.to_string(),
            epoch,
            version: version.to_string(),
            release: release.to_string(),
            arch: arch.to_string(),
        }
    }

    /// `[epoch:]version-release`, with a zero epoch omitted
    pub fn evr(&self) -> String {
        if self.epoch > 0 {
            format!("{}:{}-{}", self.epoch, self.version, self.release)
        } else {
            format!("{}-{}", self.version, self.release)
        }
    }

    /// Conventional package file name, which never carries the epoch
    pub fn filename(&self) -> String {
        format!("{}-{}-{}.{}.rpm", self.name, self.version, self.release, self.arch)
    }

    /// Compare epoch, version and release with rpm semantics
    pub fn cmp_evr(&self, other: &Nevra) -> std::cmp::Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| rpmvercmp(&self.version, &other.version))
            .then_with(|| rpmvercmp(&self.release, &other.release))
    }

    /// Parse `name-[epoch:]version-release.arch`
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::ParseError(format!("Invalid package identity '{}'", s));

        let (nevr, arch) = s.rsplit_once('.').ok_or_else(bad)?;
        let (nev, _) = nevr.rsplit_once('-').ok_or_else(bad)?;
        let (name, _) = nev.rsplit_once('-').ok_or_else(bad)?;
        let evr = RpmVersion::parse(&nevr[name.len() + 1..]).map_err(|_| bad())?;
        let release = evr.release.filter(|r| !r.is_empty()).ok_or_else(bad)?;

        if name.is_empty() || arch.is_empty() {
            return Err(bad());
        }

        Ok(Self::new(name, evr.epoch, &evr.version, &release, arch))
    }
}

impl fmt::Display for Nevra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}.{}", self.name, self.evr(), self.arch)
    }
}

/// What the resolver decided to do with a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Install,
    Update,
    Downgrade,
    Remove,
    Obsolete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Downgrade => "downgrade",
            Self::Remove => "remove",
            Self::Obsolete => "obsolete",
        }
    }

    /// Whether this action puts the package's content into the tree
    pub fn is_install(&self) -> bool {
        matches!(self, Self::Install | Self::Update | Self::Downgrade)
    }

    /// Whether this action takes a package out of the tree
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Remove | Self::Obsolete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a resolved package comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// A remote repository, by id
    Repo(String),
    /// A package file given directly on the command line
    Local,
    /// A package that only exists in the object store cache
    Cache,
    /// A package already part of the base tree
    Installed,
}

impl Origin {
    /// Local and cache packages carry no repository metadata of their own
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local | Self::Cache)
    }
}

/// A package as produced by the resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub nevra: Nevra,
    pub origin: Origin,
    #[serde(default)]
    pub size: u64,
    /// Checksum recorded in repository metadata, as `type:hex`
    #[serde(default)]
    pub repodata_checksum: Option<String>,
    pub action: Action,
    /// Package file on local disk, when already present
    #[serde(default)]
    pub location: Option<PathBuf>,
    /// The base package this one replaces (updates and downgrades)
    #[serde(default)]
    pub replaces: Option<Nevra>,
}

impl PackageRecord {
    pub fn new(nevra: Nevra, origin: Origin, action: Action) -> Self {
        Self {
            nevra,
            origin,
            size: 0,
            repodata_checksum: None,
            action,
            location: None,
            replaces: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.nevra.name
    }

    /// The package file, if it exists on local disk
    pub fn local_path(&self) -> Option<&Path> {
        self.location.as_deref().filter(|p| p.exists())
    }
}

/// An opened package file
pub struct OpenedPackage {
    pub header: PackageHeader,
    /// Uncompressed newc cpio payload
    pub payload: Box<dyn Read + Send>,
}

/// Opens package files for import
pub trait PackageReader: Send + Sync {
    fn open(&self, path: &Path) -> Result<OpenedPackage>;
}
