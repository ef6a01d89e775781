// src/resolver/mod.rs

//! Package set resolution
//!
//! A [`Resolver`] turns a request (names to install, names to remove, local
//! package files, and the packages already in the base tree) into a
//! [`Goal`]: the ordered list of [`PackageRecord`]s the engine acts on.
//! [`DirectoryResolver`] resolves against `repodata.json` indexes; the
//! dependency graph in [`graph`] is shared with install ordering.

mod engine;
pub mod graph;

pub use engine::DirectoryResolver;
pub use graph::DependencyGraph;

use crate::error::Result;
use crate::packages::{Nevra, PackageRecord};

/// A package file given directly, with the header fields resolution needs
#[derive(Debug, Clone)]
pub struct LocalPackage {
    pub record: PackageRecord,
    pub requires: Vec<String>,
    pub provides: Vec<String>,
}

/// A package of the base tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub nevra: Nevra,
    pub provides: Vec<String>,
}

/// Input to resolution
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    /// Names, or full `name-[epoch:]version-release.arch` identities, to install
    pub install: Vec<String>,
    /// Names of base packages to remove
    pub remove: Vec<String>,
    pub local: Vec<LocalPackage>,
    pub installed: Vec<InstalledPackage>,
}

/// Resolved package set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Goal {
    pub packages: Vec<PackageRecord>,
}

impl Goal {
    /// Packages whose content goes into the tree
    pub fn installs(&self) -> impl Iterator<Item = &PackageRecord> {
        self.packages.iter().filter(|p| p.action.is_install())
    }

    /// Base packages leaving the tree
    pub fn removals(&self) -> impl Iterator<Item = &PackageRecord> {
        self.packages.iter().filter(|p| p.action.is_removal())
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Produces the package set for a request
pub trait Resolver: Send + Sync {
    fn resolve(&self, request: &ResolveRequest) -> Result<Goal>;
}
