// src/repository/download.rs

//! Package download
//!
//! The engine asks a [`DownloadQueue`] for package files and gets back
//! local paths. [`DirectoryMirror`] serves repositories that are plain
//! directories (a local mirror or an NFS export), copying files into the
//! package directory in parallel and checking each against the checksum
//! in repository metadata.

use crate::error::{Error, Result};
use crate::hash;
use crate::packages::{Origin, PackageRecord};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::metadata::parse_checksum;

/// Result of one download batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Local file per requested package, in request order
    pub paths: Vec<PathBuf>,
    pub bytes: u64,
}

/// Fetches package files for the import phase
pub trait DownloadQueue: Send + Sync {
    fn download(&self, packages: &[PackageRecord], dest_dir: &Path) -> Result<DownloadReport>;
}

/// Serves packages from repository directories on the local filesystem
#[derive(Debug, Clone, Default)]
pub struct DirectoryMirror {
    repos: HashMap<String, PathBuf>,
}

impl DirectoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the directory backing repository `id`
    pub fn add_repo(&mut self, id: &str, dir: &Path) {
        self.repos.insert(id.to_string(), dir.to_path_buf());
    }

    fn source_path(&self, pkg: &PackageRecord) -> Result<PathBuf> {
        let Origin::Repo(id) = &pkg.origin else {
            return Err(Error::InvariantViolation(format!(
                "{} has no repository to download from",
                pkg.nevra
            )));
        };
        let dir = self
            .repos
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("repository '{}'", id)))?;
        Ok(dir.join(pkg.nevra.filename()))
    }

    fn fetch_one(&self, pkg: &PackageRecord, dest_dir: &Path) -> Result<(PathBuf, u64)> {
        let src = self.source_path(pkg)?;
        let dest = dest_dir.join(pkg.nevra.filename());
        debug!("Fetching {} from {}", pkg.nevra, src.display());

        let bytes = fs::copy(&src, &dest).map_err(|e| {
            Error::IoError(format!("Failed to fetch {}: {}", src.display(), e))
        })?;

        // Remove a bad file so it is not mistaken for a cached download
        if let Some(expected) = &pkg.repodata_checksum
            && let Err(e) = verify_checksum(&dest, expected)
        {
            let _ = fs::remove_file(&dest);
            return Err(e);
        }
        Ok((dest, bytes))
    }
}

impl DownloadQueue for DirectoryMirror {
    fn download(&self, packages: &[PackageRecord], dest_dir: &Path) -> Result<DownloadReport> {
        if packages.is_empty() {
            return Ok(DownloadReport::default());
        }
        fs::create_dir_all(dest_dir)?;

        let total_size: u64 = packages.iter().map(|p| p.size).sum();
        info!(
            "Downloading {} packages ({:.2} MB total)...",
            packages.len(),
            total_size as f64 / 1_048_576.0
        );

        let results: Vec<(PathBuf, u64)> = packages
            .par_iter()
            .map(|pkg| self.fetch_one(pkg, dest_dir))
            .collect::<Result<_>>()?;

        let bytes = results.iter().map(|(_, b)| b).sum();
        Ok(DownloadReport {
            paths: results.into_iter().map(|(p, _)| p).collect(),
            bytes,
        })
    }
}

/// Verify a file against a `type:hex` checksum
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    debug!("Verifying checksum for {}", path.display());
    let (_, expected_hex) = parse_checksum(expected)?;
    let file = fs::File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
    let actual = hash::sha256_reader(file)?;
    if actual != expected_hex {
        return Err(Error::ChecksumMismatch {
            what: path.display().to_string(),
            expected: expected_hex.to_string(),
            actual,
        });
    }
    Ok(())
}
