// src/repository/metadata.rs

//! Repository metadata data structures
//!
//! A repository is a directory of package files plus a `repodata.json`
//! index describing them. The index carries everything the resolver needs
//! without opening package files, including each file's checksum.

use crate::error::{Error, Result};
use crate::hash;
use crate::packages::{Nevra, PackageReader};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Index file name inside a repository directory
pub const INDEX_FILE: &str = "repodata.json";

/// Repository metadata format (simple JSON index)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    pub name: String,
    pub packages: Vec<PackageMetadata>,
}

/// Package metadata in repository index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub nevra: Nevra,
    /// Checksum of the package file, as `sha256:<hex>`
    pub checksum: String,
    pub size: u64,
    /// File name relative to the repository directory
    pub location: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub obsoletes: Vec<String>,
}

impl PackageMetadata {
    /// Whether this package satisfies a dependency name
    pub fn provides(&self, what: &str) -> bool {
        self.nevra.name == what || self.provides.iter().any(|p| p == what)
    }
}

/// A repository directory with its parsed index
#[derive(Debug, Clone)]
pub struct LocalRepository {
    pub id: String,
    pub dir: PathBuf,
    pub metadata: RepositoryMetadata,
}

impl LocalRepository {
    /// Load the index of the repository at `dir`
    pub fn load(id: &str, dir: &Path) -> Result<Self> {
        let index = dir.join(INDEX_FILE);
        let bytes = fs::read(&index).map_err(|e| {
            Error::IoError(format!("Failed to read repository index {}: {}", index.display(), e))
        })?;
        let metadata: RepositoryMetadata = serde_json::from_slice(&bytes)?;
        debug!(
            "Loaded repository '{}' from {} ({} packages)",
            id,
            dir.display(),
            metadata.packages.len()
        );
        Ok(Self {
            id: id.to_string(),
            dir: dir.to_path_buf(),
            metadata,
        })
    }

    pub fn package_path(&self, pkg: &PackageMetadata) -> PathBuf {
        self.dir.join(&pkg.location)
    }
}

/// Format a file checksum the way repository indexes record it
pub fn format_checksum(hex: &str) -> String {
    format!("sha256:{}", hex)
}

/// Split `type:hex` into its parts; a bare hex digest is taken as SHA-256
pub fn parse_checksum(checksum: &str) -> Result<(&str, &str)> {
    let (kind, hex) = checksum.split_once(':').unwrap_or(("sha256", checksum));
    if kind != "sha256" {
        return Err(Error::VerificationFailed(format!(
            "unsupported checksum type '{}'",
            kind
        )));
    }
    if !hash::is_sha256_hex(hex) {
        return Err(Error::VerificationFailed(format!("malformed checksum '{}'", checksum)));
    }
    Ok((kind, hex))
}

/// Scan `dir` for package files and write its `repodata.json`
pub fn generate_index(dir: &Path, name: &str, reader: &dyn PackageReader) -> Result<RepositoryMetadata> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "rpm"))
        .collect();
    files.sort();

    let mut packages = Vec::with_capacity(files.len());
    for path in files {
        let opened = match reader.open(&path) {
            Ok(o) => o,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let header = opened.header;
        let checksum = hash::sha256_reader(fs::File::open(&path)?)?;
        let size = fs::metadata(&path)?.len();
        let location = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        packages.push(PackageMetadata {
            nevra: header.nevra,
            checksum: format_checksum(&checksum),
            size,
            location,
            requires: header.requires,
            provides: header.provides,
            obsoletes: Vec::new(),
        });
    }

    let metadata = RepositoryMetadata {
        name: name.to_string(),
        packages,
    };
    fs::write(dir.join(INDEX_FILE), serde_json::to_vec_pretty(&metadata)?)?;
    info!(
        "Indexed {} packages in {}",
        metadata.packages.len(),
        dir.display()
    );
    Ok(metadata)
}
