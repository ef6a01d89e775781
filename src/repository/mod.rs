// src/repository/mod.rs

//! Repositories: metadata indexes, package download and verification
//!
//! This module provides functionality for:
//! - Loading and generating `repodata.json` indexes
//! - Downloading packages through a [`DownloadQueue`]
//! - Verifying package files before import

mod download;
pub mod metadata;
mod verify;

pub use download::{DirectoryMirror, DownloadQueue, DownloadReport, verify_checksum};
pub use metadata::{
    LocalRepository, PackageMetadata, RepositoryMetadata, format_checksum, generate_index,
};
pub use verify::{DigestVerifier, SignatureVerifier};
