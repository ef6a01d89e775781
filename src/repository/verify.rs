// src/repository/verify.rs

//! Package verification before import

use crate::error::{Error, Result};
use crate::packages::PackageRecord;
use std::path::Path;
use tracing::debug;

use super::download::verify_checksum;

/// Verifies a package file before its content enters the store
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, pkg: &PackageRecord, path: &Path) -> Result<()>;
}

/// Checks package files against the checksum recorded in repository metadata
///
/// Packages without repository metadata (local files, cache-only packages)
/// have nothing to check against and pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestVerifier;

impl SignatureVerifier for DigestVerifier {
    fn verify(&self, pkg: &PackageRecord, path: &Path) -> Result<()> {
        match &pkg.repodata_checksum {
            Some(expected) if !pkg.origin.is_local() => {
                verify_checksum(path, expected).map_err(|e| match e {
                    Error::ChecksumMismatch { expected, actual, .. } => Error::VerificationFailed(
                        format!("{}: digest {} does not match {}", pkg.nevra, actual, expected),
                    ),
                    other => other,
                })?;
                debug!("Verified {}", pkg.nevra);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::packages::{Action, Nevra, Origin};
    use tempfile::TempDir;

    #[test]
    fn test_digest_verifier() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("p.rpm");
        std::fs::write(&path, b"package").unwrap();

        let mut pkg = PackageRecord::new(
            Nevra::new("p", 0, "1", "1", "noarch"),
            Origin::Repo("r".to_string()),
            Action::Install,
        );
        pkg.repodata_checksum = Some(format!("sha256:{}", hash::sha256(b"package")));
        assert!(DigestVerifier.verify(&pkg, &path).is_ok());

        pkg.repodata_checksum = Some(format!("sha256:{}", hash::sha256(b"other")));
        assert!(matches!(
            DigestVerifier.verify(&pkg, &path),
            Err(Error::VerificationFailed(_))
        ));

        pkg.origin = Origin::Local;
        assert!(DigestVerifier.verify(&pkg, &path).is_ok());
    }
}
