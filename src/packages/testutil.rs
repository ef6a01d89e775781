// src/packages/testutil.rs

//! Package files for unit tests
//!
//! A test package is a length-prefixed JSON header followed by a newc
//! payload, read back by [`BundleReader`].

pub use super::cpio::testutil::{Member, file, write_newc};

use super::{OpenedPackage, PackageHeader, PackageReader};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

pub fn bundle(header: &PackageHeader, members: &[Member<'_>]) -> Vec<u8> {
    let json = header.to_bytes().unwrap();
    let mut out = (json.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(&json);
    out.extend_from_slice(&write_newc(members));
    out
}

/// Write a test package named after its identity into `dir`
pub fn write_bundle(dir: &Path, header: &PackageHeader, members: &[Member<'_>]) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(header.nevra.filename());
    std::fs::write(&path, bundle(header, members)).unwrap();
    path
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BundleReader;

impl PackageReader for BundleReader {
    fn open(&self, path: &Path) -> Result<OpenedPackage> {
        let data = std::fs::read(path)
            .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
        if data.len() < 4 {
            return Err(Error::ParseError(path.display().to_string()));
        }
        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let header = PackageHeader::from_bytes(&data[4..4 + len])?;
        let payload = data[4 + len..].to_vec();
        Ok(OpenedPackage {
            header,
            payload: Box::new(std::io::Cursor::new(payload)),
        })
    }
}
