// src/packages/rpm.rs

//! RPM package reader

use super::header::{HeaderFile, HeaderScript, PackageHeader, ScriptKind};
use super::{Nevra, OpenedPackage, PackageReader};
use crate::compression;
use crate::error::{Error, Result};
use rpm::Package;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// Reads `.rpm` files with the `rpm` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct RpmReader;

impl RpmReader {
    pub fn new() -> Self {
        Self
    }

    fn extract_scripts(pkg: &Package) -> Vec<HeaderScript> {
        let mut scripts = Vec::new();

        let mut add = |kind: ScriptKind, result: std::result::Result<rpm::Scriptlet, rpm::Error>| {
            if let Ok(s) = result {
                if s.script.is_empty() {
                    return;
                }
                let interpreter = s
                    .program
                    .and_then(|progs| progs.first().cloned())
                    .unwrap_or_else(|| "/bin/sh".to_string());
                scripts.push(HeaderScript {
                    kind,
                    interpreter,
                    body: s.script,
                    prefixes: Vec::new(),
                });
            }
        };

        add(ScriptKind::PreIn, pkg.metadata.get_pre_install_script());
        add(ScriptKind::PostIn, pkg.metadata.get_post_install_script());
        add(ScriptKind::PostTrans, pkg.metadata.get_post_trans_script());

        scripts
    }

    fn extract_files(pkg: &Package) -> Vec<HeaderFile> {
        use rpm::FileFlags;

        let Ok(entries) = pkg.metadata.get_file_entries() else {
            return Vec::new();
        };

        entries
            .into_iter()
            .map(|entry| {
                let mut file = HeaderFile::new(&entry.path.to_string_lossy(), entry.mode.raw_mode() as u32);
                file.user = entry.ownership.user.clone();
                file.group = entry.ownership.group.clone();
                file.caps = entry.caps.clone().filter(|c| !c.is_empty());
                file.doc = entry.flags.contains(FileFlags::DOC);
                file.config = entry.flags.contains(FileFlags::CONFIG);
                file.ghost = entry.flags.contains(FileFlags::GHOST);
                file.digest = entry.digest.as_ref().map(|d| format!("{}", d));
                file.linkto = Some(entry.linkto.clone()).filter(|l| !l.is_empty());
                file
            })
            .collect()
    }

    fn parse_header(pkg: &Package) -> Result<PackageHeader> {
        let field = |what: &str, r: std::result::Result<&str, rpm::Error>| {
            r.map(str::to_string)
                .map_err(|e| Error::ParseError(format!("Failed to get package {}: {}", what, e)))
        };

        let name = field("name", pkg.metadata.get_name())?;
        let version = field("version", pkg.metadata.get_version())?;
        let release = field("release", pkg.metadata.get_release())?;
        let arch = field("arch", pkg.metadata.get_arch())?;
        let epoch = pkg.metadata.get_epoch().map(u64::from).unwrap_or(0);

        let mut header = PackageHeader::new(Nevra {
            name,
            epoch,
            version,
            release,
            arch,
        });
        header.buildtime = pkg.metadata.get_build_time().map(|t| t as i64).unwrap_or(0);
        header.files = Self::extract_files(pkg);
        header.scripts = Self::extract_scripts(pkg);

        if let Ok(requires) = pkg.metadata.get_requires() {
            header.requires = requires
                .into_iter()
                .map(|d| d.name)
                .filter(|n| !n.starts_with("rpmlib("))
                .collect();
        }
        if let Ok(provides) = pkg.metadata.get_provides() {
            header.provides = provides.into_iter().map(|d| d.name).collect();
        }

        Ok(header)
    }
}

impl PackageReader for RpmReader {
    fn open(&self, path: &Path) -> Result<OpenedPackage> {
        debug!("Parsing RPM package: {}", path.display());

        let file = File::open(path)
            .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
        let mut buf_reader = BufReader::new(file);

        let pkg = Package::parse(&mut buf_reader)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))?;

        let header = Self::parse_header(&pkg)?;
        let payload = compression::decoder_for_payload(pkg.content)?;

        Ok(OpenedPackage { header, payload })
    }
}
