// src/import/mod.rs

//! Import pipeline: package files into cached package commits
//!
//! Each package is unpacked into its own commit under its cache branch.
//! Payload entries pass through [`filter::disposition`] first; capabilities
//! come from the header since the payload does not carry them, and
//! ownership is left for assembly, where user and group names can be looked
//! up in the target tree. Commits use the package build time as their
//! timestamp, so importing the same package twice yields the same commit.
//!
//! All imports of one run share a single store transaction: either every
//! cache branch is updated or none is.

pub mod filter;
pub mod tmpfiles;

pub use filter::{Disposition, ImportOptions};

use crate::cache_key::cache_branch_for;
use crate::error::{Error, Result};
use crate::packages::cpio::CpioReader;
use crate::packages::{PackageHeader, PackageReader, PackageRecord};
use crate::policy::{LabelPolicy, label_path};
use crate::pool::WorkerPool;
use crate::repository::SignatureVerifier;
use crate::store::{
    Commit, EntryKind, FileMeta, Metadata, MutableTree, ObjectStore, StoreTransaction,
    TransactionStats, XATTR_CAPS, XATTR_SELINUX,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tmpfiles::TmpfilesFragment;
use tracing::{debug, info};

/// Serialized package header, base64
pub const META_HEADER: &str = "pkgcache.header";
/// SHA-256 of the serialized header
pub const META_HEADER_SHA256: &str = "pkgcache.header-sha256";
pub const META_NEVRA: &str = "pkgcache.nevra";
/// Repository metadata checksum of the imported package file
pub const META_REPODATA_CHECKSUM: &str = "pkgcache.repodata-checksum";
/// Whether documentation was left out
pub const META_NODOCS: &str = "pkgcache.nodocs";
/// Checksum of the label policy the stored labels came from
pub const META_POLICY: &str = "pkgcache.policy";
pub const META_REPO: &str = "pkgcache.repo";
pub const META_UNPACK_VERSION: &str = "pkgcache.unpack-version";

/// Bumped when the import layout changes incompatibly
pub const UNPACK_VERSION: u64 = 1;

/// Read the package header stored in a package commit
pub fn commit_header(commit: &Commit) -> Result<PackageHeader> {
    let encoded = commit
        .meta_str(META_HEADER)
        .ok_or_else(|| Error::StoreError(format!("package commit lacks {}", META_HEADER)))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::StoreError(format!("corrupt {}: {}", META_HEADER, e)))?;
    PackageHeader::from_bytes(&bytes)
}

/// Outcome of importing one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedPackage {
    pub branch: String,
    pub commit: String,
}

/// Imports package files into the store
pub struct Importer<'a> {
    store: &'a dyn ObjectStore,
    reader: &'a dyn PackageReader,
    policy: Option<&'a dyn LabelPolicy>,
    verifier: Option<&'a dyn SignatureVerifier>,
    opts: ImportOptions,
}

impl<'a> Importer<'a> {
    pub fn new(store: &'a dyn ObjectStore, reader: &'a dyn PackageReader, opts: ImportOptions) -> Self {
        Self {
            store,
            reader,
            policy: None,
            verifier: None,
            opts,
        }
    }

    /// Label stored content with `policy`
    pub fn with_policy(mut self, policy: Option<&'a dyn LabelPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Verify each file with `verifier` before reading it
    pub fn with_verifier(mut self, verifier: Option<&'a dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    fn entry_meta(&self, rel: &str, mode: u32, caps: Option<&str>) -> FileMeta {
        let mut meta = FileMeta::new(mode);
        if let Some(caps) = caps.filter(|c| !c.is_empty()) {
            meta.xattrs.insert(XATTR_CAPS.to_string(), caps.to_string());
        }
        if let Some(policy) = self.policy
            && let Some(label) = policy.label(&label_path(rel), mode)
        {
            meta.xattrs.insert(XATTR_SELINUX.to_string(), label);
        }
        meta
    }

    /// Import one package file; needs an open store transaction
    pub fn import(&self, pkg: &PackageRecord, path: &Path) -> Result<ImportedPackage> {
        if let Some(verifier) = self.verifier {
            verifier.verify(pkg, path)?;
        }

        let opened = self.reader.open(path)?;
        let header = opened.header;
        if header.nevra != pkg.nevra {
            return Err(Error::VerificationFailed(format!(
                "{} contains {}, expected {}",
                path.display(),
                header.nevra,
                pkg.nevra
            )));
        }
        debug!("Importing {} from {}", pkg.nevra, path.display());

        let mut tree = MutableTree::new(self.entry_meta("", 0o40755, None));
        let mut fragment = TmpfilesFragment::new();
        // Hardlink placeholders waiting for the entry that carries the data
        let mut pending: HashMap<u32, Vec<(String, FileMeta)>> = HashMap::new();
        let mut files = 0u64;

        let corrupt = |e: std::io::Error| Error::ParseError(format!("{}: corrupt payload: {}", pkg.nevra, e));
        let mut cpio = CpioReader::new(opened.payload);
        while let Some(entry) = cpio.next_entry().map_err(corrupt)? {
            let abs = format!("/{}", entry.name);
            let hf = header.file(&abs);
            let doc = hf.is_some_and(|f| f.doc);

            let rel = match filter::disposition(&abs, doc, &self.opts).map_err(|e| e.context(&pkg.nevra))? {
                Disposition::Keep(rel) => rel,
                Disposition::Tmpfiles => {
                    let target = if entry.is_symlink() {
                        cpio.read_data().map_err(corrupt)?
                    } else {
                        Vec::new()
                    };
                    fragment.add(&abs, entry.mode, entry.size, &target, hf);
                    continue;
                }
                Disposition::Skip => continue,
            };
            let meta = self.entry_meta(&rel, entry.mode, hf.and_then(|f| f.caps.as_deref()));

            if entry.is_dir() {
                if !rel.is_empty() {
                    tree.ensure_dir(&rel, meta)?;
                }
            } else if entry.is_symlink() {
                let target = String::from_utf8(cpio.read_data().map_err(corrupt)?).map_err(|_| {
                    Error::UnsupportedContent(format!("{}: non-UTF-8 symlink target at {}", pkg.nevra, abs))
                })?;
                tree.insert(&rel, EntryKind::Symlink { target }, meta)?;
                files += 1;
            } else if entry.is_hardlink_placeholder() {
                pending.entry(entry.ino).or_default().push((rel, meta));
            } else if entry.is_regular() {
                let (content, size) = self
                    .store
                    .write_content_from(&mut cpio)
                    .map_err(|e| e.context(format!("{}: {}", pkg.nevra, abs)))?;
                for (linked, linked_meta) in pending.remove(&entry.ino).unwrap_or_default() {
                    tree.insert(&linked, EntryKind::File { content: content.clone(), size }, linked_meta)?;
                    files += 1;
                }
                tree.insert(&rel, EntryKind::File { content, size }, meta)?;
                files += 1;
            } else if self.opts.skip_unsupported {
                debug!("Skipping special file {} in {}", abs, pkg.nevra);
            } else {
                return Err(Error::UnsupportedContent(format!(
                    "{}: special file {} cannot be stored",
                    pkg.nevra, abs
                )));
            }
        }

        if let Some(ino) = pending.keys().next() {
            return Err(Error::ParseError(format!(
                "{}: hardlink group {} has no data entry",
                pkg.nevra, ino
            )));
        }

        if !fragment.is_empty() {
            let conf = TmpfilesFragment::path_for(&pkg.nevra.name);
            let text = fragment.render();
            let content = self.store.write_content(text.as_bytes())?;
            tree.insert(
                &conf,
                EntryKind::File {
                    content,
                    size: text.len() as u64,
                },
                self.entry_meta(&conf, 0o100644, None),
            )?;
        }

        let root_tree = tree.write(self.store)?;
        let commit = Commit {
            parent: None,
            subject: String::new(),
            timestamp: header.buildtime,
            root_tree,
            root_meta: tree.meta().clone(),
            metadata: self.metadata(pkg, &header)?,
        };
        let checksum = self.store.write_commit(&commit)?;
        let branch = cache_branch_for(&pkg.nevra);
        self.store.transaction_set_ref(&branch, Some(&checksum))?;

        debug!("Imported {} ({} files) as {}", pkg.nevra, files, checksum);
        Ok(ImportedPackage {
            branch,
            commit: checksum,
        })
    }

    fn metadata(&self, pkg: &PackageRecord, header: &PackageHeader) -> Result<Metadata> {
        let bytes = header.to_bytes()?;
        let mut metadata = Metadata::new();
        metadata.insert(META_NEVRA.to_string(), Value::from(pkg.nevra.to_string()));
        metadata.insert(META_HEADER.to_string(), Value::from(STANDARD.encode(&bytes)));
        metadata.insert(
            META_HEADER_SHA256.to_string(),
            Value::from(crate::hash::sha256(&bytes)),
        );
        if let Some(checksum) = &pkg.repodata_checksum {
            metadata.insert(META_REPODATA_CHECKSUM.to_string(), Value::from(checksum.clone()));
        }
        if let crate::packages::Origin::Repo(id) = &pkg.origin {
            metadata.insert(META_REPO.to_string(), Value::from(id.clone()));
        }
        metadata.insert(META_NODOCS.to_string(), Value::from(self.opts.nodocs));
        if let Some(policy) = self.policy {
            metadata.insert(META_POLICY.to_string(), Value::from(policy.checksum()));
        }
        metadata.insert(META_UNPACK_VERSION.to_string(), Value::from(UNPACK_VERSION));
        Ok(metadata)
    }
}

/// Import `packages` on `pool` in one store transaction
///
/// Any failure aborts the transaction, leaving every cache branch as it
/// was before the call.
pub fn import_all(
    pool: &WorkerPool,
    store: &dyn ObjectStore,
    importer: &Importer<'_>,
    packages: &[(PackageRecord, PathBuf)],
) -> Result<(Vec<ImportedPackage>, TransactionStats)> {
    if packages.is_empty() {
        return Ok((Vec::new(), TransactionStats::default()));
    }
    info!("Importing {} packages on {} workers", packages.len(), pool.size());

    let txn = StoreTransaction::begin(store)?;
    let imported = pool.run("import", packages, |(pkg, path)| importer.import(pkg, path))?;
    let stats = txn.commit()?;

    info!(
        "Imported {} packages ({} content objects, {} bytes)",
        imported.len(),
        stats.content_objects_written,
        stats.content_bytes_written
    );
    Ok((imported, stats))
}
