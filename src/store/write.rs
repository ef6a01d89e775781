// src/store/write.rs

//! Writing an on-disk directory into the store

use super::{EntryKind, FileMeta, MutableTree, ObjectStore, XATTR_CAPS, XATTR_SELINUX};
use crate::error::{Error, Result};
use crate::policy::{LabelPolicy, label_path};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{debug, warn};

/// Ownership and capabilities a checkout cannot carry on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOverride {
    pub uid: u32,
    pub gid: u32,
    pub caps: Option<String>,
}

/// Overrides keyed by tree-relative path (no leading slash)
pub type OverrideTable = HashMap<String, FileOverride>;

/// Adjusts metadata while a directory is written
#[derive(Clone, Copy, Default)]
pub struct CommitModifier<'a> {
    pub policy: Option<&'a dyn LabelPolicy>,
    pub overrides: Option<&'a OverrideTable>,
    /// Record uid/gid 0 instead of on-disk ownership unless overridden
    pub canonical_ownership: bool,
}

impl CommitModifier<'_> {
    fn meta_for(&self, rel: &str, md: &fs::Metadata) -> FileMeta {
        let mut meta = FileMeta::new(md.mode());
        if !self.canonical_ownership {
            meta.uid = md.uid();
            meta.gid = md.gid();
        }
        if let Some(o) = self.overrides.and_then(|t| t.get(rel)) {
            meta.uid = o.uid;
            meta.gid = o.gid;
            if let Some(caps) = &o.caps {
                meta.xattrs.insert(XATTR_CAPS.to_string(), caps.clone());
            }
        }
        if let Some(policy) = self.policy
            && let Some(label) = policy.label(&label_path(rel), md.mode())
        {
            meta.xattrs.insert(XATTR_SELINUX.to_string(), label);
        }
        meta
    }
}

/// Walk `root` into tree objects; returns the root tree checksum and metadata
///
/// Sockets, fifos and device nodes are skipped.
pub fn write_directory(
    store: &dyn ObjectStore,
    root: &Path,
    modifier: &CommitModifier<'_>,
) -> Result<(String, FileMeta)> {
    let root_md = fs::symlink_metadata(root)
        .map_err(|e| Error::IoError(format!("Failed to stat {}: {}", root.display(), e)))?;
    let mut tree = MutableTree::new(modifier.meta_for("", &root_md));
    let mut count = 0u64;
    add_dir(store, root, "", modifier, &mut tree, &mut count)?;
    let checksum = tree.write(store)?;
    debug!("Wrote {} entries from {} as tree {}", count, root.display(), checksum);
    Ok((checksum, tree.meta().clone()))
}

fn add_dir(
    store: &dyn ObjectStore,
    dir: &Path,
    prefix: &str,
    modifier: &CommitModifier<'_>,
    tree: &mut MutableTree,
    count: &mut u64,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", dir.display(), e)))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().into_string().map_err(|n| {
            Error::InvalidPath(format!("non-UTF-8 name {:?} in {}", n, dir.display()))
        })?;
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let path = entry.path();
        let md = fs::symlink_metadata(&path)?;
        let ft = md.file_type();
        let meta = modifier.meta_for(&rel, &md);

        if ft.is_dir() {
            tree.ensure_dir(&rel, meta)?;
            add_dir(store, &path, &rel, modifier, tree, count)?;
        } else if ft.is_file() {
            let data = fs::read(&path)
                .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
            let content = store.write_content(&data)?;
            tree.insert(
                &rel,
                EntryKind::File {
                    content,
                    size: data.len() as u64,
                },
                meta,
            )?;
        } else if ft.is_symlink() {
            let target = fs::read_link(&path)?;
            let target = target.to_str().ok_or_else(|| {
                Error::InvalidPath(format!("non-UTF-8 symlink target at {}", path.display()))
            })?;
            tree.insert(
                &rel,
                EntryKind::Symlink {
                    target: target.to_string(),
                },
                meta,
            )?;
        } else {
            warn!("Skipping special file /{}", rel);
            continue;
        }
        *count += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{FsRepo, StoreTransaction, walk_tree};
    use super::*;
    use std::os::unix::fs::{PermissionsExt, symlink};
    use tempfile::TempDir;

    struct FixedPolicy(&'static str);

    impl LabelPolicy for FixedPolicy {
        fn checksum(&self) -> &str {
            self.0
        }
        fn label(&self, path: &str, _mode: u32) -> Option<String> {
            Some(format!("{}:{}", self.0, path))
        }
    }

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::create_dir_all(root.join("usr/etc")).unwrap();
        fs::write(root.join("usr/bin/tool"), b"bin").unwrap();
        fs::set_permissions(root.join("usr/bin/tool"), fs::Permissions::from_mode(0o4755)).unwrap();
        fs::write(root.join("usr/etc/conf"), b"conf").unwrap();
        symlink("tool", root.join("usr/bin/alias")).unwrap();
    }

    fn entries(repo: &FsRepo, tree: &str) -> HashMap<String, FileMeta> {
        let mut out = HashMap::new();
        walk_tree(repo, tree, &mut |path, entry| {
            out.insert(path.to_string(), entry.meta.clone());
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_write_directory_canonical() {
        let temp_dir = TempDir::new().unwrap();
        let repo = FsRepo::create(temp_dir.path().join("repo")).unwrap();
        let root = temp_dir.path().join("root");
        populate(&root);

        let mut overrides = OverrideTable::new();
        overrides.insert(
            "usr/bin/tool".to_string(),
            FileOverride {
                uid: 0,
                gid: 22,
                caps: Some("cap_net_raw=ep".to_string()),
            },
        );
        let policy = FixedPolicy("p1");
        let modifier = CommitModifier {
            policy: Some(&policy),
            overrides: Some(&overrides),
            canonical_ownership: true,
        };

        let _txn = StoreTransaction::begin(&repo).unwrap();
        let (tree, _) = write_directory(&repo, &root, &modifier).unwrap();
        let metas = entries(&repo, &tree);

        let tool = &metas["usr/bin/tool"];
        assert_eq!(tool.mode, 0o4755);
        assert_eq!(tool.gid, 22);
        assert_eq!(tool.xattrs[XATTR_CAPS], "cap_net_raw=ep");
        assert_eq!(tool.label(), Some("p1:/usr/bin/tool"));
        assert_eq!(metas["usr/etc/conf"].label(), Some("p1:/etc/conf"));
        assert_eq!(metas["usr/etc/conf"].uid, 0);
        assert!(metas.contains_key("usr/bin/alias"));
    }

    #[test]
    fn test_labels_do_not_change_content() {
        let temp_dir = TempDir::new().unwrap();
        let repo = FsRepo::create(temp_dir.path().join("repo")).unwrap();
        let root = temp_dir.path().join("root");
        populate(&root);

        let _txn = StoreTransaction::begin(&repo).unwrap();
        let with = |p: &'static str| {
            let policy = FixedPolicy(p);
            let modifier = CommitModifier {
                policy: Some(&policy),
                canonical_ownership: true,
                ..Default::default()
            };
            write_directory(&repo, &root, &modifier).unwrap().0
        };
        let a = with("p1");
        let b = with("p2");
        assert_ne!(a, b);

        let content = |tree: &str| {
            let mut out = Vec::new();
            walk_tree(&repo, tree, &mut |_, entry| {
                if let EntryKind::File { content, .. } = &entry.kind {
                    out.push(content.clone());
                }
                Ok(())
            })
            .unwrap();
            out
        };
        assert_eq!(content(&a), content(&b));
    }
}
