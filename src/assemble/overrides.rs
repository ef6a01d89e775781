// src/assemble/overrides.rs

//! Ownership and capability overrides
//!
//! A checkout cannot always reproduce ownership (the build may not run as
//! root) and never carries capabilities, so both are tracked in an
//! [`OverrideTable`] that the commit writer applies when the tree is
//! written back. Files are also chowned on disk when possible so scripts
//! see the right owners. A file about to be changed in place is first
//! given its own inode: a hardlinked checkout shares it with the store.

use super::disposition::FileDisposition;
use super::passwd::Accounts;
use crate::error::{Error, Result};
use crate::import::ImportOptions;
use crate::import::filter::tree_path;
use crate::packages::PackageHeader;
use crate::store::{FileOverride, ObjectStore, OverrideTable, XATTR_CAPS, walk_tree};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Record the non-default ownership and capabilities of a stored tree
///
/// Entries of `tree` with plain root ownership clear any earlier override
/// for the same path, so laying a tree over the table leaves it matching
/// the tree.
pub fn seed_from_tree(store: &dyn ObjectStore, tree: &str, table: &mut OverrideTable) -> Result<()> {
    walk_tree(store, tree, &mut |rel, entry| {
        let caps = entry.meta.xattrs.get(XATTR_CAPS).cloned();
        if entry.meta.uid != 0 || entry.meta.gid != 0 || caps.is_some() {
            table.insert(
                rel.to_string(),
                FileOverride {
                    uid: entry.meta.uid,
                    gid: entry.meta.gid,
                    caps,
                },
            );
        } else {
            table.remove(rel);
        }
        Ok(())
    })
}

/// Give a regular file its own inode if it shares one
pub fn break_hardlink(path: &Path) -> Result<bool> {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if !md.is_file() || md.nlink() < 2 {
        return Ok(false);
    }
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidPath(format!("{} has no parent", path.display())))?;
    let tmp = tempfile::Builder::new()
        .prefix(".treeforge-unlink-")
        .tempfile_in(dir)?;
    fs::copy(path, tmp.path())
        .map_err(|e| Error::IoError(format!("Failed to copy {}: {}", path.display(), e)))?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(md.mode() & 0o7777))?;
    tmp.persist(path)
        .map_err(|e| Error::IoError(format!("Failed to replace {}: {}", path.display(), e.error)))?;
    Ok(true)
}

/// Break every shared regular file below `dir`
pub fn break_hardlinks_in(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| Error::IoError(format!("Failed to walk {}: {}", dir.display(), e)))?;
        if entry.file_type().is_file() && break_hardlink(entry.path())? {
            count += 1;
        }
    }
    if count > 0 {
        debug!("Broke {} hardlinks under {}", count, dir.display());
    }
    Ok(count)
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Apply the header ownership and capabilities of newly installed packages
///
/// Paths `disposition` left out of a package's checkout belong to another
/// package and are not touched. Returns how many files carry an override
/// afterwards.
pub fn apply_header_overrides(
    root: &Path,
    headers: &[&PackageHeader],
    disposition: &FileDisposition,
    table: &mut OverrideTable,
    opts: &ImportOptions,
) -> Result<usize> {
    let accounts = Accounts::load(root)?;
    let chown = is_root();
    let mut applied = 0;

    for header in headers {
        let skip = disposition.skip_for(&header.nevra);
        for f in &header.files {
            let Some(rel) = tree_path(&f.path, opts) else {
                continue;
            };
            if skip.is_some_and(|s| s.contains(&rel)) {
                continue;
            }
            if !f.needs_override() {
                table.remove(&rel);
                continue;
            }
            let path = root.join(&rel);
            let md = match fs::symlink_metadata(&path) {
                Ok(md) => md,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if f.ghost {
                        continue;
                    }
                    return Err(Error::NotFound(format!(
                        "{}: override target {} is missing",
                        header.nevra, f.path
                    )));
                }
                Err(e) => return Err(e.into()),
            };

            let uid = accounts.uid(&f.user).map_err(|e| e.context(&header.nevra))?;
            let gid = accounts.gid(&f.group).map_err(|e| e.context(&header.nevra))?;
            let caps = f.caps.clone().filter(|c| !c.is_empty());

            if chown {
                break_hardlink(&path)?;
                std::os::unix::fs::lchown(&path, Some(uid), Some(gid))
                    .map_err(|e| Error::IoError(format!("Failed to chown {}: {}", path.display(), e)))?;
                if !md.file_type().is_symlink() {
                    // chown drops setuid and setgid bits
                    fs::set_permissions(&path, fs::Permissions::from_mode(md.mode() & 0o7777))?;
                }
            }
            table.insert(rel, FileOverride { uid, gid, caps });
            applied += 1;
        }
    }
    debug!("Applied {} ownership overrides", applied);
    Ok(table.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::{HeaderFile, Nevra};
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("usr/etc")).unwrap();
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        fs::write(root.path().join("usr/etc/passwd"), "root:x:0:0::/root:/bin/sh\ntss:x:59:59::/:/sbin/nologin\n").unwrap();
        fs::write(root.path().join("usr/etc/group"), "root:x:0:\ntss:x:59:\n").unwrap();
        fs::write(root.path().join("usr/bin/ping"), "ping").unwrap();
        fs::write(root.path().join("usr/bin/plain"), "plain").unwrap();
        root
    }

    #[test]
    fn test_overrides_from_header() {
        let root = tree();
        let mut h = PackageHeader::new(Nevra::new("iputils", 0, "1", "1", "x86_64"));
        let mut ping = HeaderFile::new("/usr/bin/ping", 0o100755);
        ping.caps = Some("cap_net_raw=ep".to_string());
        ping.group = "tss".to_string();
        h.files.push(ping);
        h.files.push(HeaderFile::new("/usr/bin/plain", 0o100755));
        let mut ghost = HeaderFile::new("/usr/bin/ghosted", 0o100644);
        ghost.ghost = true;
        ghost.user = "tss".to_string();
        h.files.push(ghost);

        let mut table = OverrideTable::new();
        table.insert(
            "usr/bin/plain".to_string(),
            FileOverride { uid: 5, gid: 5, caps: None },
        );
        let none = FileDisposition::default();
        let n = apply_header_overrides(root.path(), &[&h], &none, &mut table, &ImportOptions::default()).unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            table["usr/bin/ping"],
            FileOverride {
                uid: 0,
                gid: 59,
                caps: Some("cap_net_raw=ep".to_string())
            }
        );
        assert!(!table.contains_key("usr/bin/plain"));
    }

    #[test]
    fn test_missing_target_and_unknown_user() {
        let root = tree();
        let mut h = PackageHeader::new(Nevra::new("x", 0, "1", "1", "x86_64"));
        let mut f = HeaderFile::new("/usr/bin/absent", 0o100755);
        f.user = "tss".to_string();
        h.files.push(f);
        let mut table = OverrideTable::new();
        let none = FileDisposition::default();
        assert!(matches!(
            apply_header_overrides(root.path(), &[&h], &none, &mut table, &ImportOptions::default()),
            Err(Error::NotFound(_))
        ));

        let mut h = PackageHeader::new(Nevra::new("y", 0, "1", "1", "x86_64"));
        let mut f = HeaderFile::new("/usr/bin/ping", 0o100755);
        f.user = "nobody-here".to_string();
        h.files.push(f);
        assert!(apply_header_overrides(root.path(), &[&h], &none, &mut table, &ImportOptions::default()).is_err());
    }

    #[test]
    fn test_skipped_paths_keep_the_winning_override() {
        let root = tree();
        let mut table = OverrideTable::new();
        table.insert(
            "usr/bin/ping".to_string(),
            FileOverride {
                uid: 0,
                gid: 59,
                caps: Some("cap_net_raw=ep".to_string()),
            },
        );

        // The losing multilib copy and a file outside the transaction color
        let mut h = PackageHeader::new(Nevra::new("iputils", 0, "1", "1", "i686"));
        let mut ping = HeaderFile::new("/usr/bin/ping", 0o100755);
        ping.caps = Some("cap_net_admin=ep".to_string());
        h.files.push(ping);
        let mut uncolored = HeaderFile::new("/usr/bin/ping32", 0o100755);
        uncolored.user = "tss".to_string();
        h.files.push(uncolored);

        let mut disposition = FileDisposition::default();
        disposition.skip.insert(
            h.nevra.clone(),
            ["usr/bin/ping".to_string(), "usr/bin/ping32".to_string()]
                .into_iter()
                .collect(),
        );
        let n = apply_header_overrides(root.path(), &[&h], &disposition, &mut table, &ImportOptions::default())
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(table["usr/bin/ping"].caps.as_deref(), Some("cap_net_raw=ep"));
        assert!(!table.contains_key("usr/bin/ping32"));
    }

    #[test]
    fn test_break_hardlink() {
        let root = tree();
        let a = root.path().join("usr/bin/plain");
        let b = root.path().join("usr/bin/linked");
        fs::hard_link(&a, &b).unwrap();
        fs::set_permissions(&b, fs::Permissions::from_mode(0o4755)).unwrap();

        assert!(break_hardlink(&b).unwrap());
        assert!(!break_hardlink(&b).unwrap());
        let md = fs::metadata(&b).unwrap();
        assert_eq!(md.nlink(), 1);
        assert_eq!(md.mode() & 0o7777, 0o4755);
        assert_eq!(fs::metadata(&a).unwrap().nlink(), 1);

        fs::write(&b, "changed").unwrap();
        assert_eq!(fs::read_to_string(&a).unwrap(), "plain");

        fs::hard_link(&a, root.path().join("usr/etc/shared")).unwrap();
        assert_eq!(break_hardlinks_in(&root.path().join("usr/etc")).unwrap(), 1);
    }
}
