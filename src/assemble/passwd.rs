// src/assemble/passwd.rs

//! User and group lookup inside the tree, and the temporary `/etc` swap
//!
//! Package headers name owners by user and group name. The numeric ids
//! come from the tree being assembled, never from the build host.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where account databases are looked up, first match wins
const PASSWD_FILES: &[&str] = &["usr/etc/passwd", "etc/passwd", "usr/lib/passwd"];
const GROUP_FILES: &[&str] = &["usr/etc/group", "etc/group", "usr/lib/group"];

/// Name to id maps read from a tree
#[derive(Debug, Clone, Default)]
pub struct Accounts {
    users: HashMap<String, u32>,
    groups: HashMap<String, u32>,
}

/// Parse `name:x:id:...` lines; later duplicates do not override earlier ones
fn parse_ids(text: &str, into: &mut HashMap<String, u32>) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let (Some(name), Some(_), Some(id)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        match id.parse::<u32>() {
            Ok(id) => {
                into.entry(name.to_string()).or_insert(id);
            }
            Err(_) => warn!("Ignoring malformed account line '{}'", line),
        }
    }
}

fn load_into(root: &Path, files: &[&str], into: &mut HashMap<String, u32>) -> Result<()> {
    for rel in files {
        match fs::read_to_string(root.join(rel)) {
            Ok(text) => parse_ids(&text, into),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::IoError(format!("Failed to read /{}: {}", rel, e))),
        }
    }
    Ok(())
}

impl Accounts {
    /// Read the account databases of the tree at `root`
    pub fn load(root: &Path) -> Result<Self> {
        let mut accounts = Self::default();
        load_into(root, PASSWD_FILES, &mut accounts.users)?;
        load_into(root, GROUP_FILES, &mut accounts.groups)?;
        debug!(
            "Loaded {} users and {} groups from {}",
            accounts.users.len(),
            accounts.groups.len(),
            root.display()
        );
        Ok(accounts)
    }

    pub fn uid(&self, name: &str) -> Result<u32> {
        if name == "root" {
            return Ok(0);
        }
        self.users
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("user '{}' in tree passwd", name)))
    }

    pub fn gid(&self, name: &str) -> Result<u32> {
        if name == "root" {
            return Ok(0);
        }
        self.groups
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("group '{}' in tree group", name)))
    }
}

/// Moves `usr/etc` to `etc` while scripts run
///
/// Scripts expect configuration under `/etc`. The move is undone by
/// [`TempEtcGuard::restore`], or on drop if an error unwinds first.
pub struct TempEtcGuard {
    root: PathBuf,
    active: bool,
}

impl TempEtcGuard {
    pub fn enter(root: &Path) -> Result<Self> {
        let usr_etc = root.join("usr/etc");
        let etc = root.join("etc");
        let active = usr_etc.is_dir() && fs::symlink_metadata(&etc).is_err();
        if active {
            fs::rename(&usr_etc, &etc)
                .map_err(|e| Error::IoError(format!("Failed to move usr/etc into place: {}", e)))?;
            debug!("Moved usr/etc to etc for scripts");
        }
        Ok(Self {
            root: root.to_path_buf(),
            active,
        })
    }

    fn put_back(&self) -> Result<()> {
        let etc = self.root.join("etc");
        let usr_etc = self.root.join("usr/etc");
        // Scripts may also create /etc from scratch
        if etc.is_dir() && !etc.is_symlink() && fs::symlink_metadata(&usr_etc).is_err() {
            fs::rename(&etc, &usr_etc)
                .map_err(|e| Error::IoError(format!("Failed to move etc back to usr/etc: {}", e)))?;
        }
        Ok(())
    }

    pub fn restore(mut self) -> Result<()> {
        self.active = false;
        self.put_back()
    }
}

impl Drop for TempEtcGuard {
    fn drop(&mut self) {
        if self.active
            && let Err(e) = self.put_back()
        {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_accounts_from_tree() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("usr/etc")).unwrap();
        fs::create_dir_all(root.path().join("usr/lib")).unwrap();
        fs::write(
            root.path().join("usr/etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\n# comment\ntss:x:59:59::/dev/null:/sbin/nologin\nbad:x:nope\n",
        )
        .unwrap();
        fs::write(root.path().join("usr/lib/passwd"), "tss:x:999:999::/:/bin/false\nchrony:x:992:987::/:/bin/false\n").unwrap();
        fs::write(root.path().join("usr/etc/group"), "wheel:x:10:\n").unwrap();

        let accounts = Accounts::load(root.path()).unwrap();
        assert_eq!(accounts.uid("root").unwrap(), 0);
        assert_eq!(accounts.uid("tss").unwrap(), 59);
        assert_eq!(accounts.uid("chrony").unwrap(), 992);
        assert_eq!(accounts.gid("wheel").unwrap(), 10);
        assert!(matches!(accounts.uid("bad"), Err(Error::NotFound(_))));
        assert!(matches!(accounts.gid("nobody"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_temp_etc_guard() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("usr/etc")).unwrap();
        fs::write(root.path().join("usr/etc/hostname"), "box\n").unwrap();

        let guard = TempEtcGuard::enter(root.path()).unwrap();
        assert!(root.path().join("etc/hostname").exists());
        assert!(!root.path().join("usr/etc").exists());
        fs::write(root.path().join("etc/added"), "x").unwrap();
        guard.restore().unwrap();

        assert!(root.path().join("usr/etc/added").exists());
        assert!(!root.path().join("etc").exists());
    }

    #[test]
    fn test_temp_etc_guard_restores_on_drop() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("usr/etc")).unwrap();
        {
            let _guard = TempEtcGuard::enter(root.path()).unwrap();
            assert!(root.path().join("etc").is_dir());
        }
        assert!(root.path().join("usr/etc").is_dir());
        assert!(!root.path().join("etc").exists());
    }
}
