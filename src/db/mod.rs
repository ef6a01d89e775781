// src/db/mod.rs

//! Package database embedded in assembled trees
//!
//! Every tree carries a SQLite database listing the packages it contains,
//! the paths they own and their serialized headers. Assembly replays each
//! transaction into it without running any scripts, so tools inspecting
//! the tree later can tell what is installed. The database of a base tree
//! is also where removals and updates learn what they are replacing.

pub mod schema;

use crate::error::{Error, Result};
use crate::hash;
use crate::packages::{Nevra, PackageHeader};
use crate::resolver::InstalledPackage;
use crate::store::{EntryKind, ObjectStore};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// One transaction step replayed into the database
#[derive(Debug, Clone)]
pub enum DbOp<'a> {
    Install(&'a PackageHeader),
    Remove(&'a Nevra),
}

/// Handle on a tree's package database
pub struct RpmDb {
    conn: Connection,
}

impl RpmDb {
    /// Open the database at `path`, creating and migrating it as needed
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Open an existing database without modifying it
    pub fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "package database {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let version = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map_err(|e| Error::SanityCheck(format!("{} is not a package database: {}", path.display(), e)))?;
        if version > schema::SCHEMA_VERSION {
            return Err(Error::ConfigError(format!(
                "package database schema {} is newer than supported {}",
                version,
                schema::SCHEMA_VERSION
            )));
        }
        Ok(Self { conn })
    }

    fn insert(conn: &Connection, header: &PackageHeader) -> Result<()> {
        let bytes = header.to_bytes()?;
        let n = &header.nevra;
        conn.execute(
            "DELETE FROM packages WHERE name = ?1 AND arch = ?2",
            params![n.name, n.arch],
        )?;
        conn.execute(
            "INSERT INTO packages (name, epoch, version, release, arch, buildtime, header, header_sha256)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                n.name,
                n.epoch as i64,
                n.version,
                n.release,
                n.arch,
                header.buildtime,
                bytes,
                hash::sha256(&bytes)
            ],
        )?;
        let id = conn.last_insert_rowid();

        let mut file_stmt =
            conn.prepare_cached("INSERT INTO files (package_id, path, color) VALUES (?1, ?2, ?3)")?;
        for f in &header.files {
            file_stmt.execute(params![id, f.path, f.color])?;
        }
        let mut provide_stmt =
            conn.prepare_cached("INSERT INTO provides (package_id, name) VALUES (?1, ?2)")?;
        for p in &header.provides {
            provide_stmt.execute(params![id, p])?;
        }
        Ok(())
    }

    fn delete(conn: &Connection, nevra: &Nevra) -> Result<()> {
        let removed = conn.execute(
            "DELETE FROM packages
             WHERE name = ?1 AND epoch = ?2 AND version = ?3 AND release = ?4 AND arch = ?5",
            params![nevra.name, nevra.epoch as i64, nevra.version, nevra.release, nevra.arch],
        )?;
        if removed == 0 {
            return Err(Error::NotFound(format!("{} in package database", nevra)));
        }
        Ok(())
    }

    /// Replay `ops` in one database transaction
    pub fn apply(&mut self, ops: &[DbOp<'_>]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for op in ops {
            match op {
                DbOp::Install(header) => Self::insert(&tx, header)?,
                DbOp::Remove(nevra) => Self::delete(&tx, nevra)?,
            }
        }
        tx.commit()?;
        debug!("Recorded {} package database operations", ops.len());
        Ok(())
    }

    /// All packages, sorted by identity
    pub fn packages(&self) -> Result<Vec<Nevra>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, epoch, version, release, arch FROM packages
             ORDER BY name, arch",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Nevra {
                name: row.get(0)?,
                epoch: row.get::<_, i64>(1)? as u64,
                version: row.get(2)?,
                release: row.get(3)?,
                arch: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Installed packages with their provides, as resolution input
    pub fn installed(&self) -> Result<Vec<InstalledPackage>> {
        let mut out = Vec::new();
        for header in self.headers()? {
            out.push(InstalledPackage {
                nevra: header.nevra,
                provides: header.provides,
            });
        }
        Ok(out)
    }

    /// Stored headers of all packages
    pub fn headers(&self) -> Result<Vec<PackageHeader>> {
        let mut stmt = self
            .conn
            .prepare("SELECT header FROM packages ORDER BY name, arch")?;
        let blobs = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        blobs.iter().map(|b| PackageHeader::from_bytes(b)).collect()
    }

    /// Stored header of one package
    pub fn header(&self, nevra: &Nevra) -> Result<Option<PackageHeader>> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT header FROM packages
                 WHERE name = ?1 AND epoch = ?2 AND version = ?3 AND release = ?4 AND arch = ?5",
                params![nevra.name, nevra.epoch as i64, nevra.version, nevra.release, nevra.arch],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|b| PackageHeader::from_bytes(&b)).transpose()
    }

    /// Packages owning `path`
    pub fn owners(&self, path: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT p.name FROM files f JOIN packages p ON p.id = f.package_id
             WHERE f.path = ?1 ORDER BY p.name",
        )?;
        let rows = stmt.query_map([path], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Run SQLite's integrity check
    pub fn check_integrity(&self) -> Result<()> {
        let result: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if result != "ok" {
            return Err(Error::SanityCheck(format!(
                "package database integrity check failed: {}",
                result
            )));
        }
        Ok(())
    }
}

/// Headers recorded in the package database of a stored tree
///
/// Returns `None` when the tree has no database at `rel`.
pub fn headers_in_tree(store: &dyn ObjectStore, root_tree: &str, rel: &Path) -> Result<Option<Vec<PackageHeader>>> {
    let mut tree = store.load_tree(root_tree)?;
    let mut parts = rel.iter().map(|p| p.to_string_lossy().into_owned()).peekable();
    let content = loop {
        let Some(name) = parts.next() else {
            return Ok(None);
        };
        let Some(entry) = tree.get(&name) else {
            return Ok(None);
        };
        match (&entry.kind, parts.peek().is_some()) {
            (EntryKind::Dir { tree: sub }, true) => {
                let sub = sub.clone();
                tree = store.load_tree(&sub)?;
            }
            (EntryKind::File { content, .. }, false) => break content.clone(),
            _ => return Ok(None),
        }
    };

    let mut tmp = tempfile::Builder::new().prefix("rpmdb-").suffix(".sqlite").tempfile()?;
    tmp.write_all(&store.read_content(&content)?)?;
    tmp.flush()?;
    let db = RpmDb::open_readonly(tmp.path())?;
    let headers = db.headers()?;
    debug!("Read {} packages from stored database {}", headers.len(), rel.display());
    Ok(Some(headers))
}
