// src/store/tree.rs

//! In-memory tree building and stored-tree traversal

use super::{EntryKind, FileMeta, ObjectStore, Tree, TreeEntry};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Node {
    Leaf(EntryKind, FileMeta),
    Dir(MutableTree),
}

/// A directory tree assembled in memory and written bottom-up
///
/// Intermediate directories that are never given explicit metadata get
/// mode 0755, owned by root.
#[derive(Debug, Clone)]
pub struct MutableTree {
    meta: FileMeta,
    children: BTreeMap<String, Node>,
}

impl Default for MutableTree {
    fn default() -> Self {
        Self::new(FileMeta::new(0o755))
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    if parts.iter().any(|c| *c == "..") {
        return Err(Error::PathTraversal(path.to_string()));
    }
    Ok(parts)
}

impl MutableTree {
    pub fn new(meta: FileMeta) -> Self {
        Self {
            meta,
            children: BTreeMap::new(),
        }
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn dir_mut(&mut self, components: &[&str], path: &str) -> Result<&mut MutableTree> {
        let mut cur = self;
        for comp in components {
            let node = cur
                .children
                .entry((*comp).to_string())
                .or_insert_with(|| Node::Dir(MutableTree::default()));
            cur = match node {
                Node::Dir(tree) => tree,
                Node::Leaf(..) => {
                    return Err(Error::FileTypeConflict(format!(
                        "'{}' is not a directory in {}",
                        comp, path
                    )));
                }
            };
        }
        Ok(cur)
    }

    /// Create a directory (and its parents), setting its metadata
    pub fn ensure_dir(&mut self, path: &str, meta: FileMeta) -> Result<()> {
        let parts = split_path(path)?;
        if parts.is_empty() {
            self.meta = meta;
            return Ok(());
        }
        let dir = self.dir_mut(&parts, path)?;
        dir.meta = meta;
        Ok(())
    }

    /// Insert a file or symlink, replacing any previous leaf at that path
    pub fn insert(&mut self, path: &str, kind: EntryKind, meta: FileMeta) -> Result<()> {
        if matches!(kind, EntryKind::Dir { .. }) {
            return Err(Error::InvariantViolation(format!(
                "directory entry inserted as leaf at {}",
                path
            )));
        }
        let parts = split_path(path)?;
        let Some((name, parents)) = parts.split_last() else {
            return Err(Error::InvalidPath(format!("empty path '{}'", path)));
        };
        let dir = self.dir_mut(parents, path)?;
        if let Some(Node::Dir(_)) = dir.children.get(*name) {
            return Err(Error::FileTypeConflict(format!(
                "{} is a directory, cannot replace with a file",
                path
            )));
        }
        dir.children.insert((*name).to_string(), Node::Leaf(kind, meta));
        Ok(())
    }

    /// Write every subtree to the store; returns the root tree checksum
    pub fn write(&self, store: &dyn ObjectStore) -> Result<String> {
        let mut entries = Vec::with_capacity(self.children.len());
        for (name, node) in &self.children {
            let entry = match node {
                Node::Leaf(kind, meta) => TreeEntry {
                    name: name.clone(),
                    kind: kind.clone(),
                    meta: meta.clone(),
                },
                Node::Dir(sub) => TreeEntry {
                    name: name.clone(),
                    kind: EntryKind::Dir {
                        tree: sub.write(store)?,
                    },
                    meta: sub.meta.clone(),
                },
            };
            entries.push(entry);
        }
        store.write_tree(&Tree { entries })
    }
}

/// Visit every entry below `tree` in depth-first name order
///
/// The callback receives the path relative to the tree root (no leading
/// slash) and the entry. Directories are visited before their contents.
pub fn walk_tree<F>(store: &dyn ObjectStore, tree: &str, f: &mut F) -> Result<()>
where
    F: FnMut(&str, &TreeEntry) -> Result<()>,
{
    walk_inner(store, tree, "", f)
}

fn walk_inner<F>(store: &dyn ObjectStore, tree: &str, prefix: &str, f: &mut F) -> Result<()>
where
    F: FnMut(&str, &TreeEntry) -> Result<()>,
{
    let tree = store.load_tree(tree)?;
    for entry in &tree.entries {
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", prefix, entry.name)
        };
        f(&path, entry)?;
        if let EntryKind::Dir { tree } = &entry.kind {
            walk_inner(store, tree, &path, f)?;
        }
    }
    Ok(())
}
