// src/classify.rs

//! Package classification against the cache
//!
//! Decides for each package of a resolved goal whether its cached commit
//! can be used as is, needs relabeling under the active policy, or has to
//! be imported (and possibly downloaded) again. A cached commit only
//! counts when it is complete, was imported from the same repository
//! content, and was built with the same documentation setting.

use crate::cache_key::cache_branch_for;
use crate::error::{Error, Result};
use crate::import::{META_NODOCS, META_POLICY, META_REPODATA_CHECKSUM};
use crate::packages::{Nevra, PackageRecord};
use crate::policy::LabelPolicy;
use crate::resolver::Goal;
use crate::store::ObjectStore;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Cache status of one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheState {
    /// No usable commit; the package must be imported
    Absent,
    /// The cached commit can be checked out directly
    Satisfied { commit: String },
    /// The cached commit's labels come from a different policy
    NeedsRelabel { commit: String },
}

/// Working partition of one assembly run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingInstallSet {
    /// Every package whose content goes into the tree, in goal order
    pub install: Vec<PackageRecord>,
    pub to_download: Vec<PackageRecord>,
    pub to_import: Vec<PackageRecord>,
    pub to_relabel: Vec<PackageRecord>,
    /// Base packages leaving the tree: name to full identity
    pub to_remove: BTreeMap<String, Nevra>,
    /// New identity to the base identity it replaces
    pub to_replace: BTreeMap<Nevra, Nevra>,
}

impl PendingInstallSet {
    /// Whether every installed package has a usable commit
    pub fn is_satisfied(&self) -> bool {
        self.to_download.is_empty() && self.to_import.is_empty() && self.to_relabel.is_empty()
    }
}

/// Look up the cache state of `pkg`
///
/// Partial commits, repository checksum changes and a different nodocs
/// setting all make a cached commit unusable; none of them is an error.
pub fn cache_state(
    store: &dyn ObjectStore,
    pkg: &PackageRecord,
    policy: Option<&dyn LabelPolicy>,
    nodocs: bool,
) -> Result<CacheState> {
    let branch = cache_branch_for(&pkg.nevra);
    let Some(checksum) = store.resolve_ref(&branch)? else {
        return Ok(CacheState::Absent);
    };
    if store.is_partial(&checksum)? {
        warn!("Cached {} is partial, re-importing", pkg.nevra);
        return Ok(CacheState::Absent);
    }
    let commit = store.load_commit(&checksum)?;

    if !pkg.origin.is_local()
        && let Some(expected) = &pkg.repodata_checksum
        && commit.meta_str(META_REPODATA_CHECKSUM) != Some(expected.as_str())
    {
        warn!("Cached {} was imported from different content", pkg.nevra);
        return Ok(CacheState::Absent);
    }

    if commit.meta_bool(META_NODOCS).unwrap_or(false) != nodocs {
        warn!("Cached {} has a different nodocs setting", pkg.nevra);
        return Ok(CacheState::Absent);
    }

    if let Some(policy) = policy
        && commit.meta_str(META_POLICY) != Some(policy.checksum())
    {
        return Ok(CacheState::NeedsRelabel { commit: checksum });
    }
    Ok(CacheState::Satisfied { commit: checksum })
}

/// Partition the packages of `goal` by cache state
///
/// Local and cache-only packages have no file to fetch again, so they must
/// already be in the store when this runs.
pub fn classify(
    store: &dyn ObjectStore,
    goal: &Goal,
    policy: Option<&dyn LabelPolicy>,
    nodocs: bool,
) -> Result<PendingInstallSet> {
    let mut set = PendingInstallSet::default();

    for pkg in &goal.packages {
        if pkg.action.is_removal() {
            set.to_remove.insert(pkg.nevra.name.clone(), pkg.nevra.clone());
            continue;
        }
        if let Some(old) = &pkg.replaces {
            set.to_replace.insert(pkg.nevra.clone(), old.clone());
        }
        set.install.push(pkg.clone());

        match cache_state(store, pkg, policy, nodocs)? {
            CacheState::Absent => {
                if pkg.origin.is_local() {
                    return Err(Error::InvariantViolation(format!(
                        "{} package {} is not in the store",
                        if pkg.location.is_some() { "local" } else { "cached" },
                        pkg.nevra
                    )));
                }
                if pkg.local_path().is_none() {
                    set.to_download.push(pkg.clone());
                }
                set.to_import.push(pkg.clone());
            }
            CacheState::NeedsRelabel { .. } => set.to_relabel.push(pkg.clone()),
            CacheState::Satisfied { .. } => {}
        }
    }

    debug!(
        "Classified {} packages: {} to download, {} to import, {} to relabel, {} to remove",
        set.install.len(),
        set.to_download.len(),
        set.to_import.len(),
        set.to_relabel.len(),
        set.to_remove.len()
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::{Action, Origin};
    use crate::store::{Commit, FileMeta, FsRepo, Metadata, StoreTransaction, Tree};
    use serde_json::Value;
    use tempfile::TempDir;

    struct Policy(&'static str);

    impl LabelPolicy for Policy {
        fn checksum(&self) -> &str {
            self.0
        }
        fn label(&self, _path: &str, _mode: u32) -> Option<String> {
            None
        }
    }

    fn record(name: &str, origin: Origin) -> PackageRecord {
        let mut pkg = PackageRecord::new(
            Nevra::new(name, 0, "1.0", "1", "x86_64"),
            origin,
            Action::Install,
        );
        pkg.repodata_checksum = Some(format!("sha256:{}", "a".repeat(64)));
        pkg
    }

    /// Store a package commit the way the importer would
    fn cache(repo: &FsRepo, pkg: &PackageRecord, nodocs: bool, policy: Option<&str>) -> String {
        let txn = StoreTransaction::begin(repo).unwrap();
        let tree = repo.write_tree(&Tree::default()).unwrap();
        let mut metadata = Metadata::new();
        if let Some(c) = &pkg.repodata_checksum {
            metadata.insert(META_REPODATA_CHECKSUM.to_string(), Value::from(c.clone()));
        }
        metadata.insert(META_NODOCS.to_string(), Value::from(nodocs));
        if let Some(p) = policy {
            metadata.insert(META_POLICY.to_string(), Value::from(p));
        }
        let commit = repo
            .write_commit(&Commit {
                parent: None,
                subject: String::new(),
                timestamp: 0,
                root_tree: tree,
                root_meta: FileMeta::new(0o755),
                metadata,
            })
            .unwrap();
        txn.set_ref(&cache_branch_for(&pkg.nevra), &commit).unwrap();
        txn.commit().unwrap();
        commit
    }

    fn setup() -> (TempDir, FsRepo) {
        let temp_dir = TempDir::new().unwrap();
        let repo = FsRepo::create(temp_dir.path().join("repo")).unwrap();
        (temp_dir, repo)
    }

    #[test]
    fn test_empty_store_needs_download_and_import() {
        let (_t, repo) = setup();
        let goal = Goal {
            packages: vec![record("foo", Origin::Repo("base".to_string()))],
        };
        let set = classify(&repo, &goal, None, false).unwrap();
        assert_eq!(set.to_download.len(), 1);
        assert_eq!(set.to_import.len(), 1);
        assert!(set.to_relabel.is_empty());
        assert!(!set.is_satisfied());
    }

    #[test]
    fn test_cached_package_is_shared_across_repositories() {
        let (_t, repo) = setup();
        cache(&repo, &record("foo", Origin::Repo("base".to_string())), false, None);
        let goal = Goal {
            packages: vec![record("foo", Origin::Repo("updates".to_string()))],
        };
        let set = classify(&repo, &goal, None, false).unwrap();
        assert!(set.is_satisfied());
        assert_eq!(set.install.len(), 1);
    }

    #[test]
    fn test_partial_commit_is_absent() {
        let (_t, repo) = setup();
        let pkg = record("foo", Origin::Repo("base".to_string()));
        let commit = cache(&repo, &pkg, false, None);
        repo.set_partial(&commit, true).unwrap();
        assert_eq!(cache_state(&repo, &pkg, None, false).unwrap(), CacheState::Absent);
    }

    #[test]
    fn test_repodata_and_nodocs_mismatch_are_absent() {
        let (_t, repo) = setup();
        let pkg = record("foo", Origin::Repo("base".to_string()));
        cache(&repo, &pkg, false, None);

        let mut changed = pkg.clone();
        changed.repodata_checksum = Some(format!("sha256:{}", "b".repeat(64)));
        assert_eq!(cache_state(&repo, &changed, None, false).unwrap(), CacheState::Absent);
        assert_eq!(cache_state(&repo, &pkg, None, true).unwrap(), CacheState::Absent);

        // Local packages are not compared against repository metadata
        let mut local = changed.clone();
        local.origin = Origin::Local;
        assert!(matches!(
            cache_state(&repo, &local, None, false).unwrap(),
            CacheState::Satisfied { .. }
        ));
    }

    #[test]
    fn test_policy_change_needs_relabel() {
        let (_t, repo) = setup();
        let pkg = record("foo", Origin::Repo("base".to_string()));
        let commit = cache(&repo, &pkg, false, Some("old"));

        let goal = Goal {
            packages: vec![pkg.clone()],
        };
        let set = classify(&repo, &goal, Some(&Policy("new")), false).unwrap();
        assert_eq!(set.to_relabel.len(), 1);
        assert!(set.to_import.is_empty());
        assert_eq!(
            cache_state(&repo, &pkg, Some(&Policy("old")), false).unwrap(),
            CacheState::Satisfied { commit }
        );
    }

    #[test]
    fn test_missing_local_package_is_invariant_violation() {
        let (_t, repo) = setup();
        let goal = Goal {
            packages: vec![record("site", Origin::Local)],
        };
        assert!(matches!(
            classify(&repo, &goal, None, false),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_removals_and_replacements() {
        let (_t, repo) = setup();
        let mut update = record("foo", Origin::Repo("base".to_string()));
        update.action = Action::Update;
        update.replaces = Some(Nevra::new("foo", 0, "0.9", "1", "x86_64"));
        cache(&repo, &update, false, None);
        let removed = PackageRecord::new(
            Nevra::new("bar", 0, "1", "1", "noarch"),
            Origin::Installed,
            Action::Remove,
        );

        let goal = Goal {
            packages: vec![update.clone(), removed],
        };
        let set = classify(&repo, &goal, None, false).unwrap();
        assert_eq!(set.to_remove["bar"], Nevra::new("bar", 0, "1", "1", "noarch"));
        assert_eq!(set.to_replace[&update.nevra].version, "0.9");
        assert_eq!(set.install.len(), 1);
        assert!(set.is_satisfied());
    }
}
