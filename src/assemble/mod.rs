// src/assemble/mod.rs

//! Transaction assembly engine
//!
//! Builds the scratch root of one compose from cached package commits. The
//! pending install set must be fully satisfied: every package to install
//! has a complete commit under its cache branch. Assembly then runs
//! strictly in sequence:
//!
//! 1. check out the base tree, if any
//! 2. order the packages being installed
//! 3. analyze file disposition across the whole transaction
//! 4. remove leaving packages
//! 5. check out each package in order
//! 6. run `%pre` scripts
//! 7. apply ownership and capability overrides
//! 8. run `%post`, `%posttrans` and file triggers, then lay overlays
//! 9. run the sanity command inside the tree
//! 10. record the transaction in the tree's package database
//! 11. check that the database loads and lists what it should
//!
//! Any failure aborts the assembly; the scratch root is then garbage and
//! nothing reaches the store.

pub mod disposition;
pub mod order;
pub mod overrides;
pub mod passwd;
pub mod remove;
pub mod scripts;

pub use disposition::{ColorPolicy, FileDisposition};

use crate::cache_key::cache_branch_for;
use crate::classify::PendingInstallSet;
use crate::db::{self, DbOp, RpmDb};
use crate::error::{Error, Result};
use crate::import::tmpfiles::TmpfilesFragment;
use crate::import::{ImportOptions, commit_header};
use crate::model::ComposeConfig;
use crate::packages::{Action, Nevra, PackageHeader, PackageRecord, ScriptKind};
use crate::resolver::InstalledPackage;
use crate::scriptlet::ScriptRunner;
use crate::store::{
    CheckoutOptions, ObjectStore, OverrideTable, OverwriteMode, checkout_commit, resolve_commit,
};
use passwd::TempEtcGuard;
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

/// The tree a compose layers on
#[derive(Debug, Clone)]
pub struct BaseTree {
    pub commit: String,
    pub root_tree: String,
    /// Packages recorded in the tree's database
    pub headers: Vec<PackageHeader>,
}

impl BaseTree {
    /// Resolve `name` and read the package database of its tree
    pub fn load(store: &dyn ObjectStore, name: &str, rpmdb_path: &Path) -> Result<Self> {
        let (commit, c) = resolve_commit(store, name)?
            .ok_or_else(|| Error::ResolutionError(format!("base ref '{}' does not exist", name)))?;
        if store.is_partial(&commit)? {
            return Err(Error::StoreError(format!("base commit {} is partial", commit)));
        }
        let headers = db::headers_in_tree(store, &c.root_tree, rpmdb_path)?.unwrap_or_default();
        debug!("Base {} has {} packages", name, headers.len());
        Ok(Self {
            commit,
            root_tree: c.root_tree,
            headers,
        })
    }

    /// Installed packages as resolution input
    pub fn installed(&self) -> Vec<InstalledPackage> {
        self.headers
            .iter()
            .map(|h| InstalledPackage {
                nevra: h.nevra.clone(),
                provides: h.provides.clone(),
            })
            .collect()
    }
}

/// What one assembly did
#[derive(Debug, Clone, Default)]
pub struct AssemblyReport {
    /// Packages in checkout order
    pub order: Vec<Nevra>,
    /// Base packages taken out, removed or replaced
    pub removed: Vec<Nevra>,
    /// Ownership and capabilities the commit writer must record
    pub overrides: OverrideTable,
    pub files_removed: usize,
    pub paths_kept: usize,
    pub paths_skipped: usize,
    pub scripts_run: usize,
    /// Package database contents after the transaction
    pub packages: Vec<Nevra>,
}

/// A package ready to check out
struct Staged<'a> {
    record: &'a PackageRecord,
    commit: String,
    header: PackageHeader,
}

/// Assembles scratch roots
pub struct Assembler<'a> {
    store: &'a dyn ObjectStore,
    config: &'a ComposeConfig,
    runner: &'a dyn ScriptRunner,
}

impl<'a> Assembler<'a> {
    pub fn new(store: &'a dyn ObjectStore, config: &'a ComposeConfig, runner: &'a dyn ScriptRunner) -> Self {
        Self { store, config, runner }
    }

    fn import_options(&self) -> ImportOptions {
        ImportOptions {
            nodocs: self.config.nodocs,
            skip_unsupported: self.config.skip_unsupported,
            relocate_opt: self.config.relocate_opt,
        }
    }

    fn colors(&self) -> ColorPolicy {
        ColorPolicy {
            transaction: self.config.transaction_color,
            preferred: self.config.preferred_color,
        }
    }

    fn checkout_mode(&self, name: &str) -> OverwriteMode {
        if name == self.config.setup_package {
            OverwriteMode::AddFiles
        } else if self.config.fileoverride_packages.iter().any(|p| p == name) {
            OverwriteMode::UnionFiles
        } else {
            OverwriteMode::UnionIdentical
        }
    }

    fn stage<'r>(&self, record: &'r PackageRecord) -> Result<Staged<'r>> {
        let branch = cache_branch_for(&record.nevra);
        let (commit, c) = resolve_commit(self.store, &branch)?.ok_or_else(|| {
            Error::InvariantViolation(format!("{} has no cached commit", record.nevra))
        })?;
        if self.store.is_partial(&commit)? {
            return Err(Error::InvariantViolation(format!(
                "cached commit of {} is partial",
                record.nevra
            )));
        }
        let header = commit_header(&c)?;
        Ok(Staged { record, commit, header })
    }

    /// Assemble `set` into `root`, which must not exist yet
    pub fn assemble(
        &self,
        set: &PendingInstallSet,
        base: Option<&BaseTree>,
        overlays: &[String],
        root: &Path,
    ) -> Result<AssemblyReport> {
        if root.exists() {
            return Err(Error::InvariantViolation(format!(
                "scratch root {} already exists",
                root.display()
            )));
        }
        if !set.is_satisfied() {
            return Err(Error::InvariantViolation(
                "assembly started with packages still to import or relabel".to_string(),
            ));
        }

        let opts = self.import_options();
        let force_copy = !self.config.hardlink_checkout;
        let mut report = AssemblyReport::default();

        // Base tree
        let base_headers: &[PackageHeader] = base.map(|b| b.headers.as_slice()).unwrap_or_default();
        if let Some(base) = base {
            info!("Checking out base tree {}", base.commit);
            let opts = CheckoutOptions {
                force_copy,
                ..Default::default()
            };
            checkout_commit(self.store, &base.commit, root, &opts)?;
            overrides::seed_from_tree(self.store, &base.root_tree, &mut report.overrides)?;
        } else {
            fs::create_dir_all(root)?;
            fs::set_permissions(root, fs::Permissions::from_mode(0o755))?;
        }

        // Order
        let staged = set
            .install
            .iter()
            .map(|p| self.stage(p))
            .collect::<Result<Vec<_>>>()?;
        let headers: Vec<&PackageHeader> = staged.iter().map(|s| &s.header).collect();
        let order = order::install_order(
            &headers,
            &self.config.filesystem_package,
            &self.config.fileoverride_packages,
        );
        let ordered: Vec<&Staged<'_>> = order.iter().map(|&i| &staged[i]).collect();
        let ordered_headers: Vec<&PackageHeader> = ordered.iter().map(|s| &s.header).collect();
        report.order = ordered.iter().map(|s| s.header.nevra.clone()).collect();

        // Disposition
        let leaving: HashSet<Nevra> = set
            .to_remove
            .values()
            .chain(set.to_replace.values())
            .cloned()
            .collect();
        for nevra in &leaving {
            if !base_headers.iter().any(|h| &h.nevra == nevra) {
                return Err(Error::ResolutionError(format!(
                    "{} is not part of the base tree",
                    nevra
                )));
            }
        }
        let leaving_headers: Vec<&PackageHeader> =
            base_headers.iter().filter(|h| leaving.contains(&h.nevra)).collect();
        let disposition = disposition::analyze(base_headers, &leaving, &ordered_headers, self.colors(), &opts);
        report.paths_kept = disposition.keep.len();
        report.paths_skipped = disposition.skipped();

        // Remove; a same-named base package staying behind still owns its tmpfiles.d fragment
        let mut keep = disposition.keep.clone();
        keep.extend(
            base_headers
                .iter()
                .filter(|h| !leaving.contains(&h.nevra))
                .map(|h| TmpfilesFragment::path_for(&h.nevra.name)),
        );
        let removed = remove::remove_packages(root, &leaving_headers, &keep, &opts)?;
        for rel in &disposition.replace {
            remove::remove_path(root, rel)?;
        }
        report.files_removed = removed.files + disposition.replace.len();
        report.removed = leaving_headers.iter().map(|h| h.nevra.clone()).collect();

        // Install
        for s in &ordered {
            let mode = self.checkout_mode(&s.header.nevra.name);
            debug!("Checking out {} ({:?})", s.header.nevra, mode);
            let checkout = CheckoutOptions {
                mode,
                skip: disposition.skip_for(&s.header.nevra),
                force_copy,
            };
            checkout_commit(self.store, &s.commit, root, &checkout)
                .map_err(|e| e.context(&s.header.nevra))?;
        }
        info!("Checked out {} packages", ordered.len());

        // Scripts and overrides; nothing run in the tree may write through to the store
        if self.config.hardlink_checkout {
            overrides::break_hardlinks_in(root)?;
        }
        let upgrades: HashSet<Nevra> = ordered
            .iter()
            .filter(|s| {
                s.record.replaces.is_some() || matches!(s.record.action, Action::Update | Action::Downgrade)
            })
            .map(|s| s.header.nevra.clone())
            .collect();

        let guard = TempEtcGuard::enter(root)?;
        report.scripts_run +=
            scripts::run_package_scripts(self.runner, root, ScriptKind::PreIn, &ordered_headers, &upgrades)?;
        guard.restore()?;

        overrides::apply_header_overrides(
            root,
            &ordered_headers,
            &disposition,
            &mut report.overrides,
            &opts,
        )?;

        let guard = TempEtcGuard::enter(root)?;
        report.scripts_run +=
            scripts::run_package_scripts(self.runner, root, ScriptKind::PostIn, &ordered_headers, &upgrades)?;
        report.scripts_run +=
            scripts::run_package_scripts(self.runner, root, ScriptKind::PostTrans, &ordered_headers, &upgrades)?;

        let installed_paths: Vec<String> = ordered
            .iter()
            .flat_map(|s| {
                let skip = disposition.skip_for(&s.header.nevra);
                s.header.files.iter().filter(move |f| {
                    !f.is_dir()
                        && !f.ghost
                        && crate::import::filter::tree_path(&f.path, &opts)
                            .is_some_and(|rel| !skip.is_some_and(|set| set.contains(&rel)))
                })
            })
            .map(|f| f.path.clone())
            .collect();
        let trigger_headers: Vec<&PackageHeader> = base_headers
            .iter()
            .filter(|h| !leaving.contains(&h.nevra))
            .chain(ordered_headers.iter().copied())
            .collect();
        report.scripts_run += scripts::run_file_triggers(self.runner, root, &trigger_headers, &installed_paths)?;
        guard.restore()?;

        for name in overlays {
            let (commit, c) = resolve_commit(self.store, name)?
                .ok_or_else(|| Error::NotFound(format!("overlay ref '{}'", name)))?;
            info!("Applying overlay {}", name);
            let opts = CheckoutOptions {
                mode: OverwriteMode::UnionFiles,
                skip: None,
                force_copy: true,
            };
            checkout_commit(self.store, &commit, root, &opts).map_err(|e| e.context(name))?;
            overrides::seed_from_tree(self.store, &c.root_tree, &mut report.overrides)?;
        }

        // Sanity check
        let sanity = &self.config.scripts.sanity_command;
        if !sanity.is_empty() {
            self.runner.run_command(root, sanity).map_err(|e| {
                Error::SanityCheck(format!("'{}' does not run in the tree: {}", sanity.join(" "), e))
            })?;
        }

        // Package database
        let db_path = root.join(&self.config.rpmdb_path);
        overrides::break_hardlink(&db_path)?;
        let mut rpmdb = RpmDb::open(&db_path)?;
        let mut leaving_sorted: Vec<&Nevra> = leaving.iter().collect();
        leaving_sorted.sort();
        let ops: Vec<DbOp<'_>> = leaving_sorted
            .into_iter()
            .map(DbOp::Remove)
            .chain(ordered_headers.iter().map(|h| DbOp::Install(h)))
            .collect();
        rpmdb.apply(&ops)?;
        drop(rpmdb);

        report.packages = self.check_database(&db_path, &ordered_headers, &leaving)?;
        info!(
            "Assembled {} packages ({} removed, {} scripts)",
            report.order.len(),
            report.removed.len(),
            report.scripts_run
        );
        Ok(report)
    }

    fn check_database(
        &self,
        path: &Path,
        installed: &[&PackageHeader],
        leaving: &HashSet<Nevra>,
    ) -> Result<Vec<Nevra>> {
        let sanity = |e: Error| Error::SanityCheck(format!("package database does not load: {}", e));
        let rpmdb = RpmDb::open_readonly(path).map_err(sanity)?;
        rpmdb.check_integrity()?;
        let packages = rpmdb.packages().map_err(sanity)?;

        for h in installed {
            if !packages.contains(&h.nevra) {
                return Err(Error::SanityCheck(format!(
                    "{} is missing from the package database",
                    h.nevra
                )));
            }
        }
        for nevra in leaving {
            if packages.contains(nevra) {
                return Err(Error::SanityCheck(format!(
                    "{} is still in the package database",
                    nevra
                )));
            }
        }
        Ok(packages)
    }
}
