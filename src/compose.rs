// src/compose.rs

//! End-to-end compose of one treespec
//!
//! A compose resolves the treespec against the base tree, brings every
//! package of the goal into the cache (download, import, relabel), assembles
//! a scratch root from the cached commits and publishes it. The cache is
//! consulted first at every step, so a second compose of the same inputs
//! imports nothing; with `skip-unchanged` it does not even assemble.

use crate::assemble::{Assembler, BaseTree};
use crate::cache_key::cache_branch_for;
use crate::classify::{CacheState, PendingInstallSet, cache_state, classify};
use crate::commit::{CommitRequest, commit_fingerprint, write_commit};
use crate::digest::state_fingerprint;
use crate::error::{Error, Result};
use crate::hash;
use crate::import::{ImportOptions, Importer, META_HEADER_SHA256, import_all};
use crate::model::{ComposeConfig, Treespec};
use crate::packages::{Action, Origin, PackageReader, PackageRecord};
use crate::policy::LabelPolicy;
use crate::pool::WorkerPool;
use crate::relabel::{RelabelReport, relabel_all};
use crate::repository::{DownloadQueue, SignatureVerifier, format_checksum};
use crate::resolver::{Goal, LocalPackage, ResolveRequest, Resolver};
use crate::scriptlet::ScriptRunner;
use crate::store::{ObjectStore, resolve_commit};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What one compose did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeSummary {
    pub fingerprint: String,
    /// The commit now on the ref
    pub commit: String,
    /// Nothing was assembled because the ref already matched
    pub unchanged: bool,
    pub downloaded: usize,
    pub bytes_downloaded: u64,
    pub imported: usize,
    pub relabeled: usize,
    /// Relabeled packages whose labels actually changed
    pub relabel_changed: usize,
    pub installed: usize,
    pub removed: usize,
    pub content_bytes_written: u64,
}

/// Resolution result and cache partition, before anything is fetched
#[derive(Debug, Clone)]
pub struct ComposePlan {
    pub goal: Goal,
    pub fingerprint: String,
    pub pending: PendingInstallSet,
    /// Local package files imported while planning
    pub local_imported: usize,
    /// Commit already on the ref with the same inputs
    pub unchanged: Option<String>,
}

/// Drives composes against one store
pub struct Composer<'a> {
    config: &'a ComposeConfig,
    store: &'a dyn ObjectStore,
    resolver: &'a dyn Resolver,
    reader: &'a dyn PackageReader,
    downloads: &'a dyn DownloadQueue,
    runner: &'a dyn ScriptRunner,
    policy: Option<&'a dyn LabelPolicy>,
    verifier: Option<&'a dyn SignatureVerifier>,
}

impl<'a> Composer<'a> {
    pub fn new(
        config: &'a ComposeConfig,
        store: &'a dyn ObjectStore,
        resolver: &'a dyn Resolver,
        reader: &'a dyn PackageReader,
        downloads: &'a dyn DownloadQueue,
        runner: &'a dyn ScriptRunner,
    ) -> Self {
        Self {
            config,
            store,
            resolver,
            reader,
            downloads,
            runner,
            policy: None,
            verifier: None,
        }
    }

    pub fn with_policy(mut self, policy: Option<&'a dyn LabelPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_verifier(mut self, verifier: Option<&'a dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    fn import_options(&self) -> ImportOptions {
        ImportOptions {
            nodocs: self.config.nodocs,
            skip_unsupported: self.config.skip_unsupported,
            relocate_opt: self.config.relocate_opt,
        }
    }

    fn importer(&self) -> Importer<'a> {
        Importer::new(self.store, self.reader, self.import_options())
            .with_policy(self.policy)
            .with_verifier(self.verifier)
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let parent = self.config.workdir.clone().unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&parent)?;
        tempfile::Builder::new()
            .prefix("treeforge-")
            .tempdir_in(&parent)
            .map_err(|e| Error::IoError(format!("Failed to create scratch directory: {}", e)))
    }

    /// Read local package files and make sure each is cached as it is on disk
    fn load_local_packages(&self, pool: &WorkerPool, paths: &[PathBuf]) -> Result<(Vec<LocalPackage>, usize)> {
        let mut locals = Vec::with_capacity(paths.len());
        let mut stale: Vec<(PackageRecord, PathBuf)> = Vec::new();

        for path in paths {
            let header = self.reader.open(path).map_err(|e| e.context(path.display()))?.header;
            let mut record = PackageRecord::new(header.nevra.clone(), Origin::Local, Action::Install);
            record.size = fs::metadata(path)?.len();
            record.repodata_checksum = Some(format_checksum(&hash::sha256_reader(File::open(path)?)?));
            record.location = Some(path.clone());

            let cached = match cache_state(self.store, &record, self.policy, self.config.nodocs)? {
                CacheState::Absent => false,
                CacheState::Satisfied { commit } | CacheState::NeedsRelabel { commit } => {
                    let c = self.store.load_commit(&commit)?;
                    c.meta_str(META_HEADER_SHA256) == Some(header.sha256()?.as_str())
                }
            };
            if cached {
                debug!("Local package {} is already cached", record.nevra);
            } else {
                stale.push((record.clone(), path.clone()));
            }
            locals.push(LocalPackage {
                record,
                requires: header.requires,
                provides: header.provides,
            });
        }

        if !stale.is_empty() {
            info!("Importing {} local packages", stale.len());
            import_all(pool, self.store, &self.importer(), &stale)?;
        }
        Ok((locals, stale.len()))
    }

    /// Point repository packages at files already in the package directory
    fn reuse_downloads(&self, goal: &mut Goal) {
        for pkg in &mut goal.packages {
            if matches!(pkg.origin, Origin::Repo(_)) && pkg.action.is_install() && pkg.location.is_none() {
                let candidate = self.config.package_dir.join(pkg.nevra.filename());
                if candidate.is_file() {
                    pkg.location = Some(candidate);
                }
            }
        }
    }

    fn prepare(&self, spec: &Treespec, pool: &WorkerPool, base: Option<&BaseTree>) -> Result<ComposePlan> {
        spec.validate()?;
        let (local, local_imported) = self.load_local_packages(pool, &spec.local_packages)?;
        let request = ResolveRequest {
            install: spec.packages.clone(),
            remove: spec.remove.clone(),
            local,
            installed: base.map(BaseTree::installed).unwrap_or_default(),
        };
        let mut goal = self.resolver.resolve(&request)?;
        let options = self.config.tree_options(self.policy.map(|p| p.checksum()));
        let fingerprint = state_fingerprint(spec, &options, &goal)?;

        let mut unchanged = None;
        if let Some((commit, c)) = resolve_commit(self.store, &spec.ref_name)?
            && commit_fingerprint(&c) == Some(fingerprint.as_str())
            && base.is_none_or(|b| c.parent.as_deref() == Some(b.commit.as_str()))
        {
            unchanged = Some(commit);
        }

        self.reuse_downloads(&mut goal);
        let pending = classify(self.store, &goal, self.policy, self.config.nodocs)?;
        info!(
            "{} packages: {} to download, {} to import, {} to relabel",
            pending.install.len(),
            pending.to_download.len(),
            pending.to_import.len(),
            pending.to_relabel.len()
        );
        Ok(ComposePlan {
            goal,
            fingerprint,
            pending,
            local_imported,
            unchanged,
        })
    }

    fn load_base(&self, spec: &Treespec) -> Result<Option<BaseTree>> {
        spec.base
            .as_deref()
            .map(|b| BaseTree::load(self.store, b, &self.config.rpmdb_path))
            .transpose()
    }

    /// Resolve and classify without downloading, assembling or publishing
    ///
    /// This is not read-only: stale local package files are imported into
    /// the cache first, since classification needs them there. Nothing else
    /// is written.
    pub fn plan(&self, spec: &Treespec) -> Result<ComposePlan> {
        let pool = WorkerPool::new(self.config.worker_count())?;
        let base = self.load_base(spec)?;
        self.prepare(spec, &pool, base.as_ref())
    }

    /// Bring every package of `pending` into the cache
    fn fill_cache(
        &self,
        pool: &WorkerPool,
        pending: &PendingInstallSet,
        workdir: &Path,
        summary: &mut ComposeSummary,
    ) -> Result<()> {
        let fetched = self.downloads.download(&pending.to_download, &self.config.package_dir)?;
        if fetched.paths.len() != pending.to_download.len() {
            return Err(Error::InvariantViolation(format!(
                "asked for {} packages, got {}",
                pending.to_download.len(),
                fetched.paths.len()
            )));
        }
        summary.downloaded = fetched.paths.len();
        summary.bytes_downloaded = fetched.bytes;
        let downloaded: HashMap<_, _> = pending
            .to_download
            .iter()
            .map(|p| &p.nevra)
            .zip(fetched.paths)
            .collect();

        let to_import = pending
            .to_import
            .iter()
            .map(|p| {
                let path = downloaded
                    .get(&p.nevra)
                    .cloned()
                    .or_else(|| p.local_path().map(Path::to_path_buf))
                    .ok_or_else(|| Error::InvariantViolation(format!("no package file for {}", p.nevra)))?;
                Ok((p.clone(), path))
            })
            .collect::<Result<Vec<_>>>()?;
        let (imported, _) = import_all(pool, self.store, &self.importer(), &to_import)?;
        summary.imported += imported.len();

        let relabeled = match self.policy {
            Some(policy) => {
                let dir = workdir.join("relabel");
                fs::create_dir_all(&dir)?;
                relabel_all(pool, self.store, policy, &pending.to_relabel, &dir)?
            }
            None if pending.to_relabel.is_empty() => RelabelReport::default(),
            None => {
                return Err(Error::InvariantViolation(
                    "packages need relabeling but no policy is loaded".to_string(),
                ));
            }
        };
        summary.relabeled = relabeled.relabeled;
        summary.relabel_changed = relabeled.changed;
        Ok(())
    }

    /// Compose `spec` and publish it under its ref
    pub fn compose(&self, spec: &Treespec) -> Result<ComposeSummary> {
        info!("Composing {}", spec.ref_name);
        let pool = WorkerPool::new(self.config.worker_count())?;
        let base = self.load_base(spec)?;
        let plan = self.prepare(spec, &pool, base.as_ref())?;

        let mut summary = ComposeSummary {
            fingerprint: plan.fingerprint.clone(),
            imported: plan.local_imported,
            ..Default::default()
        };
        if self.config.skip_unchanged
            && let Some(commit) = plan.unchanged
        {
            info!("{} is unchanged at {}", spec.ref_name, commit);
            summary.commit = commit;
            summary.unchanged = true;
            return Ok(summary);
        }

        let scratch = self.scratch_dir()?;
        self.fill_cache(&pool, &plan.pending, scratch.path(), &mut summary)?;

        let pending = classify(self.store, &plan.goal, self.policy, self.config.nodocs)?;
        if !pending.is_satisfied() {
            let missing: Vec<String> = pending
                .to_download
                .iter()
                .chain(&pending.to_import)
                .chain(&pending.to_relabel)
                .map(|p| cache_branch_for(&p.nevra))
                .collect();
            return Err(Error::InvariantViolation(format!(
                "packages still not cached after import: {}",
                missing.join(", ")
            )));
        }

        let root = scratch.path().join("root");
        let report = Assembler::new(self.store, self.config, self.runner).assemble(
            &pending,
            base.as_ref(),
            &spec.overlays,
            &root,
        )?;

        let request = CommitRequest {
            treespec: spec,
            fingerprint: &plan.fingerprint,
            subject: format!("{} ({} packages)", spec.ref_name, report.packages.len()),
            parent: base.as_ref().map(|b| b.commit.as_str()),
            timestamp: None,
            rpmdb_path: &self.config.rpmdb_path,
        };
        let committed = write_commit(self.store, &root, &report, self.policy, &request)?;

        summary.commit = committed.commit;
        summary.installed = report.order.len();
        summary.removed = report.removed.len();
        summary.content_bytes_written = committed.stats.content_bytes_written;
        info!(
            "Composed {} at {}: {} downloaded, {} imported, {} relabeled",
            spec.ref_name, summary.commit, summary.downloaded, summary.imported, summary.relabeled
        );
        Ok(summary)
    }
}
