// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use treeforge::cache_key::{CACHE_BRANCH_PREFIX, cache_branch_to_nevra};
use treeforge::classify::{CacheState, cache_state};
use treeforge::model::{parse_config_file, parse_treespec_file};
use treeforge::packages::{Action, Nevra, Origin, PackageRecord, RpmReader};
use treeforge::policy::{FileContextsPolicy, LabelPolicy};
use treeforge::repository::{DigestVerifier, DirectoryMirror, LocalRepository, SignatureVerifier, generate_index};
use treeforge::resolver::DirectoryResolver;
use treeforge::scriptlet::CommandScriptRunner;
use treeforge::store::{FsRepo, ObjectStore};
use treeforge::{ComposeConfig, Composer};

#[derive(Parser)]
#[command(name = "treeforge")]
#[command(author, version, about = "Package cache and tree assembly engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty object store
    Init {
        /// Store directory
        repo: PathBuf,
    },
    /// Compose a treespec and publish it under its ref
    Compose {
        /// Treespec file
        treespec: PathBuf,
        /// Compose configuration
        #[arg(short, long, default_value = "/etc/treeforge/compose.toml")]
        config: PathBuf,
        /// Resolve and classify only; local package files are still imported into the cache
        #[arg(long)]
        dry_run: bool,
    },
    /// Write the repodata.json index of a package directory
    IndexRepo {
        /// Directory holding .rpm files
        dir: PathBuf,
        /// Repository name recorded in the index
        #[arg(short, long, default_value = "local")]
        name: String,
    },
    /// Print the fingerprint a treespec resolves to
    ///
    /// Local package files named by the treespec are imported into the cache
    /// first, as a dry-run compose does.
    Fingerprint {
        treespec: PathBuf,
        #[arg(short, long, default_value = "/etc/treeforge/compose.toml")]
        config: PathBuf,
    },
    /// List cached packages and their state
    Cache {
        #[arg(short, long, default_value = "/etc/treeforge/compose.toml")]
        config: PathBuf,
    },
}

/// Everything a compose needs besides the treespec
struct Workspace {
    config: ComposeConfig,
    store: FsRepo,
    resolver: DirectoryResolver,
    mirror: DirectoryMirror,
    runner: CommandScriptRunner,
    policy: Option<FileContextsPolicy>,
}

impl Workspace {
    fn load(path: &Path) -> Result<Self> {
        let config = parse_config_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?;
        let store = FsRepo::open(&config.repo)
            .with_context(|| format!("Failed to open store {}", config.repo.display()))?;

        let mut mirror = DirectoryMirror::new();
        let mut repos = Vec::with_capacity(config.repos.len());
        for repo in &config.repos {
            repos.push(LocalRepository::load(&repo.id, &repo.path)?);
            mirror.add_repo(&repo.id, &repo.path);
        }
        let policy = config
            .policy
            .as_deref()
            .map(FileContextsPolicy::load)
            .transpose()?;
        let runner = CommandScriptRunner::new(&config.scripts);

        Ok(Self {
            resolver: DirectoryResolver::new(repos),
            config,
            store,
            mirror,
            runner,
            policy,
        })
    }

    fn composer<'a>(&'a self, reader: &'a RpmReader, verifier: &'a DigestVerifier) -> Composer<'a> {
        let verifier = self.config.check_signatures.then_some(verifier as &dyn SignatureVerifier);
        Composer::new(&self.config, &self.store, &self.resolver, reader, &self.mirror, &self.runner)
            .with_policy(self.policy.as_ref().map(|p| p as &dyn LabelPolicy))
            .with_verifier(verifier)
    }
}

fn cmd_compose(treespec: &Path, config: &Path, dry_run: bool) -> Result<()> {
    let spec = parse_treespec_file(treespec)
        .with_context(|| format!("Failed to load treespec {}", treespec.display()))?;
    let ctx = Workspace::load(config)?;
    let (reader, verifier) = (RpmReader::new(), DigestVerifier);
    let composer = ctx.composer(&reader, &verifier);

    if dry_run {
        let plan = composer.plan(&spec)?;
        for pkg in &plan.goal.packages {
            println!("{:<10} {}", pkg.action.as_str(), pkg.nevra);
        }
        println!();
        println!("Fingerprint: {}", plan.fingerprint);
        println!(
            "To download: {}, to import: {}, to relabel: {}",
            plan.pending.to_download.len(),
            plan.pending.to_import.len(),
            plan.pending.to_relabel.len()
        );
        if let Some(commit) = plan.unchanged {
            println!("Unchanged from {}", commit);
        }
        return Ok(());
    }

    let summary = composer.compose(&spec)?;
    if summary.unchanged {
        println!("{} is unchanged: {}", spec.ref_name, summary.commit);
        return Ok(());
    }
    println!("{} => {}", spec.ref_name, summary.commit);
    println!("  Fingerprint: {}", summary.fingerprint);
    println!("  Installed: {}, removed: {}", summary.installed, summary.removed);
    println!(
        "  Downloaded: {} ({:.2} MB), imported: {}, relabeled: {} ({} changed)",
        summary.downloaded,
        summary.bytes_downloaded as f64 / 1_048_576.0,
        summary.imported,
        summary.relabeled,
        summary.relabel_changed
    );
    Ok(())
}

fn cmd_cache(config: &Path) -> Result<()> {
    let ctx = Workspace::load(config)?;
    let policy = ctx.policy.as_ref().map(|p| p as &dyn LabelPolicy);
    let refs = ctx.store.list_refs(CACHE_BRANCH_PREFIX)?;
    for (branch, commit) in &refs {
        let nevra = Nevra::parse(&cache_branch_to_nevra(branch)?)?;
        let record = PackageRecord::new(nevra.clone(), Origin::Cache, Action::Install);
        let state = match cache_state(&ctx.store, &record, policy, ctx.config.nodocs)? {
            CacheState::Absent => "unusable",
            CacheState::NeedsRelabel { .. } => "needs-relabel",
            CacheState::Satisfied { .. } => "ok",
        };
        println!("{:<14} {} {}", state, nevra, &commit[..12.min(commit.len())]);
    }
    println!("{} cached packages", refs.len());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { repo }) => {
            info!("Creating store at {}", repo.display());
            FsRepo::create(&repo)?;
            println!("Store initialized at: {}", repo.display());
            Ok(())
        }
        Some(Commands::Compose {
            treespec,
            config,
            dry_run,
        }) => cmd_compose(&treespec, &config, dry_run),
        Some(Commands::IndexRepo { dir, name }) => {
            let metadata = generate_index(&dir, &name, &RpmReader::new())?;
            println!("Indexed {} packages in {}", metadata.packages.len(), dir.display());
            Ok(())
        }
        Some(Commands::Fingerprint { treespec, config }) => {
            let spec = parse_treespec_file(&treespec)?;
            let ctx = Workspace::load(&config)?;
            let (reader, verifier) = (RpmReader::new(), DigestVerifier);
            println!("{}", ctx.composer(&reader, &verifier).plan(&spec)?.fingerprint);
            Ok(())
        }
        Some(Commands::Cache { config }) => cmd_cache(&config),
        None => {
            println!("Treeforge v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'treeforge --help' for usage information");
            Ok(())
        }
    }
}
