// tests/common/mod.rs

//! Shared fixtures for integration tests: package files, repositories and
//! a script runner that records instead of executing.

#![allow(dead_code)]

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use treeforge::packages::{
    HeaderFile, HeaderScript, Nevra, OpenedPackage, PackageHeader, PackageReader, ScriptKind,
};
use treeforge::repository::{DigestVerifier, DirectoryMirror, LocalRepository, generate_index};
use treeforge::resolver::DirectoryResolver;
use treeforge::scriptlet::{ScriptInvocation, ScriptRunner};
use treeforge::store::{CheckoutOptions, FsRepo, checkout_commit, resolve_commit};
use treeforge::{ComposeConfig, ComposePlan, ComposeSummary, Composer, Error, Result, Treespec};

/// One payload entry: path without the leading `/`, mode and data
pub struct Entry {
    pub path: String,
    pub mode: u32,
    pub data: Vec<u8>,
}

fn newc(entries: &[Entry]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut push = |name: &str, mode: u32, data: &[u8]| {
        let header = format!(
            "070701{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            0,
            mode,
            0,
            0,
            1,
            0,
            data.len(),
            0,
            0,
            0,
            0,
            name.len() + 1,
            0
        );
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    };
    for e in entries {
        push(&format!("./{}", e.path), e.mode, &e.data);
    }
    push("TRAILER!!!", 0, b"");
    out
}

/// Builder for a test package
pub struct TestPackage {
    pub header: PackageHeader,
    entries: Vec<Entry>,
}

impl TestPackage {
    pub fn new(name: &str, version: &str, arch: &str) -> Self {
        Self {
            header: PackageHeader::new(Nevra::new(name, 0, version, "1", arch)),
            entries: Vec::new(),
        }
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.header.files.push(HeaderFile::new(path, 0o40755));
        self.entries.push(Entry {
            path: path.trim_start_matches('/').to_string(),
            mode: 0o40755,
            data: Vec::new(),
        });
        self
    }

    pub fn file(self, path: &str, data: &str) -> Self {
        self.colored_file(path, data, 0)
    }

    pub fn colored_file(mut self, path: &str, data: &str, color: u32) -> Self {
        let mut f = HeaderFile::new(path, 0o100644);
        f.color = color;
        self.header.files.push(f);
        self.entries.push(Entry {
            path: path.trim_start_matches('/').to_string(),
            mode: 0o100644,
            data: data.as_bytes().to_vec(),
        });
        self
    }

    /// A file flagged as documentation
    pub fn doc_file(mut self, path: &str, data: &str) -> Self {
        let mut f = HeaderFile::new(path, 0o100644);
        f.doc = true;
        self.header.files.push(f);
        self.entries.push(Entry {
            path: path.trim_start_matches('/').to_string(),
            mode: 0o100644,
            data: data.as_bytes().to_vec(),
        });
        self
    }

    pub fn post(mut self, body: &str) -> Self {
        self.header.scripts.push(HeaderScript {
            kind: ScriptKind::PostIn,
            interpreter: "/bin/sh".to_string(),
            body: body.to_string(),
            prefixes: Vec::new(),
        });
        self
    }

    pub fn requires(mut self, what: &str) -> Self {
        self.header.requires.push(what.to_string());
        self
    }

    /// Write the package file into `dir`
    pub fn write(&self, dir: &Path) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let json = self.header.to_bytes().unwrap();
        let mut out = (json.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(&json);
        out.extend_from_slice(&newc(&self.entries));
        let path = dir.join(self.header.nevra.filename());
        fs::write(&path, out).unwrap();
        path
    }
}

/// Reads files written by [`TestPackage::write`]
#[derive(Debug, Default, Clone, Copy)]
pub struct BundleReader;

impl PackageReader for BundleReader {
    fn open(&self, path: &Path) -> Result<OpenedPackage> {
        let data = fs::read(path)?;
        if data.len() < 4 {
            return Err(Error::ParseError(path.display().to_string()));
        }
        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let header = PackageHeader::from_bytes(&data[4..4 + len])?;
        Ok(OpenedPackage {
            header,
            payload: Box::new(Cursor::new(data[4 + len..].to_vec())),
        })
    }
}

/// Records every script instead of running it
#[derive(Default)]
pub struct RecordingRunner {
    pub calls: Mutex<Vec<String>>,
}

impl ScriptRunner for RecordingRunner {
    fn run_script(&self, _root: &Path, inv: &ScriptInvocation<'_>) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", inv.package.name, inv.kind));
        Ok(())
    }

    fn run_command(&self, _root: &Path, argv: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(argv.join(" "));
        Ok(())
    }
}

/// Appends a line to one tree path from every `%post`, the way a script
/// editing a shipped file would
pub struct ScribblingRunner {
    pub path: &'static str,
}

impl ScriptRunner for ScribblingRunner {
    fn run_script(&self, root: &Path, inv: &ScriptInvocation<'_>) -> Result<()> {
        if inv.kind == ScriptKind::PostIn {
            let mut f = fs::OpenOptions::new().append(true).open(root.join(self.path))?;
            f.write_all(b"edited by %post\n")?;
        }
        Ok(())
    }

    fn run_command(&self, _root: &Path, _argv: &[String]) -> Result<()> {
        Ok(())
    }
}

/// A store, package directory and repositories under one temp dir
pub struct Fixture {
    pub temp: TempDir,
    pub store: FsRepo,
    pub config: ComposeConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let store = FsRepo::create(temp.path().join("repo")).unwrap();
        let mut config = ComposeConfig::new(temp.path().join("repo"));
        config.package_dir = temp.path().join("packages");
        config.workdir = Some(temp.path().join("work"));
        config.workers = 2;
        Self { temp, store, config }
    }

    pub fn repo_dir(&self, id: &str) -> PathBuf {
        self.temp.path().join("mirror").join(id)
    }

    /// Write `packages` into repository `id`, index it and enable it
    pub fn add_repo(&mut self, id: &str, packages: &[&TestPackage]) {
        let dir = self.repo_dir(id);
        for pkg in packages {
            pkg.write(&dir);
        }
        generate_index(&dir, id, &BundleReader).unwrap();
        if !self.config.repos.iter().any(|r| r.id == id) {
            self.config.repos.push(treeforge::model::RepoConfig {
                id: id.to_string(),
                path: dir,
            });
        }
    }

    pub fn compose_with(
        &self,
        spec: &Treespec,
        policy: Option<&dyn treeforge::policy::LabelPolicy>,
    ) -> Result<ComposeSummary> {
        self.compose_with_runner(spec, policy, &RecordingRunner::default())
    }

    pub fn compose_with_runner(
        &self,
        spec: &Treespec,
        policy: Option<&dyn treeforge::policy::LabelPolicy>,
        runner: &dyn ScriptRunner,
    ) -> Result<ComposeSummary> {
        let (resolver, mirror) = self.sources()?;
        Composer::new(&self.config, &self.store, &resolver, &BundleReader, &mirror, runner)
            .with_policy(policy)
            .with_verifier(Some(&DigestVerifier))
            .compose(spec)
    }

    fn sources(&self) -> Result<(DirectoryResolver, DirectoryMirror)> {
        let mut mirror = DirectoryMirror::new();
        let mut repos = Vec::new();
        for repo in &self.config.repos {
            repos.push(LocalRepository::load(&repo.id, &repo.path)?);
            mirror.add_repo(&repo.id, &repo.path);
        }
        Ok((DirectoryResolver::new(repos), mirror))
    }

    /// Resolve and classify `spec` without composing it
    pub fn plan(&self, spec: &Treespec) -> Result<ComposePlan> {
        let (resolver, mirror) = self.sources()?;
        let runner = RecordingRunner::default();
        Composer::new(&self.config, &self.store, &resolver, &BundleReader, &mirror, &runner)
            .with_verifier(Some(&DigestVerifier))
            .plan(spec)
    }

    pub fn compose(&self, spec: &Treespec) -> Result<ComposeSummary> {
        self.compose_with(spec, None)
    }

    /// Check the commit on `ref_name` out into a fresh directory
    pub fn checkout(&self, ref_name: &str) -> PathBuf {
        let (commit, _) = resolve_commit(&self.store, ref_name).unwrap().unwrap();
        let dest = self.temp.path().join("checkouts").join(&commit);
        let opts = CheckoutOptions {
            force_copy: true,
            ..Default::default()
        };
        checkout_commit(&self.store, &commit, &dest, &opts).unwrap();
        dest
    }
}

pub fn filesystem() -> TestPackage {
    TestPackage::new("filesystem", "3.18", "x86_64")
        .dir("/usr")
        .dir("/usr/bin")
        .dir("/usr/lib")
        .dir("/etc")
}

pub fn setup() -> TestPackage {
    TestPackage::new("setup", "2.14", "noarch")
        .requires("filesystem")
        .file("/etc/passwd", "root:x:0:0:root:/root:/bin/bash\n")
        .file("/etc/group", "root:x:0:\n")
}

pub fn bash(version: &str) -> TestPackage {
    TestPackage::new("bash", version, "x86_64")
        .requires("filesystem")
        .requires("setup")
        .file("/usr/bin/bash", &format!("bash {}\n", version))
}

pub fn spec(ref_name: &str, packages: &[&str]) -> Treespec {
    let mut spec = Treespec::new(ref_name);
    spec.packages = packages.iter().map(|p| p.to_string()).collect();
    spec
}
