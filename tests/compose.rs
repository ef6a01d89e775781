// tests/compose.rs

//! End-to-end composes against directory repositories

mod common;

use common::{Fixture, ScribblingRunner, TestPackage, bash, filesystem, setup, spec};
use std::collections::HashMap;
use std::fs;
use treeforge::cache_key::cache_branch_for;
use treeforge::commit::{META_FINGERPRINT, commit_fingerprint};
use treeforge::db::RpmDb;
use treeforge::model::config::DEFAULT_RPMDB_PATH;
use treeforge::packages::Nevra;
use treeforge::policy::FileContextsPolicy;
use treeforge::store::{EntryKind, FileMeta, ObjectStore, XATTR_SELINUX, resolve_commit, walk_tree};

const REF: &str = "os/x86_64/minimal";

fn installed(fx: &Fixture, ref_name: &str) -> Vec<String> {
    let root = fx.checkout(ref_name);
    let db = RpmDb::open_readonly(&root.join(DEFAULT_RPMDB_PATH)).unwrap();
    db.packages().unwrap().iter().map(|n| n.to_string()).collect()
}

fn metadata(fx: &Fixture, ref_name: &str) -> HashMap<String, FileMeta> {
    let (_, commit) = resolve_commit(&fx.store, ref_name).unwrap().unwrap();
    let mut out = HashMap::new();
    walk_tree(&fx.store, &commit.root_tree, &mut |rel, entry| {
        out.insert(rel.to_string(), entry.meta.clone());
        Ok(())
    })
    .unwrap();
    out
}

#[test]
fn test_compose_into_empty_store() {
    let mut fx = Fixture::new();
    fx.add_repo("base", &[&filesystem(), &setup(), &bash("5.2")]);

    let summary = fx.compose(&spec(REF, &["bash"])).unwrap();
    assert!(!summary.unchanged);
    assert_eq!(summary.downloaded, 3);
    assert_eq!(summary.imported, 3);
    assert_eq!(summary.installed, 3);

    let root = fx.checkout(REF);
    assert_eq!(fs::read_to_string(root.join("usr/bin/bash")).unwrap(), "bash 5.2\n");
    assert!(root.join("usr/etc/passwd").is_file());
    assert!(!root.join("etc").exists());
    assert_eq!(
        installed(&fx, REF),
        vec!["bash-5.2-1.x86_64", "filesystem-3.18-1.x86_64", "setup-2.14-1.noarch"]
    );

    // Every package is cached as a complete commit
    for nevra in ["bash-5.2-1.x86_64", "filesystem-3.18-1.x86_64", "setup-2.14-1.noarch"] {
        let branch = cache_branch_for(&Nevra::parse(nevra).unwrap());
        let commit = fx.store.resolve_ref(&branch).unwrap().unwrap();
        assert!(!fx.store.is_partial(&commit).unwrap());
    }

    let (commit, c) = resolve_commit(&fx.store, REF).unwrap().unwrap();
    assert_eq!(commit, summary.commit);
    assert_eq!(commit_fingerprint(&c), Some(summary.fingerprint.as_str()));
    assert!(c.metadata.contains_key(META_FINGERPRINT));
}

#[test]
fn test_second_compose_imports_nothing() {
    let mut fx = Fixture::new();
    fx.add_repo("base", &[&filesystem(), &setup(), &bash("5.2")]);
    let spec = spec(REF, &["bash"]);

    let first = fx.compose(&spec).unwrap();
    let second = fx.compose(&spec).unwrap();
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.imported, 0);
    assert_eq!(second.relabeled, 0);
    assert_eq!(first.fingerprint, second.fingerprint);

    let (_, c) = resolve_commit(&fx.store, REF).unwrap().unwrap();
    assert_eq!(c.parent.as_deref(), Some(first.commit.as_str()));

    fx.config.skip_unchanged = true;
    let third = fx.compose(&spec).unwrap();
    assert!(third.unchanged);
    assert_eq!(third.commit, second.commit);
    assert_eq!(third.fingerprint, first.fingerprint);
}

#[test]
fn test_policy_change_relabels_without_import() {
    let mut fx = Fixture::new();
    fx.add_repo("base", &[&filesystem(), &setup(), &bash("5.2")]);
    let spec = spec(REF, &["bash"]);
    let old = FileContextsPolicy::parse("/usr(/.*)? system_u:object_r:usr_t:s0\n").unwrap();
    let new = FileContextsPolicy::parse(
        "/usr(/.*)? system_u:object_r:usr_t:s0\n/usr/bin(/.*)? system_u:object_r:bin_t:s0\n",
    )
    .unwrap();

    let first = fx.compose_with(&spec, Some(&old)).unwrap();
    assert_eq!(first.imported, 3);
    assert_eq!(
        metadata(&fx, REF)["usr/bin/bash"].xattrs[XATTR_SELINUX],
        "system_u:object_r:usr_t:s0"
    );

    let second = fx.compose_with(&spec, Some(&new)).unwrap();
    assert_eq!(second.imported, 0);
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.relabeled, 3);
    // setup only ships /etc content, which neither policy labels
    assert_eq!(second.relabel_changed, 2);
    assert_eq!(
        metadata(&fx, REF)["usr/bin/bash"].xattrs[XATTR_SELINUX],
        "system_u:object_r:bin_t:s0"
    );

    // The relabeled commits now carry the new policy
    let third = fx.compose_with(&spec, Some(&new)).unwrap();
    assert_eq!(third.relabeled, 0);
}

#[test]
fn test_multilib_preferred_color_wins() {
    let mut fx = Fixture::new();
    let lib64 = TestPackage::new("multi", "1.0", "x86_64")
        .requires("filesystem")
        .colored_file("/usr/bin/multi-tool", "64-bit\n", 2)
        .file("/usr/lib/multi64.conf", "64\n");
    let lib32 = TestPackage::new("multi32", "1.0", "i686")
        .requires("filesystem")
        .colored_file("/usr/bin/multi-tool", "32-bit\n", 1)
        .file("/usr/lib/multi32.conf", "32\n");
    fx.add_repo("base", &[&filesystem(), &lib64, &lib32]);

    // Order of the request does not matter
    fx.compose(&spec(REF, &["multi32", "multi"])).unwrap();
    let root = fx.checkout(REF);
    assert_eq!(fs::read_to_string(root.join("usr/bin/multi-tool")).unwrap(), "64-bit\n");
    assert!(root.join("usr/lib/multi32.conf").is_file());
    assert!(root.join("usr/lib/multi64.conf").is_file());
    assert_eq!(installed(&fx, REF).len(), 3);
}

#[test]
fn test_partial_cache_commit_is_reimported() {
    let mut fx = Fixture::new();
    fx.add_repo("base", &[&filesystem(), &setup(), &bash("5.2")]);
    let spec = spec(REF, &["bash"]);
    fx.compose(&spec).unwrap();

    let branch = cache_branch_for(&Nevra::new("bash", 0, "5.2", "1", "x86_64"));
    let commit = fx.store.resolve_ref(&branch).unwrap().unwrap();
    fx.store.set_partial(&commit, true).unwrap();

    let summary = fx.compose(&spec).unwrap();
    assert_eq!(summary.imported, 1);
    // The package file was still in the package directory
    assert_eq!(summary.downloaded, 0);
    let again = fx.store.resolve_ref(&branch).unwrap().unwrap();
    assert_eq!(again, commit);
    assert!(!fx.store.is_partial(&again).unwrap());
}

#[test]
fn test_cache_is_shared_across_repositories() {
    let mut fx = Fixture::new();
    let packages = [filesystem(), setup(), bash("5.2")];
    let refs: Vec<&TestPackage> = packages.iter().collect();
    fx.add_repo("fedora", &refs);
    let spec = spec(REF, &["bash"]);
    let first = fx.compose(&spec).unwrap();

    // Same package files served by a different mirror
    fx.config.repos.clear();
    fs::remove_dir_all(&fx.config.package_dir).unwrap();
    fx.add_repo("mirror", &refs);
    let second = fx.compose(&spec).unwrap();
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.imported, 0);
    assert_eq!(first.fingerprint, second.fingerprint);
}

#[test]
fn test_layered_compose_updates_and_removes() {
    let mut fx = Fixture::new();
    let extra = TestPackage::new("extra", "1", "noarch")
        .requires("filesystem")
        .dir("/usr/lib/extra")
        .file("/usr/lib/extra/data", "extra\n");
    fx.add_repo("base", &[&filesystem(), &setup(), &bash("5.1"), &extra]);
    fx.compose(&spec("os/base", &["bash", "extra"])).unwrap();
    assert_eq!(installed(&fx, "os/base").len(), 4);

    let vim = TestPackage::new("vim", "9.1", "x86_64")
        .requires("bash")
        .file("/usr/bin/vim", "vim\n");
    fx.add_repo("base", &[&bash("5.2"), &vim]);

    let mut layered = spec("os/custom", &["bash", "vim"]);
    layered.base = Some("os/base".to_string());
    layered.remove = vec!["extra".to_string()];
    let summary = fx.compose(&layered).unwrap();
    assert_eq!(summary.installed, 2);
    assert_eq!(summary.removed, 2);

    let root = fx.checkout("os/custom");
    assert_eq!(fs::read_to_string(root.join("usr/bin/bash")).unwrap(), "bash 5.2\n");
    assert!(root.join("usr/bin/vim").is_file());
    assert!(!root.join("usr/lib/extra").exists());
    assert!(root.join("usr/etc/passwd").is_file());
    assert_eq!(
        installed(&fx, "os/custom"),
        vec!["bash-5.2-1.x86_64", "filesystem-3.18-1.x86_64", "setup-2.14-1.noarch", "vim-9.1-1.x86_64"]
    );

    let (_, custom) = resolve_commit(&fx.store, "os/custom").unwrap().unwrap();
    let (base, _) = resolve_commit(&fx.store, "os/base").unwrap().unwrap();
    assert_eq!(custom.parent, Some(base));
}

#[test]
fn test_local_package_is_imported_once() {
    let mut fx = Fixture::new();
    fx.add_repo("base", &[&filesystem(), &setup()]);
    let site = TestPackage::new("site-config", "1.0", "noarch")
        .requires("setup")
        .file("/usr/lib/site.conf", "site\n");
    let path = site.write(&fx.temp.path().join("local"));

    let mut spec = spec(REF, &[]);
    spec.local_packages = vec![path];
    let first = fx.compose(&spec).unwrap();
    assert_eq!(first.imported, 3);
    assert_eq!(installed(&fx, REF).len(), 3);

    let second = fx.compose(&spec).unwrap();
    assert_eq!(second.imported, 0);
    assert_eq!(first.fingerprint, second.fingerprint);
}

const SVC_DROPIN: &str = "usr/lib/tmpfiles.d/pkg-svc.conf";

fn svc(version: &str, state_dirs: &[&str]) -> TestPackage {
    let mut pkg = TestPackage::new("svc", version, "noarch")
        .requires("filesystem")
        .dir("/var/lib/svc")
        .file("/usr/bin/svc", &format!("svc {}\n", version));
    for dir in state_dirs {
        pkg = pkg.dir(dir);
    }
    pkg
}

#[test]
fn test_layered_update_rewrites_tmpfiles_dropin() {
    let mut fx = Fixture::new();
    fx.add_repo("base", &[&filesystem(), &setup(), &svc("1", &[])]);
    fx.compose(&spec("os/base", &["svc"])).unwrap();
    let base = fx.checkout("os/base");
    assert_eq!(
        fs::read_to_string(base.join(SVC_DROPIN)).unwrap(),
        "d /var/lib/svc 0755 root root - -\n"
    );

    fx.add_repo("base", &[&svc("2", &["/var/lib/svc/state"])]);
    let mut layered = spec("os/custom", &["svc"]);
    layered.base = Some("os/base".to_string());
    let summary = fx.compose(&layered).unwrap();
    assert_eq!(summary.removed, 1);

    let root = fx.checkout("os/custom");
    assert_eq!(fs::read_to_string(root.join("usr/bin/svc")).unwrap(), "svc 2\n");
    assert_eq!(
        fs::read_to_string(root.join(SVC_DROPIN)).unwrap(),
        "d /var/lib/svc 0755 root root - -\nd /var/lib/svc/state 0755 root root - -\n"
    );
}

#[test]
fn test_layered_removal_drops_tmpfiles_dropin() {
    let mut fx = Fixture::new();
    fx.add_repo("base", &[&filesystem(), &setup(), &bash("5.2"), &svc("1", &[])]);
    fx.compose(&spec("os/base", &["bash", "svc"])).unwrap();
    assert!(fx.checkout("os/base").join(SVC_DROPIN).is_file());

    let mut layered = spec("os/custom", &[]);
    layered.base = Some("os/base".to_string());
    layered.remove = vec!["svc".to_string()];
    fx.compose(&layered).unwrap();

    let root = fx.checkout("os/custom");
    assert!(!root.join("usr/bin/svc").exists());
    assert!(!root.join(SVC_DROPIN).exists());
    assert!(root.join("usr/bin/bash").is_file());
    assert_eq!(
        installed(&fx, "os/custom"),
        vec!["bash-5.2-1.x86_64", "filesystem-3.18-1.x86_64", "setup-2.14-1.noarch"]
    );
}

/// Content object a cached package commit holds for `rel`
fn cached_content(fx: &Fixture, nevra: &Nevra, rel: &str) -> String {
    let (_, commit) = resolve_commit(&fx.store, &cache_branch_for(nevra)).unwrap().unwrap();
    let mut found = None;
    walk_tree(&fx.store, &commit.root_tree, &mut |path, entry| {
        if path == rel
            && let EntryKind::File { content, .. } = &entry.kind
        {
            found = Some(content.clone());
        }
        Ok(())
    })
    .unwrap();
    found.unwrap()
}

#[test]
fn test_hardlinked_checkout_keeps_cache_intact_under_scripts() {
    let mut fx = Fixture::new();
    fx.config.hardlink_checkout = true;
    let data = TestPackage::new("data", "1", "noarch")
        .requires("filesystem")
        .file("/usr/lib/data", "pristine\n")
        .post("echo >> /usr/lib/data");
    fx.add_repo("base", &[&filesystem(), &setup(), &data]);
    let spec = spec(REF, &["data"]);
    let runner = ScribblingRunner { path: "usr/lib/data" };

    fx.compose_with_runner(&spec, None, &runner).unwrap();
    let content = cached_content(&fx, &data.header.nevra, "usr/lib/data");
    assert_eq!(fx.store.read_content(&content).unwrap(), b"pristine\n");

    // A second compose starts from the same untouched package content
    let second = fx.compose_with_runner(&spec, None, &runner).unwrap();
    assert_eq!(second.imported, 0);
    let root = fx.checkout(REF);
    assert_eq!(
        fs::read_to_string(root.join("usr/lib/data")).unwrap(),
        "pristine\nedited by %post\n"
    );
}

#[test]
fn test_skip_unchanged_rebuilds_after_option_change() {
    let mut fx = Fixture::new();
    let docpkg = TestPackage::new("docpkg", "1", "noarch")
        .requires("filesystem")
        .file("/usr/bin/docpkg", "docpkg\n")
        .doc_file("/usr/lib/docpkg-README", "read me\n");
    fx.add_repo("base", &[&filesystem(), &setup(), &docpkg]);
    fx.config.skip_unchanged = true;
    let spec = spec(REF, &["docpkg"]);

    let first = fx.compose(&spec).unwrap();
    assert!(fx.checkout(REF).join("usr/lib/docpkg-README").is_file());
    assert!(fx.compose(&spec).unwrap().unchanged);

    fx.config.nodocs = true;
    let second = fx.compose(&spec).unwrap();
    assert!(!second.unchanged);
    assert_ne!(second.fingerprint, first.fingerprint);
    let root = fx.checkout(REF);
    assert!(!root.join("usr/lib/docpkg-README").exists());
    assert!(root.join("usr/bin/docpkg").is_file());

    // Run-only settings do not force a rebuild
    fx.config.workers = 1;
    assert!(fx.compose(&spec).unwrap().unchanged);
}

#[test]
fn test_skip_unchanged_relabels_after_policy_change() {
    let mut fx = Fixture::new();
    fx.add_repo("base", &[&filesystem(), &setup(), &bash("5.2")]);
    fx.config.skip_unchanged = true;
    let spec = spec(REF, &["bash"]);
    let old = FileContextsPolicy::parse("/usr(/.*)? system_u:object_r:usr_t:s0\n").unwrap();
    let new = FileContextsPolicy::parse(
        "/usr(/.*)? system_u:object_r:usr_t:s0\n/usr/bin(/.*)? system_u:object_r:bin_t:s0\n",
    )
    .unwrap();

    fx.compose_with(&spec, Some(&old)).unwrap();
    assert!(fx.compose_with(&spec, Some(&old)).unwrap().unchanged);

    let changed = fx.compose_with(&spec, Some(&new)).unwrap();
    assert!(!changed.unchanged);
    assert_eq!(changed.relabeled, 3);
    assert_eq!(
        metadata(&fx, REF)["usr/bin/bash"].xattrs[XATTR_SELINUX],
        "system_u:object_r:bin_t:s0"
    );
    assert!(fx.compose_with(&spec, Some(&new)).unwrap().unchanged);
}

#[test]
fn test_plan_imports_local_packages_only() {
    let mut fx = Fixture::new();
    fx.add_repo("base", &[&filesystem(), &setup()]);
    let site = TestPackage::new("site-config", "1.0", "noarch")
        .requires("setup")
        .file("/usr/lib/site.conf", "site\n");
    let mut spec = spec(REF, &[]);
    spec.local_packages = vec![site.write(&fx.temp.path().join("local"))];

    let plan = fx.plan(&spec).unwrap();
    assert_eq!(plan.local_imported, 1);
    assert_eq!(plan.pending.to_download.len(), 2);
    assert!(fx.store.resolve_ref(&cache_branch_for(&site.header.nevra)).unwrap().is_some());
    // Repository packages are neither fetched nor imported, and nothing is published
    let setup_branch = cache_branch_for(&setup().header.nevra);
    assert!(fx.store.resolve_ref(&setup_branch).unwrap().is_none());
    assert!(fx.store.resolve_ref(REF).unwrap().is_none());
}
