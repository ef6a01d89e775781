// src/model/config.rs

//! Compose configuration
//!
//! All options of one build live in an explicit [`ComposeConfig`] that is
//! passed to every stage needing them; nothing is kept in process-wide
//! state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{ModelError, ModelResult};
use crate::packages::header::{COLOR_32, COLOR_64};

/// Package database path inside a tree
pub const DEFAULT_RPMDB_PATH: &str = "usr/share/rpm/rpmdb.sqlite";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    compose: ComposeConfig,
}

/// How install-time scripts are launched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScriptConfig {
    /// Command prefix placed before the interpreter; `{root}` expands to
    /// the tree being assembled. Empty means run with the root as the
    /// working directory and `TREEFORGE_ROOT` set.
    #[serde(default)]
    pub launcher: Vec<String>,

    /// Per-script timeout in seconds
    #[serde(default = "default_script_timeout")]
    pub timeout_secs: u64,

    /// Command run inside the tree after scripts to prove it still works
    #[serde(default = "default_sanity_command")]
    pub sanity_command: Vec<String>,
}

fn default_script_timeout() -> u64 {
    300
}

fn default_sanity_command() -> Vec<String> {
    vec!["/usr/bin/true".to_string()]
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            launcher: Vec::new(),
            timeout_secs: default_script_timeout(),
            sanity_command: default_sanity_command(),
        }
    }
}

/// A package repository backed by a local directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub id: String,
    /// Directory holding the packages and their `repodata.json`
    pub path: PathBuf,
}

/// Options for one compose run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ComposeConfig {
    /// Object store location
    pub repo: PathBuf,

    /// Where downloaded package files are kept
    #[serde(default = "default_package_dir")]
    pub package_dir: PathBuf,

    /// Worker pool size; 0 uses the available parallelism
    #[serde(default)]
    pub workers: usize,

    /// Leave out files flagged as documentation
    #[serde(default)]
    pub nodocs: bool,

    /// Skip files outside the supported layout instead of failing
    #[serde(default)]
    pub skip_unsupported: bool,

    /// Move `/opt` content to `/usr/lib/opt` instead of treating it as unsupported
    #[serde(default)]
    pub relocate_opt: bool,

    /// Verify package files before import
    #[serde(default = "default_true")]
    pub check_signatures: bool,

    /// `file_contexts` file of the active label policy
    #[serde(default)]
    pub policy: Option<PathBuf>,

    /// Color bits a multilib transaction may contain
    #[serde(default = "default_ts_color")]
    pub transaction_color: u32,

    /// Color that wins when two packages ship the same path
    #[serde(default = "default_prefer_color")]
    pub preferred_color: u32,

    /// Package owning the base directory layout, checked out first
    #[serde(default = "default_filesystem_package")]
    pub filesystem_package: String,

    /// Package seeding `/etc/passwd` and `/etc/group`, checked out with add-only semantics
    #[serde(default = "default_setup_package")]
    pub setup_package: String,

    /// Packages whose files overwrite those of other packages, checked out last
    #[serde(default)]
    pub fileoverride_packages: Vec<String>,

    /// Package database path relative to the tree root
    #[serde(default = "default_rpmdb_path")]
    pub rpmdb_path: PathBuf,

    /// Skip the commit when the fingerprint matches the current ref
    #[serde(default)]
    pub skip_unchanged: bool,

    /// Hardlink root-owned 0644 files into the store during assembly; the
    /// links are broken again before any script runs
    #[serde(default)]
    pub hardlink_checkout: bool,

    /// Parent directory for scratch roots; the system temp dir when unset
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Repositories to resolve against, in priority order
    #[serde(default, rename = "repo-dirs")]
    pub repos: Vec<RepoConfig>,

    #[serde(default)]
    pub scripts: ScriptConfig,
}

/// The options of a [`ComposeConfig`] that change the content of a composed tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TreeOptions<'a> {
    pub nodocs: bool,
    pub skip_unsupported: bool,
    pub relocate_opt: bool,
    pub transaction_color: u32,
    pub preferred_color: u32,
    pub filesystem_package: &'a str,
    pub setup_package: &'a str,
    pub fileoverride_packages: &'a [String],
    pub rpmdb_path: &'a Path,
    /// Checksum of the active label policy
    pub policy: Option<&'a str>,
}

fn default_true() -> bool {
    true
}

fn default_package_dir() -> PathBuf {
    PathBuf::from("/var/cache/treeforge/packages")
}

fn default_ts_color() -> u32 {
    COLOR_32 | COLOR_64
}

fn default_prefer_color() -> u32 {
    COLOR_64
}

fn default_filesystem_package() -> String {
    "filesystem".to_string()
}

fn default_setup_package() -> String {
    "setup".to_string()
}

fn default_rpmdb_path() -> PathBuf {
    PathBuf::from(DEFAULT_RPMDB_PATH)
}

impl ComposeConfig {
    /// Configuration with defaults for a store at `repo`
    pub fn new<P: AsRef<Path>>(repo: P) -> Self {
        Self {
            repo: repo.as_ref().to_path_buf(),
            package_dir: default_package_dir(),
            workers: 0,
            nodocs: false,
            skip_unsupported: false,
            relocate_opt: false,
            check_signatures: true,
            policy: None,
            transaction_color: default_ts_color(),
            preferred_color: default_prefer_color(),
            filesystem_package: default_filesystem_package(),
            setup_package: default_setup_package(),
            fileoverride_packages: Vec::new(),
            rpmdb_path: default_rpmdb_path(),
            skip_unchanged: false,
            hardlink_checkout: false,
            workdir: None,
            repos: Vec::new(),
            scripts: ScriptConfig::default(),
        }
    }

    /// Effective worker count
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Tree-affecting options, with `policy` the checksum of the label policy in use
    pub fn tree_options<'a>(&'a self, policy: Option<&'a str>) -> TreeOptions<'a> {
        TreeOptions {
            nodocs: self.nodocs,
            skip_unsupported: self.skip_unsupported,
            relocate_opt: self.relocate_opt,
            transaction_color: self.transaction_color,
            preferred_color: self.preferred_color,
            filesystem_package: &self.filesystem_package,
            setup_package: &self.setup_package,
            fileoverride_packages: &self.fileoverride_packages,
            rpmdb_path: &self.rpmdb_path,
            policy,
        }
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> ModelResult<()> {
        if self.rpmdb_path.is_absolute() {
            return Err(ModelError::InvalidConfig(format!(
                "rpmdb-path must be relative to the tree root: {}",
                self.rpmdb_path.display()
            )));
        }
        if self.preferred_color & !self.transaction_color != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "preferred-color {} is not part of transaction-color {}",
                self.preferred_color, self.transaction_color
            )));
        }
        let mut ids = std::collections::HashSet::new();
        for repo in &self.repos {
            if !ids.insert(repo.id.as_str()) {
                return Err(ModelError::InvalidConfig(format!(
                    "repository '{}' is listed twice",
                    repo.id
                )));
            }
        }
        if self.scripts.timeout_secs == 0 {
            return Err(ModelError::InvalidConfig(
                "scripts.timeout-secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a compose configuration from a TOML file
pub fn parse_config_file(path: &Path) -> ModelResult<ComposeConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config_string(&content)
}

/// Parse a compose configuration from a TOML string
pub fn parse_config_string(content: &str) -> ModelResult<ComposeConfig> {
    let file: ConfigFile = toml::from_str(content)?;
    file.compose.validate()?;
    Ok(file.compose)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse_config_string("[compose]\nrepo = \"/srv/repo\"\n").unwrap();
        assert_eq!(config, ComposeConfig::new("/srv/repo"));
        assert_eq!(config.filesystem_package, "filesystem");
        assert_eq!(config.transaction_color, 3);
        assert_eq!(config.preferred_color, 2);
        assert_eq!(config.rpmdb_path, PathBuf::from(DEFAULT_RPMDB_PATH));
        assert!(config.check_signatures);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
[compose]
repo = "/srv/repo"
workers = 4
nodocs = true
fileoverride-packages = ["site-overrides"]
workdir = "/var/tmp/treeforge"

[[compose.repo-dirs]]
id = "base"
path = "/srv/mirror/base"

[compose.scripts]
launcher = ["bwrap", "--bind", "{root}", "/"]
timeout-secs = 60
"#;
        let config = parse_config_string(toml).unwrap();
        assert_eq!(config.worker_count(), 4);
        assert!(config.nodocs);
        assert_eq!(config.fileoverride_packages, vec!["site-overrides"]);
        assert_eq!(config.scripts.launcher[0], "bwrap");
        assert_eq!(config.scripts.sanity_command, vec!["/usr/bin/true"]);
        assert_eq!(config.workdir, Some(PathBuf::from("/var/tmp/treeforge")));
        assert_eq!(
            config.repos,
            vec![RepoConfig {
                id: "base".to_string(),
                path: PathBuf::from("/srv/mirror/base"),
            }]
        );
    }

    #[test]
    fn test_tree_options_leave_out_run_settings() {
        let config = ComposeConfig::new("/srv/repo");
        let mut other = config.clone();
        other.workers = 8;
        other.hardlink_checkout = true;
        other.skip_unchanged = true;
        assert_eq!(config.tree_options(None), other.tree_options(None));

        other.nodocs = true;
        assert_ne!(config.tree_options(None), other.tree_options(None));
        assert_ne!(config.tree_options(None), config.tree_options(Some("sha256:01")));
    }

    #[test]
    fn test_invalid_config() {
        let abs = "[compose]\nrepo = \"/r\"\nrpmdb-path = \"/var/lib/rpm\"\n";
        assert!(matches!(parse_config_string(abs), Err(ModelError::InvalidConfig(_))));

        let color = "[compose]\nrepo = \"/r\"\ntransaction-color = 1\npreferred-color = 2\n";
        assert!(parse_config_string(color).is_err());

        let dup = "[compose]\nrepo = \"/r\"\n[[compose.repo-dirs]]\nid = \"a\"\npath = \"/a\"\n[[compose.repo-dirs]]\nid = \"a\"\npath = \"/b\"\n";
        assert!(matches!(parse_config_string(dup), Err(ModelError::InvalidConfig(_))));

        assert!(matches!(
            parse_config_string("[compose]\n"),
            Err(ModelError::ParseError(_))
        ));
    }
}
