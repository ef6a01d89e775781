// src/model/mod.rs

//! Treespecs and compose configuration
//!
//! A treespec declares the tree to build: which packages it contains, what
//! it removes from a base tree, and the ref it is published under. The
//! compose configuration holds the options of one build host: where the
//! store lives, how many workers to run, and the policy knobs that become
//! part of cache identity.
//!
//! # Example treespec.toml
//!
//! ```toml
//! [treespec]
//! version = 1
//! ref = "example/x86_64/custom"
//! base = "example/x86_64/base"
//!
//! packages = ["bash", "coreutils", "vim-minimal"]
//! remove = ["nano"]
//! local-packages = ["/srv/rpms/site-config-1.0-1.noarch.rpm"]
//! overlays = ["site/overlay/motd"]
//! ```
//!
//! # Example compose.toml
//!
//! ```toml
//! [compose]
//! repo = "/srv/repo"
//! package-dir = "/srv/rpms"
//! workers = 0
//! nodocs = true
//! skip-unsupported = false
//! policy = "/etc/selinux/targeted/contexts/files/file_contexts"
//!
//! [[compose.repo-dirs]]
//! id = "base"
//! path = "/srv/mirror/base"
//!
//! [compose.scripts]
//! launcher = ["bwrap", "--bind", "{root}", "/", "--dev", "/dev", "--proc", "/proc"]
//! timeout-secs = 300
//! ```

pub mod config;
pub mod parser;

pub use config::{
    ComposeConfig, RepoConfig, ScriptConfig, TreeOptions, parse_config_file, parse_config_string,
};
pub use parser::{Treespec, parse_treespec_file, parse_treespec_string};

use thiserror::Error;

/// Errors that can occur when loading treespecs and configuration
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid treespec version: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Invalid treespec: {0}")]
    InvalidTreespec(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for model operations
pub type ModelResult<T> = Result<T, ModelError>;

impl From<ModelError> for crate::Error {
    fn from(e: ModelError) -> Self {
        crate::Error::ConfigError(e.to_string())
    }
}
