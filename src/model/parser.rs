// src/model/parser.rs

//! Parser for treespec TOML files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{ModelError, ModelResult};

/// Current treespec file version
pub const TREESPEC_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreespecFile {
    treespec: Treespec,
}

/// Declarative description of one tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Treespec {
    /// Treespec file version (for forward compatibility)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Ref the composed commit is published under
    #[serde(rename = "ref")]
    pub ref_name: String,

    /// Ref of the tree to layer on top of, if any
    #[serde(default)]
    pub base: Option<String>,

    /// Package names to install
    #[serde(default)]
    pub packages: Vec<String>,

    /// Base packages to take out of the tree
    #[serde(default)]
    pub remove: Vec<String>,

    /// Package files given directly rather than through a repository
    #[serde(default)]
    pub local_packages: Vec<PathBuf>,

    /// Refs whose trees are laid over the result after package scripts
    #[serde(default)]
    pub overlays: Vec<String>,
}

fn default_version() -> u32 {
    TREESPEC_VERSION
}

impl Treespec {
    /// Create an empty treespec publishing to `ref_name`
    pub fn new(ref_name: &str) -> Self {
        Self {
            version: TREESPEC_VERSION,
            ref_name: ref_name.to_string(),
            base: None,
            packages: Vec::new(),
            remove: Vec::new(),
            local_packages: Vec::new(),
            overlays: Vec::new(),
        }
    }

    /// Validate the treespec for consistency
    pub fn validate(&self) -> ModelResult<()> {
        if self.version != TREESPEC_VERSION {
            return Err(ModelError::VersionMismatch {
                expected: TREESPEC_VERSION,
                found: self.version,
            });
        }

        if self.ref_name.is_empty() {
            return Err(ModelError::InvalidTreespec("ref must not be empty".to_string()));
        }

        for pkg in &self.packages {
            if self.remove.contains(pkg) {
                return Err(ModelError::InvalidTreespec(format!(
                    "Package '{}' is both in packages and remove lists",
                    pkg
                )));
            }
        }

        if !self.remove.is_empty() && self.base.is_none() {
            return Err(ModelError::InvalidTreespec(
                "remove requires a base tree".to_string(),
            ));
        }

        Ok(())
    }

    /// Order-independent form used for fingerprinting
    ///
    /// Package lists are sorted and deduplicated; the result serializes
    /// identically for treespecs that request the same thing.
    pub fn canonicalize(&self) -> Self {
        fn norm<T: Ord + Clone>(v: &[T]) -> Vec<T> {
            let mut v = v.to_vec();
            v.sort();
            v.dedup();
            v
        }
        Self {
            version: self.version,
            ref_name: self.ref_name.clone(),
            base: self.base.clone(),
            packages: norm(&self.packages),
            remove: norm(&self.remove),
            local_packages: norm(&self.local_packages),
            // Overlay order is significant
            overlays: self.overlays.clone(),
        }
    }

    /// Canonical JSON bytes of this treespec
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.canonicalize())
    }

    /// Serialize the treespec to TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&TreespecFile {
            treespec: self.clone(),
        })
    }
}

/// Parse a treespec from a TOML file
pub fn parse_treespec_file(path: &Path) -> ModelResult<Treespec> {
    let content = std::fs::read_to_string(path)?;
    parse_treespec_string(&content)
}

/// Parse a treespec from a TOML string
pub fn parse_treespec_string(content: &str) -> ModelResult<Treespec> {
    let file: TreespecFile = toml::from_str(content)?;
    file.treespec.validate()?;
    Ok(file.treespec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_treespec_string() {
        let toml = r#"
[treespec]
version = 1
ref = "example/x86_64/custom"
base = "example/x86_64/base"
packages = ["vim-minimal", "bash"]
remove = ["nano"]
local-packages = ["/tmp/site.rpm"]
"#;
        let spec = parse_treespec_string(toml).unwrap();
        assert_eq!(spec.ref_name, "example/x86_64/custom");
        assert_eq!(spec.packages.len(), 2);
        assert_eq!(spec.local_packages, vec![PathBuf::from("/tmp/site.rpm")]);
        assert!(spec.overlays.is_empty());
    }

    #[test]
    fn test_conflict_detection() {
        let toml = r#"
[treespec]
ref = "r"
base = "b"
packages = ["nano"]
remove = ["nano"]
"#;
        assert!(matches!(
            parse_treespec_string(toml),
            Err(ModelError::InvalidTreespec(_))
        ));
    }

    #[test]
    fn test_remove_requires_base() {
        let mut spec = Treespec::new("r");
        spec.remove.push("nano".to_string());
        assert!(spec.validate().is_err());
        spec.base = Some("b".to_string());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_version_mismatch() {
        let toml = "[treespec]\nversion = 9\nref = \"r\"\n";
        assert!(matches!(
            parse_treespec_string(toml),
            Err(ModelError::VersionMismatch { expected: 1, found: 9 })
        ));
    }

    #[test]
    fn test_canonical_bytes_ignore_order() {
        let mut a = Treespec::new("r");
        a.packages = vec!["b".to_string(), "a".to_string(), "a".to_string()];
        let mut b = Treespec::new("r");
        b.packages = vec!["a".to_string(), "b".to_string()];
        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());

        b.packages.push("c".to_string());
        assert_ne!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn test_to_toml_round_trip() {
        let mut spec = Treespec::new("example/custom");
        spec.packages.push("bash".to_string());
        let text = spec.to_toml().unwrap();
        assert_eq!(parse_treespec_string(&text).unwrap(), spec);
    }
}
