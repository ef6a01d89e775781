// src/error.rs

//! Error types for the package cache and assembly engine

use crate::compression::CompressionError;
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while classifying, importing, assembling or committing
#[derive(Error, Debug)]
pub enum Error {
    /// Missing package, unsatisfiable removal, or an unusable goal
    #[error("Resolution error: {0}")]
    ResolutionError(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// I/O failure with the path or operation that caused it
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    #[error("Failed to parse package: {0}")]
    ParseError(String),

    /// Content the importer cannot represent in the target layout
    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    #[error("Checksum mismatch for {what}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("Signature verification failed: {0}")]
    VerificationFailed(String),

    /// Object store inconsistency or misuse
    #[error("Object store error: {0}")]
    StoreError(String),

    #[error("Scriptlet error: {0}")]
    ScriptletError(String),

    /// The checked-out file type differs from what the package header declares
    #[error("File type conflict: {0}")]
    FileTypeConflict(String),

    /// Two packages try to write different content at the same path
    #[error("File conflict: {0}")]
    Conflict(String),

    /// The assembled tree failed a post-script or database sanity check
    #[error("Sanity check failed: {0}")]
    SanityCheck(String),

    /// An internal invariant was broken; indicates a bug in the caller or engine
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error came from a sanity check rather than an engine step
    pub fn is_sanity_check(&self) -> bool {
        matches!(self, Self::SanityCheck(_))
    }

    /// Prefix the message of string-carrying variants with extra context
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            Self::ResolutionError(m) => Self::ResolutionError(format!("{}: {}", ctx, m)),
            Self::IoError(m) => Self::IoError(format!("{}: {}", ctx, m)),
            Self::Io(e) => Self::IoError(format!("{}: {}", ctx, e)),
            Self::StoreError(m) => Self::StoreError(format!("{}: {}", ctx, m)),
            Self::ScriptletError(m) => Self::ScriptletError(format!("{}: {}", ctx, m)),
            Self::UnsupportedContent(m) => Self::UnsupportedContent(format!("{}: {}", ctx, m)),
            Self::FileTypeConflict(m) => Self::FileTypeConflict(format!("{}: {}", ctx, m)),
            Self::Conflict(m) => Self::Conflict(format!("{}: {}", ctx, m)),
            Self::ParseError(m) => Self::ParseError(format!("{}: {}", ctx, m)),
            other => other,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::ConfigError(e.to_string())
    }
}
