//! Top-level error types for the epiloop gateway core.

use std::path::PathBuf;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Load {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("include depth exceeded at {path} (max {max})")]
    IncludeDepth { path: PathBuf, max: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Credential store errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to write auth profile store {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid auth profile id: {0}")]
    InvalidProfileId(String),

    #[error("auth profile not found: {id}")]
    NotFound { id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Workspace bootstrap errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write bootstrap file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Security audit and hardening errors.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("failed to write config {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config {path} is a symlink, not rewriting it")]
    ConfigSymlink { path: PathBuf },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
