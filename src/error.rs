//! Error types for kfx-dist
//!
//! All modules use `DistResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kfx-dist operations
pub type DistResult<T> = Result<T, DistError>;

/// All errors that can occur in kfx-dist
#[derive(Error, Debug)]
pub enum DistError {
    // Request errors
    #[error("Unknown target: {name} (known targets: {})", known.join(", "))]
    UnknownTarget { name: String, known: Vec<String> },

    // Cache errors
    #[error("Cache input unavailable: {0}")]
    InputUnavailable(PathBuf),

    #[error("Cache entry corrupt: {0}")]
    CacheCorrupt(String),

    #[error("Cache location {path} is not writable: {source}")]
    CacheUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Build errors
    #[error("Build of {stage} stage failed: {reason}")]
    Build { stage: String, reason: String },

    #[error("Intermediate stage unavailable: {0}")]
    IntermediateUnavailable(String),

    #[error("Container engine not found: {program}")]
    EngineNotFound { program: String },

    // Artifact errors
    #[error("Failed to decompress {path}: {reason}")]
    Decompression { path: PathBuf, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("{0} already exists. Use --force to overwrite.")]
    AlreadyExists(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DistError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a build stage error
    pub fn build(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Build {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error aborts the whole run rather than a single target
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownTarget { .. }
                | Self::CacheUnwritable { .. }
                | Self::EngineNotFound { .. }
                | Self::ConfigInvalid { .. }
                | Self::ConfigDirCreate { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::UnknownTarget { .. } => Some("Run: kfx-dist --list-targets"),
            Self::EngineNotFound { .. } => {
                Some("Install docker or podman, or pass --engine with the program to use")
            }
            Self::CacheUnwritable { .. } => Some("Set [cache] dir in the config to a writable path"),
            Self::InputUnavailable(_) => Some("Check out submodules: git submodule update --init"),
            _ => None,
        }
    }
}
