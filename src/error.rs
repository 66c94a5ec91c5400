//! Error types for the pod supervisor.
//!
//! Every failure is tagged with the stage it belongs to (descriptor,
//! substitution, image, runtime, registry) so the CLI can print a single
//! meaningful line. Descriptor problems additionally carry a [`Location`]
//! pointing at the offending file and field.

use std::path::PathBuf;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A position inside a pod descriptor: source file plus a dotted field path
/// such as `.services.web.build.context`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Descriptor file the error originates from.
    pub file: PathBuf,
    /// Dotted path of the offending field.
    pub pointer: String,
}

impl Location {
    pub fn new(file: impl Into<PathBuf>, pointer: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            pointer: pointer.into(),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.file.display(), self.pointer)
    }
}

/// Errors that can occur while loading, launching or registering a pod.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Descriptor Errors
    // =========================================================================
    /// No descriptor file was found at the given path.
    #[error("descriptor not found: {path} (looked up pod.json, docker-compose.ya?ml)")]
    DescriptorNotFound { path: PathBuf },

    /// The descriptor file could not be parsed.
    #[error("cannot parse {file}: {reason}")]
    Parse { file: PathBuf, reason: String },

    /// A descriptor field failed validation.
    #[error("{location}: {message}")]
    Config { location: Location, message: String },

    /// Service extension chains form a cycle.
    #[error("circular extension: {}", keys.join(", "))]
    CircularExtension { keys: Vec<String> },

    /// An env file entry is not `KEY=VALUE`.
    #[error("invalid env file entry at {file}:{line}")]
    EnvFile { file: PathBuf, line: usize },

    /// A duration field does not parse.
    #[error("invalid duration {value:?}: {reason}")]
    Duration { value: String, reason: String },

    /// A substituted scalar does not parse as its native type.
    #[error("invalid value {value:?}: {reason}")]
    Value { value: String, reason: String },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Image fetch or manifest read failed.
    #[error("cannot fetch image {name:?}: {reason}")]
    Image { name: String, reason: String },

    /// Local image build or import failed.
    #[error("cannot build image {name:?}: {reason}")]
    Build { name: String, reason: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// A runtime CLI invocation failed.
    #[error("launcher: {operation}: {reason}")]
    Runtime { operation: String, reason: String },

    /// The launcher was asked to start a pod that is already running.
    #[error("launcher: pod already running: {uuid}")]
    AlreadyRunning { uuid: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// A Consul request failed or the agent is unreachable.
    #[error("consul: {0}")]
    Registry(String),

    /// A shared key is already taken by a different value.
    #[error("consul: shared key {key:?} already set to a different value and overriding is not allowed")]
    SharedKeyConflict { key: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a [`Error::Config`] at a descriptor location.
    pub fn config(
        file: impl Into<PathBuf>,
        pointer: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Config {
            location: Location::new(file, pointer),
            message: message.into(),
        }
    }

    /// Shorthand for a [`Error::Runtime`] error naming the failed stage.
    pub fn runtime(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Runtime {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}
