//! Error types for xcgi-core.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for xcgi-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in xcgi-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The sites directory could not be scanned.
    #[error("cannot read sites directory {}: {source}", path.display())]
    SitesDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Neither the routed script nor the root's default script exists.
    #[error("no script for {}", path.display())]
    ScriptNotFound { path: PathBuf },

    /// The OS refused to create the child process.
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The script was killed by a signal or reported an unusable exit status.
    #[error("script {} terminated abnormally: {detail}", script.display())]
    AbnormalExit { script: PathBuf, detail: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
