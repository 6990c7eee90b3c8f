use std::path::PathBuf;

/// Per-file failures. All of these are caught at the processor boundary and
/// turned into an outcome record; none aborts the batch.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Sidecar exists but cannot be read or parsed as JSON.
    #[error("malformed sidecar {path}: {reason}")]
    MalformedSidecar { path: PathBuf, reason: String },

    /// Metadata decoded but cannot be rendered into an EXIF block.
    #[error("encoding failure: {0}")]
    Encoding(String),

    /// Filesystem write/copy failure.
    #[error("write failure: {0}")]
    Write(#[from] std::io::Error),
}

/// Per-lookup failures in the geocoding pass. Cached as unresolved so a
/// failing key is not retried within the run.
#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("network error: {0}")]
    Network(String),

    /// The service answered but not with a usable address.
    #[error("unusable geocoding response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for GeocodeError {
    fn from(e: reqwest::Error) -> Self {
        GeocodeError::Network(e.to_string())
    }
}
