//! Error handling helpers and the engine-wide error taxonomy.

use anyhow::Error;
use thiserror::Error;

/// Chain creates a string from an error stack.
pub fn chain(res: Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

/// Stable, domain-level error taxonomy. Every variant carries a human
/// message; callers match on the variant for programmatic handling and log
/// the `Display` output for operators.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime timeout after {0:?}: {1}")]
    RuntimeTimeout(std::time::Duration, String),

    #[error("runtime error (exit code {code:?}): {stderr_tail}")]
    RuntimeError { code: Option<i32>, stderr_tail: String },

    #[error("bundle source missing: {0}")]
    BundleSourceMissing(String),

    #[error("bundle missing on resume: {0}")]
    BundleMissingOnResume(String),

    #[error("image in use: {0}")]
    ImageInUse(String),

    #[error("volume in use: {0}")]
    VolumeInUse(String),

    #[error("busy shutting down: {0}")]
    BusyShuttingDown(String),

    #[error("checkpoint unavailable: {0}")]
    CheckpointUnavailable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn chain() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = super::chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }

    #[test]
    fn display_carries_code() {
        let err = EngineError::ImageInUse("img-1".into());
        assert_eq!(err.to_string(), "image in use: img-1");
    }
}
