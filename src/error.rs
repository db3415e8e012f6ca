//! Error types for the attribution pipeline.

use thiserror::Error;

/// Top-level error for a pipeline run. Reaching one of these aborts the run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Validation failures exceeded tolerance: {invalid} of {total} events rejected \
         (tolerance {tolerance})"
    )]
    ValidationThreshold {
        invalid: usize,
        total: usize,
        tolerance: f64,
    },

    #[error("{failed} of {total} chunks permanently failed")]
    ChunkFailures { failed: usize, total: usize },

    #[error("Run exceeded timeout of {0} seconds")]
    RunTimeout(u64),
}

/// Errors from the storage collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record at line {line}: {message}")]
    Malformed { line: usize, message: String },
}

/// Errors from the remote scoring service.
///
/// The transient/non-transient split drives the retry policy: transient
/// failures are retried with backoff, non-transient ones fail the chunk
/// immediately.
#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by scoring service")]
    RateLimited,

    #[error("Scoring service unavailable (status {0})")]
    ServiceUnavailable(u16),

    #[error("Scoring service rejected chunk (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Response chunk_id {got} does not match submitted chunk {expected}")]
    ChunkIdMismatch { expected: String, got: String },
}

impl ScoringError {
    /// Whether the retry policy may attempt this request again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScoringError::Transport(_)
                | ScoringError::Timeout
                | ScoringError::RateLimited
                | ScoringError::ServiceUnavailable(_)
        )
    }

    /// Whether the failure was a rate-limit signal, which backs off the
    /// shared gate rather than just this worker.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ScoringError::RateLimited)
    }
}

impl From<reqwest::Error> for ScoringError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScoringError::Timeout
        } else if err.is_decode() {
            ScoringError::MalformedResponse(err.to_string())
        } else {
            ScoringError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ScoringError::Timeout.is_transient());
        assert!(ScoringError::RateLimited.is_transient());
        assert!(ScoringError::ServiceUnavailable(503).is_transient());
        assert!(ScoringError::Transport("connection reset".into()).is_transient());

        assert!(!ScoringError::Rejected {
            status: 422,
            body: "bad journey".into()
        }
        .is_transient());
        assert!(!ScoringError::MalformedResponse("truncated json".into()).is_transient());
        assert!(!ScoringError::ChunkIdMismatch {
            expected: "run-1.0".into(),
            got: "run-1.1".into()
        }
        .is_transient());
    }

    #[test]
    fn test_rate_limit_flag() {
        assert!(ScoringError::RateLimited.is_rate_limit());
        assert!(!ScoringError::ServiceUnavailable(500).is_rate_limit());
    }
}
