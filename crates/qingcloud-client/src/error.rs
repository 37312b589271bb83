//! QingCloud client errors

use thiserror::Error;

/// Errors that can occur when interacting with the QingCloud API
#[derive(Debug, Error)]
pub enum QingCloudError {
    /// HTTP request/response error (retryable)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// QingCloud API returned a non-zero ret_code
    #[error("QingCloud API error {code}: {message}")]
    Api {
        /// `ret_code` from the response
        code: i64,
        /// `message` from the response
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// An asynchronous job did not finish in time
    #[error("Job {0} timed out")]
    JobTimeout(String),

    /// An asynchronous job finished unsuccessfully
    #[error("Job {job_id} failed with status {status}")]
    JobFailed {
        /// Job id
        job_id: String,
        /// Terminal job status
        status: String,
    },

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Credentials file could not be loaded
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl QingCloudError {
    /// Whether the request may succeed if sent again
    pub fn is_transient(&self) -> bool {
        matches!(self, QingCloudError::Http(_))
    }
}
