//! Host networking errors

use thiserror::Error;

/// Errors raised while programming the host
#[derive(Debug, Error)]
pub enum NetworkError {
    /// A command exited non-zero for a reason other than exists/not-found
    #[error("command `{command}` failed: {stderr}")]
    Command {
        /// Command line
        command: String,
        /// Captured stderr
        stderr: String,
    },

    /// Spawning a command, opening a socket or touching /proc failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Kernel output could not be understood
    #[error("Parse error: {0}")]
    Parse(String),

    /// The kernel rejected a netlink request
    #[error("netlink {what}: {message}")]
    Netlink {
        /// Object the request was about
        what: String,
        /// Kernel or transport error
        message: String,
    },

    /// Entering or leaving a network namespace failed
    #[error("Netns error: {0}")]
    Netns(String),

    /// The object being added is already there
    #[error("Already exists: {0}")]
    Exists(String),

    /// The object being removed is not there
    #[error("Not found: {0}")]
    NotFound(String),

    /// No link matches the given name or MAC
    #[error("Link not found: {0}")]
    LinkNotFound(String),
}

/// Coerce idempotence errors to success
pub trait NetworkResultExt {
    /// Treat `Exists` as success
    fn ignore_exists(self) -> Result<(), NetworkError>;
    /// Treat `NotFound` and `LinkNotFound` as success
    fn ignore_not_found(self) -> Result<(), NetworkError>;
}

impl NetworkResultExt for Result<(), NetworkError> {
    fn ignore_exists(self) -> Result<(), NetworkError> {
        match self {
            Err(NetworkError::Exists(_)) => Ok(()),
            other => other,
        }
    }

    fn ignore_not_found(self) -> Result<(), NetworkError> {
        match self {
            Err(NetworkError::NotFound(_) | NetworkError::LinkNotFound(_)) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_helpers() {
        assert!(Err::<(), _>(NetworkError::Exists("rule".into())).ignore_exists().is_ok());
        assert!(Err::<(), _>(NetworkError::NotFound("rule".into())).ignore_exists().is_err());
        assert!(Err::<(), _>(NetworkError::LinkNotFound("eth9".into())).ignore_not_found().is_ok());
        assert!(Err::<(), _>(NetworkError::Parse("x".into())).ignore_not_found().is_err());
    }
}
