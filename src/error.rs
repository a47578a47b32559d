use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Service-wide error types.
///
/// Every variant is fatal for the current run: the coordinator logs it and
/// the process exits non-zero. Nothing here is retried.
#[derive(Error, Debug)]
pub enum AuthoriserError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Trust broker authentication failed: {0}")]
    BrokerAuth(String),

    #[error("Access credential request failed: {0}")]
    Provisioning(String),

    #[error("Trust broker response was invalid: {0}")]
    InvalidBrokerResponse(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Relay socket {} is already in use", .0.display())]
    SocketInUse(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No submission received within {}s", .0.as_secs())]
    SubmissionTimeout(Duration),

    #[error("Terminated by {0}")]
    Terminated(&'static str),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl AuthoriserError {
    pub fn tunnel<S: Into<String>>(msg: S) -> Self {
        Self::Tunnel(msg.into())
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Whether the run ended because an operator or supervisor asked it to.
    pub fn is_termination(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

/// Result type alias using AuthoriserError
pub type AuthoriserResult<T> = Result<T, AuthoriserError>;
