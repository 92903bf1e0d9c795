//! Error types for MIDI access management.

use std::time::Duration;
use thiserror::Error;

/// Failures of the permission negotiation with the host.
///
/// Cloneable so a single negotiated outcome can be handed to every
/// caller waiting on the same request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("MIDI access is not supported by this host: {0}")]
    Unsupported(String),

    #[error("host environment is not trusted for MIDI access: {0}")]
    InsecureEnvironment(String),

    #[error("MIDI access was denied")]
    Denied,

    #[error("MIDI access request timed out after {0:?}")]
    Timeout(Duration),

    #[error("MIDI access request was cancelled")]
    Cancelled,
}

impl AccessError {
    /// Short stable name, used for once-per-session reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            AccessError::Unsupported(_) => "unsupported",
            AccessError::InsecureEnvironment(_) => "insecure-environment",
            AccessError::Denied => "permission-denied",
            AccessError::Timeout(_) => "permission-timeout",
            AccessError::Cancelled => "cancelled",
        }
    }

    /// Whether retrying without user action can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AccessError::Timeout(_))
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("MIDI port error: {0}")]
    Port(String),

    #[error("invalid handler profile: {0}")]
    InvalidProfile(String),

    #[error("handler '{profile}' failed to instantiate: {reason}")]
    HandlerInstantiation { profile: String, reason: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<midir::InitError> for Error {
    fn from(e: midir::InitError) -> Self {
        Error::Port(e.to_string())
    }
}

impl From<midir::PortInfoError> for Error {
    fn from(e: midir::PortInfoError) -> Self {
        Error::Port(e.to_string())
    }
}

impl From<midir::ConnectError<midir::MidiInput>> for Error {
    fn from(e: midir::ConnectError<midir::MidiInput>) -> Self {
        Error::Port(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
