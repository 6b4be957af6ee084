use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Content(#[from] ContentError),
}

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("only one of {} may be enabled at a time", .0.join(", "))]
    ConflictingFlags(Vec<&'static str>),
    #[error("unable to find technique(s): {}", .0.join(", "))]
    UnknownTechniques(Vec<String>),
    #[error("no techniques, test guids or config file entries were selected")]
    EmptySelection,
    #[error("command timeout must be greater than zero")]
    ZeroTimeout,
    #[error("max concurrency must be greater than zero")]
    ZeroConcurrency,
    #[error("config file {path:?} does not exist")]
    ConfigNotFound { path: PathBuf },
    #[error("failed to read config file {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config file: {0}")]
    ConfigMalformed(#[from] serde_yaml::Error),
    #[error("config file defines no atomic_tests entries")]
    ConfigEmpty,
    #[error("config entry '{entry}' references undefined inventory '{inventory}'")]
    UnknownInventory { entry: String, inventory: String },
    #[error("config entry must define either a guid or a technique")]
    UnboundConfigEntry,
    #[error("inventory '{name}' has unsupported executor '{executor}'")]
    UnknownInventoryExecutor { name: String, executor: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("unable to find any content under {path:?}; make sure the content path is correct")]
    NotFound { path: PathBuf },
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed definition file {path:?}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid definition file {path:?}: {}", .messages.join("; "))]
    Invalid { path: PathBuf, messages: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConnectionFailed,
    AuthenticationFailed,
    TransportProtocolError,
    Timeout,
    UnsupportedExecutor,
    UnknownTransportError,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::ConnectionFailed => "connection failed",
            FailureKind::AuthenticationFailed => "authentication failed",
            FailureKind::TransportProtocolError => "transport protocol error",
            FailureKind::Timeout => "timed out",
            FailureKind::UnsupportedExecutor => "unsupported executor",
            FailureKind::UnknownTransportError => "unknown transport error",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// A classified transport failure. `error_type` carries the type name of the
/// underlying error so uncategorized failures stay diagnosable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: FailureKind,
    pub error_type: String,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            error_type: String::new(),
            message: message.into(),
        }
    }

    pub fn from_error<E>(kind: FailureKind, err: &E) -> Self
    where
        E: std::error::Error,
    {
        Self {
            kind,
            error_type: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
        }
    }

    pub fn connection<E: std::error::Error>(err: &E) -> Self {
        Self::from_error(FailureKind::ConnectionFailed, err)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(FailureKind::AuthenticationFailed, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransportProtocolError, message)
    }

    pub fn unknown<E: std::error::Error>(err: &E) -> Self {
        Self::from_error(FailureKind::UnknownTransportError, err)
    }

    pub fn timeout(seconds: u64) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("command timed out after {seconds} second(s)"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "run was cancelled")
    }
}
