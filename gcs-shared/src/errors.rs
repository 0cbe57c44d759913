//! Error types for the guest container service.

use std::fmt;

/// Result alias used across the host and guest crates.
pub type GcsResult<T> = Result<T, GcsError>;

/// Coarse classification of a [`GcsError`], used by callers that map
/// failures onto protocol status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidRequest,
    Unsupported,
    Backend,
    Runtime,
    PartialFailure,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Backend => "backend failure",
            ErrorKind::Runtime => "runtime failure",
            ErrorKind::PartialFailure => "partial failure",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GcsError {
    #[error("container \"{0}\" not found")]
    ContainerNotFound(String),

    #[error("process {0} not found")]
    ProcessNotFound(u32),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Unsupported(String),

    /// A mount backend failed; `message` names the path or device.
    #[error("{message}: {source}")]
    Storage {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime error: {0}")]
    Runtime(String),

    /// A multi-step operation failed after some steps had completed and
    /// were rolled back.
    #[error("{message}: {source}")]
    PartialFailure {
        message: String,
        #[source]
        source: Box<GcsError>,
    },

    #[error("{message}: {source}")]
    Context {
        message: String,
        #[source]
        source: Box<GcsError>,
    },

    #[error("{}", join_errors(.0))]
    Multiple(Vec<GcsError>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

fn join_errors(errors: &[GcsError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl GcsError {
    /// Build a backend error from any I/O-convertible cause.
    pub fn storage(message: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        GcsError::Storage {
            message: message.into(),
            source: source.into(),
        }
    }

    /// Classify this error. Context wrappers are transparent.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GcsError::ContainerNotFound(_) | GcsError::ProcessNotFound(_) => ErrorKind::NotFound,
            GcsError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            GcsError::Unsupported(_) => ErrorKind::Unsupported,
            GcsError::Storage { .. } | GcsError::Io(_) | GcsError::Json(_) => ErrorKind::Backend,
            GcsError::Runtime(_) => ErrorKind::Runtime,
            GcsError::PartialFailure { .. } => ErrorKind::PartialFailure,
            GcsError::Context { source, .. } => source.kind(),
            GcsError::Multiple(errors) => errors
                .first()
                .map(GcsError::kind)
                .unwrap_or(ErrorKind::Internal),
            GcsError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Innermost error beneath any context wrappers.
    pub fn root_cause(&self) -> &GcsError {
        match self {
            GcsError::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn context(self, message: impl Into<String>) -> Self {
        GcsError::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }
}

/// Context helpers for results whose error converts into [`GcsError`].
pub trait ResultExt<T> {
    fn context(self, message: impl Into<String>) -> GcsResult<T>;

    fn with_context<F, S>(self, f: F) -> GcsResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<GcsError>,
{
    fn context(self, message: impl Into<String>) -> GcsResult<T> {
        self.map_err(|e| e.into().context(message))
    }

    fn with_context<F, S>(self, f: F) -> GcsResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
