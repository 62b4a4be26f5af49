use std::{error::Error, fmt};

use crate::protocol::JobKind;

/// Failure raised by a compute kernel or the model state behind it.
#[derive(Debug, Clone)]
pub struct ComputeError(String);

impl ComputeError {
    /// Creates a new `ComputeError`.
    ///
    /// # Arguments
    /// * `msg` - Human readable description of the failure.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// The failure description.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compute error: {}", self.0)
    }
}

impl Error for ComputeError {}

/// Reasons a submitted job never yields its value.
#[derive(Debug, Clone, PartialEq)]
pub enum JobError {
    /// The worker answered with a result shape the job kind doesn't produce.
    TypeMismatch {
        kind: JobKind,
        expected: &'static str,
        got: &'static str,
    },
    /// The worker reported a runtime failure while executing the job.
    Failed { worker_id: usize, msg: String },
    /// The pool was closed while the job was queued or in flight.
    Abandoned,
    /// The job was submitted after the pool was closed.
    Closed,
    /// Every worker of the pool was retired.
    NoWorkers,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch {
                kind,
                expected,
                got,
            } => write!(f, "{kind} job didn't return {expected}, got {got}"),
            Self::Failed { worker_id, msg } => write!(f, "worker {worker_id} failed: {msg}"),
            Self::Abandoned => f.write_str("job abandoned, the worker pool was closed"),
            Self::Closed => f.write_str("the worker pool is closed"),
            Self::NoWorkers => f.write_str("no worker is left in the pool"),
        }
    }
}

impl Error for JobError {}

/// Failures talking to the coordination server over HTTP.
#[derive(Debug)]
pub enum ServerError {
    Http(reqwest::Error),
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    UnsupportedPrefix(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "http error: {e}"),
            Self::Status { url, status } => write!(f, "request to {url} failed with {status}"),
            Self::UnsupportedPrefix(prefix) => write!(f, "prefix {prefix} is not supported"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

/// Failures of the training delta socket.
#[derive(Debug)]
pub enum SocketError {
    /// Obtaining the socket url from the server failed.
    Register(ServerError),
    /// The websocket transport failed.
    WebSocket(tokio_tungstenite::tungstenite::Error),
    /// The peer sent something other than a binary delta frame.
    Protocol(String),
    /// Exporting or applying deltas failed.
    Model(ComputeError),
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(e) => write!(f, "failed to register training worker: {e}"),
            Self::WebSocket(e) => write!(f, "websocket error: {e}"),
            Self::Protocol(msg) => write!(f, "socket protocol violation: {msg}"),
            Self::Model(e) => write!(f, "model error: {e}"),
        }
    }
}

impl Error for SocketError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Register(e) => Some(e),
            Self::WebSocket(e) => Some(e),
            Self::Model(e) => Some(e),
            Self::Protocol(_) => None,
        }
    }
}

impl From<ServerError> for SocketError {
    fn from(value: ServerError) -> Self {
        Self::Register(value)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SocketError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(value)
    }
}

impl From<ComputeError> for SocketError {
    fn from(value: ComputeError) -> Self {
        Self::Model(value)
    }
}

/// Invalid session configuration.
#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl Error for ConfigError {}

