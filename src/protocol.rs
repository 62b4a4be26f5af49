//! Message shapes exchanged between the coordinator and its workers.
//!
//! Every worker receives exactly one `Init` before any `Process` request and
//! answers each request with any number of `Log` replies followed by a single
//! terminating `Response` or `Error`.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Shared, immutable byte buffer (model storage, configs, data pairs).
pub type Blob = Arc<[u8]>;

/// Identifies which compute entry point a job dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Train,
    Validate,
    Eval,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Train => "Train",
            Self::Validate => "Validate",
            Self::Eval => "Eval",
        };

        f.write_str(name)
    }
}

/// Arguments of a training job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainArgs {
    pub config: Blob,
    pub storage: Blob,
    pub pairs: Blob,
    /// Optional hint of how many workers share the training load.
    pub workers: Option<u32>,
}

/// Arguments of a validation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateArgs {
    pub config: Blob,
    pub storage: Blob,
    pub pairs: Blob,
}

/// Arguments of an evaluation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalArgs {
    pub config: Blob,
    pub storage: Blob,
    pub inputs: Vec<f32>,
}

/// A unit of work, one variant per job kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", content = "args")]
pub enum Job {
    Train(TrainArgs),
    Validate(ValidateArgs),
    Eval(EvalArgs),
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Train(_) => JobKind::Train,
            Self::Validate(_) => JobKind::Validate,
            Self::Eval(_) => JobKind::Eval,
        }
    }
}

/// Coordinator -> worker message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Init,
    Process { job: Job },
}

impl WorkerRequest {
    /// The job carried by a `Process` request.
    pub fn into_job(self) -> Option<Job> {
        match self {
            Self::Init => None,
            Self::Process { job } => Some(job),
        }
    }
}

/// Severity of a log entry, numerically 0, 1 and 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl From<u8> for Severity {
    fn from(level: u8) -> Self {
        match level {
            0 => Self::Info,
            1 => Self::Warning,
            _ => Self::Error,
        }
    }
}

/// The untyped value a worker hands back for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "value", rename_all = "snake_case")]
pub enum JobOutput {
    Unit,
    Bytes(Vec<u8>),
    Scalar(f64),
    Vector(Vec<f32>),
}

impl JobOutput {
    /// Name of the value's shape, used in mismatch errors.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Unit => "nothing",
            Self::Bytes(_) => "bytes",
            Self::Scalar(_) => "number",
            Self::Vector(_) => "number array",
        }
    }
}

/// Worker -> coordinator message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Terminating reply carrying the request's result.
    Response { data: JobOutput },
    /// Non terminating progress or diagnostic message.
    Log { message: String, severity: Severity },
    /// Terminating reply for a request that failed inside the worker.
    Error { message: String },
}

impl WorkerResponse {
    /// Whether the reply ends its request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Log { .. })
    }
}

/// Result types a job kind may resolve to, checked against what the worker
/// actually returned.
pub trait JobResult: Sized + Send + 'static {
    /// Name of the expected shape, used in mismatch errors.
    const EXPECTED: &'static str;

    fn from_output(kind: JobKind, output: JobOutput) -> Result<Self, JobError>;
}

fn mismatch<T: JobResult>(kind: JobKind, output: &JobOutput) -> JobError {
    JobError::TypeMismatch {
        kind,
        expected: T::EXPECTED,
        got: output.shape(),
    }
}

impl JobResult for Vec<u8> {
    const EXPECTED: &'static str = "bytes";

    fn from_output(kind: JobKind, output: JobOutput) -> Result<Self, JobError> {
        match output {
            JobOutput::Bytes(bytes) => Ok(bytes),
            other => Err(mismatch::<Self>(kind, &other)),
        }
    }
}

impl JobResult for f64 {
    const EXPECTED: &'static str = "number";

    fn from_output(kind: JobKind, output: JobOutput) -> Result<Self, JobError> {
        match output {
            JobOutput::Scalar(value) => Ok(value),
            other => Err(mismatch::<Self>(kind, &other)),
        }
    }
}

impl JobResult for Vec<f32> {
    const EXPECTED: &'static str = "number array";

    fn from_output(kind: JobKind, output: JobOutput) -> Result<Self, JobError> {
        match output {
            JobOutput::Vector(values) => Ok(values),
            other => Err(mismatch::<Self>(kind, &other)),
        }
    }
}
