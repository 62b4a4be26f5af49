//! The computation surface the client drives but doesn't implement.
//!
//! Kernels run inside a worker and own their model copy exclusively, the
//! `ModelState` lives next to the coordinator and tracks the deltas that are
//! exchanged with the server.

use tokio::sync::mpsc;

use crate::{
    error::ComputeError,
    protocol::{EvalArgs, Severity, TrainArgs, ValidateArgs, WorkerResponse},
};

pub type Result<T> = std::result::Result<T, ComputeError>;

/// Binding through which a compute module streams progress to the
/// coordinator while a request is still running.
#[derive(Clone)]
pub struct LogEmitter {
    tx: mpsc::UnboundedSender<WorkerResponse>,
}

impl LogEmitter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WorkerResponse>) -> Self {
        Self { tx }
    }

    /// Emits a non terminating log reply.
    ///
    /// # Arguments
    /// * `message` - The text to forward.
    /// * `level` - A `Severity` or its numeric level.
    pub fn log(&self, message: impl Into<String>, level: impl Into<Severity>) {
        let msg = WorkerResponse::Log {
            message: message.into(),
            severity: level.into(),
        };

        // The coordinator side is gone once the pool is closed.
        let _ = self.tx.send(msg);
    }
}

/// One isolated instance of the compute kernels, owned by a single worker.
///
/// All calls are synchronous and CPU bound, they run on the blocking pool.
pub trait ComputeModule: Send + 'static {
    /// One time bootstrap, receives the binding used to emit logs later on.
    fn init(&mut self, log: LogEmitter) -> Result<()>;

    /// Trains on a batch and returns the serialized deltas.
    fn train(&mut self, args: &TrainArgs) -> Result<Vec<u8>>;

    /// Validates a model against a batch and returns its accuracy.
    fn validate(&mut self, args: &ValidateArgs) -> Result<f64>;

    /// Runs inference over the given samples.
    fn evaluate(&mut self, args: &EvalArgs) -> Result<Vec<f32>>;
}

/// The model held by the main side of a training session.
pub trait ModelState: Send + Sync + 'static {
    /// Replaces the current model with the given storage and config.
    fn load_initial(&self, storage: &[u8], config: &[u8]) -> Result<()>;

    /// Applies deltas pushed by the server.
    fn load_deltas(&self, deltas: &[u8]) -> Result<()>;

    /// Applies deltas produced by a local training job, these count towards
    /// the push decision.
    fn merge_trained(&self, deltas: &[u8]) -> Result<()>;

    /// The current model storage, handed to new training jobs.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Whether enough local progress accumulated to be worth pushing.
    fn should_push(&self) -> bool;

    /// Serializes and resets the accumulated local deltas.
    fn export_deltas(&self) -> Result<Vec<u8>>;
}
