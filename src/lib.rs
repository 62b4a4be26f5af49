pub mod cache;
pub mod compute;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod session;
pub mod train_socket;
pub mod worker;

pub use cache::BlobCache;
pub use compute::{ComputeModule, LogEmitter, ModelState};
pub use config::SessionConfig;
pub use coordinator::{JobHandle, WorkersCoordinator};
pub use error::{ComputeError, ConfigError, JobError, ServerError, SocketError};
pub use logging::{init_logging, LogEntry, LogSink};
pub use protocol::{Blob, EvalArgs, JobKind, Severity, TrainArgs, ValidateArgs};
pub use server::{Assignment, PlaygroundServer, Registrar, ServerClient, ValidationResult};
pub use session::{SessionContext, TrainingSession};
pub use train_socket::TrainSocket;
pub use worker::{WorkerHandle, WorkerId};
