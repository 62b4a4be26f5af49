use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use log::{debug, warn};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::{self, JoinHandle},
};

use crate::{
    compute::{ComputeModule, LogEmitter},
    error::ComputeError,
    protocol::{Job, JobOutput, WorkerRequest, WorkerResponse},
};

pub type WorkerId = usize;

/// The coordinator's end of one execution unit: an ordered request channel in,
/// an ordered response channel out.
pub struct WorkerHandle {
    id: WorkerId,
    requests: UnboundedSender<WorkerRequest>,
    responses: UnboundedReceiver<WorkerResponse>,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Wraps the channels of a custom worker runtime.
    ///
    /// # Arguments
    /// * `id` - Identifier used for observability, unique within a pool.
    /// * `requests` - Sending end the coordinator posts requests to.
    /// * `responses` - Receiving end the worker replies through.
    /// * `task` - The runtime's task, aborted when the pool closes.
    ///
    /// # Returns
    /// A new `WorkerHandle` instance.
    pub fn new(
        id: WorkerId,
        requests: UnboundedSender<WorkerRequest>,
        responses: UnboundedReceiver<WorkerResponse>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            requests,
            responses,
            task,
        }
    }

    /// The worker's identifier within its pool.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        WorkerId,
        UnboundedSender<WorkerRequest>,
        UnboundedReceiver<WorkerResponse>,
        Option<JoinHandle<()>>,
    ) {
        (self.id, self.requests, self.responses, self.task)
    }
}

/// Spawns a worker runtime owning `module` and returns its handle.
///
/// Must be called from within a tokio runtime.
pub fn spawn<M: ComputeModule>(id: WorkerId, module: M) -> WorkerHandle {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();

    let runtime = Runtime {
        id,
        module: Some(module),
        ready: false,
        tx: resp_tx,
    };

    let task = tokio::spawn(runtime.run(req_rx));
    WorkerHandle::new(id, req_tx, resp_rx, Some(task))
}

/// Worker side shim, executes one request at a time on the blocking pool.
struct Runtime<M> {
    id: WorkerId,
    /// Moved into the blocking task for the duration of each request, `None`
    /// only if that task never came back.
    module: Option<M>,
    ready: bool,
    tx: UnboundedSender<WorkerResponse>,
}

impl<M: ComputeModule> Runtime<M> {
    async fn run(mut self, mut rx: UnboundedReceiver<WorkerRequest>) {
        while let Some(request) = rx.recv().await {
            let reply = self.handle(request).await;
            if self.tx.send(reply).is_err() || self.module.is_none() {
                break;
            }
        }

        debug!(worker_id = self.id; "worker runtime stopped");
    }

    async fn handle(&mut self, request: WorkerRequest) -> WorkerResponse {
        let Some(mut module) = self.module.take() else {
            return error_reply("compute module is unavailable");
        };

        let is_init = matches!(request, WorkerRequest::Init);
        let ready = self.ready;
        let log = LogEmitter::new(self.tx.clone());

        let joined = task::spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                execute(&mut module, request, ready, log)
            }));
            (module, result)
        })
        .await;

        let (module, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!(worker_id = self.id; "compute task did not complete: {e}");
                return error_reply(format!("compute task did not complete: {e}"));
            }
        };

        self.module = Some(module);
        match result {
            Ok(Ok(data)) => {
                self.ready |= is_init;
                WorkerResponse::Response { data }
            }
            Ok(Err(e)) => error_reply(e.message()),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!(worker_id = self.id; "compute kernel panicked: {msg}");
                error_reply(format!("compute kernel panicked: {msg}"))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }

    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn execute<M: ComputeModule>(
    module: &mut M,
    request: WorkerRequest,
    ready: bool,
    log: LogEmitter,
) -> Result<JobOutput, ComputeError> {
    let job = match request {
        WorkerRequest::Init => return module.init(log).map(|_| JobOutput::Unit),
        WorkerRequest::Process { job } => job,
    };

    if !ready {
        return Err(ComputeError::new(format!(
            "received a {} job before a successful init",
            job.kind()
        )));
    }

    match job {
        Job::Train(args) => module.train(&args).map(JobOutput::Bytes),
        Job::Validate(args) => module.validate(&args).map(JobOutput::Scalar),
        Job::Eval(args) => module.evaluate(&args).map(JobOutput::Vector),
    }
}

fn error_reply(message: impl Into<String>) -> WorkerResponse {
    WorkerResponse::Error {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        compute::Result,
        protocol::{EvalArgs, Severity, TrainArgs, ValidateArgs},
    };

    #[derive(Default)]
    struct Echo {
        log: Option<LogEmitter>,
    }

    impl ComputeModule for Echo {
        fn init(&mut self, log: LogEmitter) -> Result<()> {
            self.log = Some(log);
            Ok(())
        }

        fn train(&mut self, args: &TrainArgs) -> Result<Vec<u8>> {
            if let Some(log) = &self.log {
                log.log("epoch 1", 0u8);
                log.log("slow batch", Severity::Warning);
            }

            Ok(args.pairs.to_vec())
        }

        fn validate(&mut self, _: &ValidateArgs) -> Result<f64> {
            Err(ComputeError::new("no test data"))
        }

        fn evaluate(&mut self, args: &EvalArgs) -> Result<Vec<f32>> {
            if args.inputs.is_empty() {
                panic!("empty inputs");
            }

            Ok(args.inputs.iter().map(|x| x * 2.0).collect())
        }
    }

    fn train_job(pairs: &[u8]) -> WorkerRequest {
        let blob: Arc<[u8]> = Arc::from(pairs);
        WorkerRequest::Process {
            job: Job::Train(TrainArgs {
                config: blob.clone(),
                storage: blob.clone(),
                pairs: blob,
                workers: None,
            }),
        }
    }

    fn eval_job(inputs: Vec<f32>) -> WorkerRequest {
        let blob: Arc<[u8]> = Arc::from(&b""[..]);
        WorkerRequest::Process {
            job: Job::Eval(EvalArgs {
                config: blob.clone(),
                storage: blob,
                inputs,
            }),
        }
    }

    #[tokio::test]
    async fn logs_precede_the_terminating_reply() {
        let (_, tx, mut rx, _) = spawn(0, Echo::default()).into_parts();

        tx.send(WorkerRequest::Init).unwrap();
        tx.send(train_job(&[7, 8])).unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerResponse::Response {
                data: JobOutput::Unit
            }
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(!first.is_terminal() && !second.is_terminal());
        assert_eq!(
            second,
            WorkerResponse::Log {
                message: "slow batch".into(),
                severity: Severity::Warning
            }
        );

        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerResponse::Response {
                data: JobOutput::Bytes(vec![7, 8])
            }
        );
    }

    #[tokio::test]
    async fn process_before_init_is_rejected() {
        let (_, tx, mut rx, _) = spawn(1, Echo::default()).into_parts();

        tx.send(train_job(&[1])).unwrap();
        let reply = rx.recv().await.unwrap();
        assert!(matches!(reply, WorkerResponse::Error { message } if message.contains("before a successful init")));
    }

    #[tokio::test]
    async fn kernel_errors_and_panics_become_error_replies() {
        let (_, tx, mut rx, _) = spawn(2, Echo::default()).into_parts();
        let blob: Arc<[u8]> = Arc::from(&b""[..]);

        tx.send(WorkerRequest::Init).unwrap();
        tx.send(WorkerRequest::Process {
            job: Job::Validate(ValidateArgs {
                config: blob.clone(),
                storage: blob.clone(),
                pairs: blob,
            }),
        })
        .unwrap();
        tx.send(eval_job(vec![])).unwrap();
        tx.send(eval_job(vec![1.0])).unwrap();

        assert!(rx.recv().await.unwrap().is_terminal());
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerResponse::Error {
                message: "no test data".into()
            }
        );

        let panicked = rx.recv().await.unwrap();
        assert_eq!(
            panicked,
            WorkerResponse::Error {
                message: "compute kernel panicked: empty inputs".into()
            }
        );

        // The module survives the panic and keeps serving.
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerResponse::Response {
                data: JobOutput::Vector(vec![2.0])
            }
        );
    }
}
