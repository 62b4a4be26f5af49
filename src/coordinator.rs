//! Fixed size pool of workers with a FIFO overflow queue.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Instant,
};

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::{
    sync::{
        mpsc::{error::SendError, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    task::JoinHandle,
};

use crate::{
    compute::ComputeModule,
    error::JobError,
    logging::LogSink,
    protocol::{
        EvalArgs, Job, JobOutput, JobResult, TrainArgs, ValidateArgs, WorkerRequest,
        WorkerResponse,
    },
    worker::{self, WorkerHandle, WorkerId},
};

type Completion = Box<dyn FnOnce(Result<JobOutput, JobError>) + Send>;

/// A completion that can no longer succeed, with the reason.
type Lost = (Completion, JobError);

/// A job waiting in the overflow queue.
struct Pending {
    job: Job,
    done: Completion,
}

/// The job a busy worker is executing.
struct InFlight {
    label: String,
    started: Instant,
    done: Completion,
}

struct Slot {
    requests: UnboundedSender<WorkerRequest>,
    /// Set until the worker acknowledges its init request.
    init_started: Option<Instant>,
    in_flight: Option<InFlight>,
}

struct Pool {
    slots: HashMap<WorkerId, Slot>,
    available: HashSet<WorkerId>,
    queue: VecDeque<Pending>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Pool {
    fn active(&self) -> usize {
        self.slots.len() - self.available.len()
    }

    /// Marks `id` busy and posts the job to it.
    ///
    /// # Returns
    /// The job back if the worker can no longer receive requests.
    fn dispatch(&mut self, id: WorkerId, pending: Pending) -> Result<(), Pending> {
        let Pending { job, done } = pending;
        let label = job.kind().to_string();

        let Some(slot) = self.slots.get_mut(&id) else {
            return Err(Pending { job, done });
        };

        if let Err(SendError(request)) = slot.requests.send(WorkerRequest::Process { job }) {
            return match request.into_job() {
                Some(job) => Err(Pending { job, done }),
                None => Ok(()),
            };
        }

        self.available.remove(&id);
        slot.in_flight = Some(InFlight {
            label,
            started: Instant::now(),
            done,
        });

        Ok(())
    }

    /// Hands the job to an idle worker, or queues it when every worker is
    /// busy. Workers found unreachable on the way are retired.
    ///
    /// # Arguments
    /// * `pending` - The job and its completion.
    /// * `head` - Whether a queued job goes back to the head of the queue.
    ///
    /// # Returns
    /// The completions of jobs that can no longer run.
    fn place(&mut self, mut pending: Pending, head: bool) -> Vec<Lost> {
        let mut lost = Vec::new();

        loop {
            let Some(id) = self.available.iter().next().copied() else {
                if self.slots.is_empty() {
                    lost.push((pending.done, JobError::NoWorkers));
                } else if head {
                    self.queue.push_front(pending);
                } else {
                    self.queue.push_back(pending);
                }

                return lost;
            };

            match self.dispatch(id, pending) {
                Ok(()) => return lost,
                Err(returned) => {
                    lost.extend(self.retire(id, "worker is no longer accepting requests"));
                    pending = returned;
                }
            }
        }
    }

    /// Removes `id` from the pool for good. Its job in flight fails, and so
    /// does the queue once no worker is left.
    fn retire(&mut self, id: WorkerId, reason: &str) -> Vec<Lost> {
        let Some(slot) = self.slots.remove(&id) else {
            return Vec::new();
        };

        self.available.remove(&id);
        warn!(worker_id = id; "retiring worker: {reason}");

        let mut lost: Vec<Lost> = slot
            .in_flight
            .into_iter()
            .map(|in_flight| {
                let e = JobError::Failed {
                    worker_id: id,
                    msg: reason.to_string(),
                };
                (in_flight.done, e)
            })
            .collect();

        if self.slots.is_empty() {
            lost.extend(
                self.queue
                    .drain(..)
                    .map(|pending| (pending.done, JobError::NoWorkers)),
            );
        }

        lost
    }
}

struct Inner {
    pool: Mutex<Pool>,
    logs: LogSink,
    /// Busy workers plus queued jobs.
    outstanding: watch::Sender<usize>,
}

impl Inner {
    fn publish(&self, pool: &Pool) {
        self.outstanding.send_replace(pool.active() + pool.queue.len());
    }

    /// Rejects jobs that can no longer run, must be called without the pool
    /// locked.
    fn settle(&self, lost: Vec<Lost>) {
        for (done, e) in lost {
            self.logs.error(e.to_string());
            done(Err(e));
        }
    }

    fn submit(&self, pending: Pending) {
        let mut pool = self.pool.lock();
        if pool.closed {
            drop(pool);
            (pending.done)(Err(JobError::Closed));
            return;
        }

        let lost = pool.place(pending, false);
        self.publish(&pool);
        drop(pool);

        self.settle(lost);
    }

    /// Handles a terminating reply from worker `id`.
    fn finish(&self, id: WorkerId, result: Result<JobOutput, String>) {
        let mut pool = self.pool.lock();
        if pool.closed {
            return;
        }

        let Some(slot) = pool.slots.get_mut(&id) else {
            return;
        };

        if let Some(started) = slot.init_started.take() {
            let ms = started.elapsed().as_millis();
            match result {
                Ok(_) => {
                    drop(pool);
                    self.logs.info(format!("Finished init task in {ms}ms"));
                }
                Err(msg) => {
                    let lost = pool.retire(id, "worker failed to initialize");
                    self.publish(&pool);
                    drop(pool);

                    self.logs
                        .error(format!("worker {id} failed to initialize: {msg}"));
                    self.settle(lost);
                }
            }

            return;
        }

        let Some(in_flight) = slot.in_flight.take() else {
            warn!(worker_id = id; "response received without a job in flight");
            return;
        };

        pool.available.insert(id);
        let lost = match pool.queue.pop_front() {
            Some(next) => pool.place(next, true),
            None => Vec::new(),
        };

        self.publish(&pool);
        drop(pool);

        let InFlight {
            label,
            started,
            done,
        } = in_flight;
        let ms = started.elapsed().as_millis();

        match result {
            Ok(output) => {
                self.logs
                    .info(format!("Finished {label} task in {ms}ms on worker {id}"));
                done(Ok(output));
            }
            Err(msg) => {
                self.logs.error(format!(
                    "worker {id} failed {label} task after {ms}ms: {msg}"
                ));
                done(Err(JobError::Failed { worker_id: id, msg }));
            }
        }

        self.settle(lost);
    }

    /// Retires worker `id` after its runtime went away.
    fn stopped(&self, id: WorkerId) {
        let mut pool = self.pool.lock();
        if pool.closed {
            return;
        }

        let lost = pool.retire(id, "worker runtime stopped");
        self.publish(&pool);
        drop(pool);

        self.settle(lost);
    }
}

/// Dispatches train, validate and eval jobs across a fixed set of workers.
///
/// Jobs go to an arbitrary idle worker, or to the tail of a FIFO queue when
/// every worker is busy. Each finished worker immediately takes the oldest
/// queued job. Failed jobs are logged and dropped, there are no retries.
pub struct WorkersCoordinator {
    inner: Arc<Inner>,
}

impl WorkersCoordinator {
    /// Spawns `worker_count` workers, each with its own compute module.
    ///
    /// Every worker gets its `init` request right away; the call doesn't wait
    /// for the acknowledgements. Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `worker_count` - Size of the pool.
    /// * `factory` - Builds the compute module owned by each worker.
    /// * `logs` - Sink receiving durations, failures and forwarded worker logs.
    ///
    /// # Returns
    /// A new `WorkersCoordinator` instance.
    pub fn new<M, F>(worker_count: usize, mut factory: F, logs: LogSink) -> Self
    where
        M: ComputeModule,
        F: FnMut(WorkerId) -> M,
    {
        let workers = (0..worker_count)
            .map(|id| worker::spawn(id, factory(id)))
            .collect();

        Self::from_workers(workers, logs)
    }

    /// Builds the pool over already spawned worker runtimes. Runtimes that
    /// already stopped are left out.
    pub fn from_workers(workers: Vec<WorkerHandle>, logs: LogSink) -> Self {
        let worker_count = workers.len();
        let (outstanding, _) = watch::channel(0);

        let mut slots = HashMap::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        let mut tasks = Vec::with_capacity(worker_count * 2);

        for handle in workers {
            let (id, requests, responses, task) = handle.into_parts();

            if requests.send(WorkerRequest::Init).is_err() {
                warn!(worker_id = id; "worker runtime is gone, leaving it out of the pool");
                continue;
            }

            slots.insert(
                id,
                Slot {
                    requests,
                    init_started: Some(Instant::now()),
                    in_flight: None,
                },
            );

            receivers.push((id, responses));
            tasks.extend(task);
        }

        let started = slots.len();
        let available = slots.keys().copied().collect();
        let inner = Arc::new(Inner {
            pool: Mutex::new(Pool {
                slots,
                available,
                queue: VecDeque::new(),
                tasks: Vec::new(),
                closed: false,
            }),
            logs,
            outstanding,
        });

        for (id, responses) in receivers {
            tasks.push(tokio::spawn(listen(Arc::downgrade(&inner), id, responses)));
        }

        inner.pool.lock().tasks = tasks;
        debug!("worker pool started with {started} of {worker_count} worker(s)");

        Self { inner }
    }

    /// Submits a training job, resolving to the serialized deltas.
    pub fn enqueue_train(&self, args: TrainArgs) -> JobHandle<Vec<u8>> {
        self.enqueue(Job::Train(args))
    }

    /// Submits a validation job, resolving to the measured accuracy.
    pub fn enqueue_validate(&self, args: ValidateArgs) -> JobHandle<f64> {
        self.enqueue(Job::Validate(args))
    }

    /// Submits an evaluation job, resolving to the model outputs.
    pub fn enqueue_eval(&self, args: EvalArgs) -> JobHandle<Vec<f32>> {
        self.enqueue(Job::Eval(args))
    }

    fn enqueue<T: JobResult>(&self, job: Job) -> JobHandle<T> {
        let (tx, rx) = oneshot::channel();
        let kind = job.kind();
        let logs = self.inner.logs.clone();

        let done: Completion = Box::new(move |result| {
            let result = result.and_then(|output| T::from_output(kind, output));
            if let Err(e @ JobError::TypeMismatch { .. }) = &result {
                logs.error(e.to_string());
            }

            // The caller may have dropped the handle.
            let _ = tx.send(result);
        });

        self.inner.submit(Pending { job, done });
        JobHandle { rx }
    }

    /// Amount of jobs waiting because no worker was free.
    pub fn queue_size(&self) -> usize {
        self.inner.pool.lock().queue.len()
    }

    /// Amount of workers currently executing a job.
    pub fn active_jobs(&self) -> usize {
        self.inner.pool.lock().active()
    }

    /// Amount of idle workers.
    pub fn available_workers(&self) -> usize {
        self.inner.pool.lock().available.len()
    }

    /// Amount of workers in the pool, retired ones excluded.
    pub fn worker_count(&self) -> usize {
        self.inner.pool.lock().slots.len()
    }

    /// Waits until no job is running nor queued.
    pub async fn drained(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|outstanding| *outstanding == 0).await;
    }

    /// Terminates every worker. Queued and running jobs are abandoned, their
    /// handles resolve to `JobError::Abandoned`.
    pub fn close(&self) {
        let (abandoned, tasks) = {
            let mut pool = self.inner.pool.lock();
            if pool.closed {
                return;
            }

            pool.closed = true;

            let mut abandoned: Vec<Completion> =
                pool.queue.drain(..).map(|pending| pending.done).collect();
            abandoned.extend(
                pool.slots
                    .values_mut()
                    .filter_map(|slot| slot.in_flight.take())
                    .map(|in_flight| in_flight.done),
            );

            let ids: Vec<_> = pool.slots.keys().copied().collect();
            pool.available.extend(ids);
            self.inner.publish(&pool);

            (abandoned, std::mem::take(&mut pool.tasks))
        };

        for task in tasks {
            task.abort();
        }

        let count = abandoned.len();
        // Dropping the completions wakes the handles without a value.
        drop(abandoned);
        self.inner
            .logs
            .info(format!("closed worker pool, abandoned {count} job(s)"));
    }
}

impl Drop for WorkersCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Routes one worker's replies: logs are forwarded, terminating replies
/// complete the request in flight. The worker is retired once its replies end.
async fn listen(inner: Weak<Inner>, id: WorkerId, mut rx: UnboundedReceiver<WorkerResponse>) {
    while let Some(response) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match response {
            WorkerResponse::Log { message, severity } => {
                inner.logs.insert(message, severity);
            }
            WorkerResponse::Response { data } => inner.finish(id, Ok(data)),
            WorkerResponse::Error { message } => inner.finish(id, Err(message)),
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.stopped(id);
    }

    debug!(worker_id = id; "worker listener stopped");
}

/// Resolves to the result of one submitted job.
///
/// Resolves at most once; `JobError::Abandoned` if the pool was closed first.
#[must_use = "the job result is only observable through its handle"]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T, JobError>>,
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(JobError::Abandoned)))
    }
}
