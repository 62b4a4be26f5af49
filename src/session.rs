//! The orchestration loop that keeps the worker pool fed with assignments.

use std::sync::Arc;

use anyhow::Context as _;
use log::{debug, info, warn};
use tokio::{sync::OnceCell, task::JoinHandle, time};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    cache::BlobCache,
    compute::{ComputeModule, ModelState},
    config::SessionConfig,
    coordinator::{JobHandle, WorkersCoordinator},
    logging::LogSink,
    protocol::{Blob, EvalArgs, TrainArgs, ValidateArgs},
    server::{Assignment, PlaygroundServer, ValidationResult},
    train_socket::TrainSocket,
    worker::WorkerId,
};

/// Process wide collaborators handed to a session instead of globals.
#[derive(Clone)]
pub struct SessionContext {
    logs: LogSink,
    cache: BlobCache,
}

impl SessionContext {
    /// Creates a new `SessionContext` over existing collaborators.
    pub fn new(logs: LogSink, cache: BlobCache) -> Self {
        Self { logs, cache }
    }

    /// A fresh log sink sized after `config` and an empty cache.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(LogSink::new(config.log_capacity()), BlobCache::new())
    }

    /// The sink every session component logs to.
    pub fn logs(&self) -> &LogSink {
        &self.logs
    }

    /// The blob cache, cleared when a session stops.
    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }
}

struct Shared {
    config: SessionConfig,
    server: Arc<dyn PlaygroundServer>,
    model: Arc<dyn ModelState>,
    coordinator: WorkersCoordinator,
    socket: TrainSocket,
    context: SessionContext,
    /// Config blob of the loaded initial model, set once per session.
    initial: OnceCell<Blob>,
    follow_ups: TaskTracker,
}

impl Shared {
    fn logs(&self) -> &LogSink {
        &self.context.logs
    }

    /// Downloads `url` through the session cache.
    async fn blob(&self, url: &str) -> anyhow::Result<Blob> {
        let server = self.server.clone();
        self.context
            .cache
            .get_or_fetch(url, || async move { server.fetch_blob(url).await })
            .await
            .with_context(|| format!("failed to download {url}"))
    }

    async fn model_config(&self) -> anyhow::Result<Blob> {
        let url = self
            .server
            .model_config_url()
            .await
            .context("failed to get the model config url")?;

        self.blob(&url).await
    }

    /// Loads the server's most recent model into the local model state the
    /// first time it's needed.
    ///
    /// # Returns
    /// The model config.
    async fn initial_model(&self) -> anyhow::Result<Blob> {
        let config = self
            .initial
            .get_or_try_init(|| async {
                let storage = self
                    .server
                    .most_recent_model()
                    .await
                    .context("failed to get the most recent model")?;
                let config = self.model_config().await?;

                self.model
                    .load_initial(&storage, &config)
                    .context("failed to load the initial model")?;

                info!("loaded initial model ({} bytes)", storage.len());
                Ok::<_, anyhow::Error>(config)
            })
            .await?;

        Ok(config.clone())
    }

    /// Requests one assignment and enqueues it.
    async fn cycle(self: &Arc<Self>) -> anyhow::Result<()> {
        let assignment = self
            .server
            .assign()
            .await
            .context("failed to get an assignment")?;

        match assignment {
            Assignment::Train { url } => self.train(url).await,
            Assignment::Validate {
                version,
                batch,
                url,
                model_url,
            } => self.validate(version, batch, url, model_url).await,
        }
    }

    async fn train(self: &Arc<Self>, url: String) -> anyhow::Result<()> {
        let config = self.initial_model().await?;
        self.socket
            .assert_connected()
            .await
            .context("failed to connect the training socket")?;

        let pairs = self.blob(&url).await?;
        let storage = Blob::from(self.model.snapshot()?);

        let handle = self.coordinator.enqueue_train(TrainArgs {
            config,
            storage,
            pairs,
            workers: u32::try_from(self.coordinator.worker_count()).ok(),
        });

        let shared = self.clone();
        self.follow_ups.spawn(async move {
            if let Err(e) = shared.merge_trained(handle).await {
                shared.logs().error(format!("{e:#}"));
            }
        });

        Ok(())
    }

    async fn merge_trained(&self, handle: JobHandle<Vec<u8>>) -> anyhow::Result<()> {
        let deltas = handle.await?;
        self.model
            .merge_trained(&deltas)
            .context("failed to merge trained deltas")?;

        if self.socket.push_if_necessary().await? {
            debug!("pushed local deltas");
        }

        Ok(())
    }

    async fn validate(
        self: &Arc<Self>,
        version: u32,
        batch: u32,
        url: String,
        model_url: String,
    ) -> anyhow::Result<()> {
        let config = self.model_config().await?;
        let pairs = self.blob(&url).await?;
        let storage = self.blob(&model_url).await?;

        let handle = self.coordinator.enqueue_validate(ValidateArgs {
            config,
            storage,
            pairs,
        });

        let shared = self.clone();
        self.follow_ups.spawn(async move {
            if let Err(e) = shared.submit_validation(handle, version, batch).await {
                shared.logs().error(format!("{e:#}"));
            }
        });

        Ok(())
    }

    async fn submit_validation(
        &self,
        handle: JobHandle<f64>,
        version: u32,
        batch: u32,
    ) -> anyhow::Result<()> {
        let accuracy = handle.await?;
        let result = ValidationResult {
            version,
            batch,
            accuracy,
        };

        self.server
            .submit_validation(&result)
            .await
            .with_context(|| format!("failed to submit validation of model {version}"))
    }
}

/// Periodically asks the server for work until cancelled.
async fn drive(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(shared.config.cycle_delay()) => {}
        }

        if shared.coordinator.queue_size() >= shared.config.max_queued() {
            continue;
        }

        if let Err(e) = shared.cycle().await {
            shared.logs().error(format!("{e:#}"));
        }
    }

    debug!("session driver stopped");
}

/// A running training session: a worker pool, its training socket and the
/// loop requesting assignments for them.
pub struct TrainingSession {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl TrainingSession {
    /// Starts a new `TrainingSession` in the background.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `config` - Pool size, queue threshold and cycle delay.
    /// * `server` - The coordination server.
    /// * `model` - The main side model deltas are merged into.
    /// * `factory` - Builds the compute module of each worker.
    /// * `context` - Log sink and blob cache shared with the host.
    ///
    /// # Returns
    /// A new `TrainingSession` instance.
    pub fn start<S, M, F>(
        config: SessionConfig,
        server: Arc<S>,
        model: Arc<dyn ModelState>,
        factory: F,
        context: SessionContext,
    ) -> Self
    where
        S: PlaygroundServer + 'static,
        M: ComputeModule,
        F: FnMut(WorkerId) -> M,
    {
        let coordinator = WorkersCoordinator::new(config.workers(), factory, context.logs.clone());
        let socket = TrainSocket::new(server.clone(), model.clone(), context.logs.clone());

        let shared = Arc::new(Shared {
            config,
            server,
            model,
            coordinator,
            socket,
            context,
            initial: OnceCell::new(),
            follow_ups: TaskTracker::new(),
        });

        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(shared.clone(), cancel.clone()));
        shared.logs().info(format!(
            "started training session with {} worker(s)",
            shared.coordinator.worker_count()
        ));

        Self {
            shared,
            cancel,
            driver: Some(driver),
        }
    }

    /// Runs the best model known to the server over `inputs`.
    ///
    /// # Errors
    /// Download failures or a failed evaluation job.
    pub async fn evaluate(&self, inputs: Vec<f32>) -> anyhow::Result<Vec<f32>> {
        let shared = &self.shared;
        let url = shared
            .server
            .best_model_url()
            .await
            .context("failed to get the best model url")?;

        let storage = shared.blob(&url).await?;
        let config = shared.model_config().await?;

        let outputs = shared
            .coordinator
            .enqueue_eval(EvalArgs {
                config,
                storage,
                inputs,
            })
            .await?;

        Ok(outputs)
    }

    /// Amount of jobs waiting for a free worker.
    pub fn queue_size(&self) -> usize {
        self.shared.coordinator.queue_size()
    }

    /// Amount of workers currently busy.
    pub fn active_jobs(&self) -> usize {
        self.shared.coordinator.active_jobs()
    }

    /// The session's log sink.
    pub fn logs(&self) -> &LogSink {
        self.shared.logs()
    }

    /// Stops requesting work, lets every enqueued job and its follow up
    /// finish, then flushes the socket and tears the pool down.
    ///
    /// # Errors
    /// Failures while flushing or closing the training socket.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                warn!("session driver ended abnormally: {e}");
            }
        }

        let shared = &self.shared;
        shared.coordinator.drained().await;
        shared.follow_ups.close();
        shared.follow_ups.wait().await;

        let closed = shared.socket.close().await;
        shared.coordinator.close();
        shared.context.cache.clear();
        shared.logs().info("stopped training session");

        closed.context("failed to close the training socket")
    }
}

impl Drop for TrainingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
