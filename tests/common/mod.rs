#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use playground_trainer::{
    compute, Assignment, Blob, ComputeError, ComputeModule, EvalArgs, LogEmitter, ModelState,
    PlaygroundServer, Registrar, ServerError, TrainArgs, ValidateArgs, ValidationResult,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, WebSocketStream};

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn blob(bytes: &[u8]) -> Blob {
    Arc::from(bytes)
}

pub fn train_args(pairs: &[u8]) -> TrainArgs {
    TrainArgs {
        config: blob(b"config"),
        storage: blob(b"storage"),
        pairs: blob(pairs),
        workers: None,
    }
}

pub fn validate_args(pairs: &[u8]) -> ValidateArgs {
    ValidateArgs {
        config: blob(b"config"),
        storage: blob(b"storage"),
        pairs: blob(pairs),
    }
}

pub fn eval_args(inputs: Vec<f32>) -> EvalArgs {
    EvalArgs {
        config: blob(b"config"),
        storage: blob(b"storage"),
        inputs,
    }
}

/// Compute module answering right away. Training returns the pairs it was
/// given and records them in `seen`.
#[derive(Clone, Default)]
pub struct Immediate {
    pub seen: Arc<Mutex<Vec<Vec<u8>>>>,
    pub fail_train: bool,
    pub fail_init: bool,
    /// Panics on the first training job only.
    pub panic_once: bool,
    pub log: Option<LogEmitter>,
}

impl ComputeModule for Immediate {
    fn init(&mut self, log: LogEmitter) -> compute::Result<()> {
        if self.fail_init {
            return Err(ComputeError::new("no webgpu adapter"));
        }

        self.log = Some(log);
        Ok(())
    }

    fn train(&mut self, args: &TrainArgs) -> compute::Result<Vec<u8>> {
        if self.panic_once {
            self.panic_once = false;
            panic!("index out of bounds");
        }

        self.seen.lock().push(args.pairs.to_vec());
        if self.fail_train {
            return Err(ComputeError::new("out of memory"));
        }

        if let Some(log) = &self.log {
            log.log(format!("trained on {} bytes", args.pairs.len()), 0u8);
        }

        Ok(args.pairs.to_vec())
    }

    fn validate(&mut self, args: &ValidateArgs) -> compute::Result<f64> {
        Ok(args.pairs.len() as f64 / 100.0)
    }

    fn evaluate(&mut self, args: &EvalArgs) -> compute::Result<Vec<f32>> {
        Ok(args.inputs.iter().map(|x| x + 1.0).collect())
    }
}

/// Compute module whose jobs block until the test opens the gate once per job.
pub struct Gated {
    gate: Arc<std::sync::Mutex<mpsc::Receiver<()>>>,
}

/// Releases one blocked job per `open`, dropping it releases all of them.
pub struct Gate {
    tx: mpsc::Sender<()>,
    rx: Arc<std::sync::Mutex<mpsc::Receiver<()>>>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx: Arc::new(std::sync::Mutex::new(rx)),
        }
    }

    pub fn module(&self) -> Gated {
        Gated {
            gate: self.rx.clone(),
        }
    }

    pub fn open(&self, jobs: usize) {
        for _ in 0..jobs {
            let _ = self.tx.send(());
        }
    }
}

impl Gated {
    fn wait(&self) {
        if let Ok(rx) = self.gate.lock() {
            let _ = rx.recv();
        }
    }
}

impl ComputeModule for Gated {
    fn init(&mut self, _: LogEmitter) -> compute::Result<()> {
        Ok(())
    }

    fn train(&mut self, args: &TrainArgs) -> compute::Result<Vec<u8>> {
        self.wait();
        Ok(args.pairs.to_vec())
    }

    fn validate(&mut self, _: &ValidateArgs) -> compute::Result<f64> {
        self.wait();
        Ok(1.0)
    }

    fn evaluate(&mut self, args: &EvalArgs) -> compute::Result<Vec<f32>> {
        self.wait();
        Ok(args.inputs.clone())
    }
}

/// In-memory model that records every delta it's handed.
#[derive(Default)]
pub struct FakeModel {
    pub push: AtomicBool,
    pub exports: AtomicUsize,
    /// Size of exported deltas, a fixed three byte payload when zero.
    pub export_size: AtomicUsize,
    pub initial: Mutex<Option<(Vec<u8>, Vec<u8>)>>,
    pub loaded: Mutex<Vec<Vec<u8>>>,
    pub merged: Mutex<Vec<Vec<u8>>>,
}

impl FakeModel {
    pub fn pushing(push: bool) -> Arc<Self> {
        let model = Self::default();
        model.push.store(push, Ordering::SeqCst);
        Arc::new(model)
    }
}

impl ModelState for FakeModel {
    fn load_initial(&self, storage: &[u8], config: &[u8]) -> compute::Result<()> {
        *self.initial.lock() = Some((storage.to_vec(), config.to_vec()));
        Ok(())
    }

    fn load_deltas(&self, deltas: &[u8]) -> compute::Result<()> {
        self.loaded.lock().push(deltas.to_vec());
        Ok(())
    }

    fn merge_trained(&self, deltas: &[u8]) -> compute::Result<()> {
        self.merged.lock().push(deltas.to_vec());
        Ok(())
    }

    fn snapshot(&self) -> compute::Result<Vec<u8>> {
        Ok(b"snapshot".to_vec())
    }

    fn should_push(&self) -> bool {
        self.push.load(Ordering::SeqCst)
    }

    fn export_deltas(&self) -> compute::Result<Vec<u8>> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        match self.export_size.load(Ordering::SeqCst) {
            0 => Ok(vec![0xde, 0x17, 0xa5]),
            size => Ok(vec![7; size]),
        }
    }
}

/// Coordination server handing out a fixed list of assignments.
pub struct FakeServer {
    pub socket_url: String,
    pub assignments: Mutex<VecDeque<Assignment>>,
    pub submitted: Mutex<Vec<ValidationResult>>,
    pub fetched: Mutex<Vec<String>>,
    pub registrations: AtomicUsize,
}

impl FakeServer {
    pub fn new(socket_url: impl Into<String>, assignments: Vec<Assignment>) -> Arc<Self> {
        Arc::new(Self {
            socket_url: socket_url.into(),
            assignments: Mutex::new(assignments.into()),
            submitted: Mutex::new(Vec::new()),
            fetched: Mutex::new(Vec::new()),
            registrations: AtomicUsize::new(0),
        })
    }

    fn unavailable(path: &str) -> ServerError {
        ServerError::Status {
            url: path.to_string(),
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[async_trait]
impl Registrar for FakeServer {
    async fn register_training_worker(&self) -> Result<String, ServerError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(self.socket_url.clone())
    }
}

#[async_trait]
impl PlaygroundServer for FakeServer {
    async fn assign(&self) -> Result<Assignment, ServerError> {
        self.assignments
            .lock()
            .pop_front()
            .ok_or_else(|| Self::unavailable("/assign"))
    }

    async fn submit_validation(&self, result: &ValidationResult) -> Result<(), ServerError> {
        self.submitted.lock().push(result.clone());
        Ok(())
    }

    async fn most_recent_model(&self) -> Result<Vec<u8>, ServerError> {
        Ok(b"recent".to_vec())
    }

    async fn best_model_url(&self) -> Result<String, ServerError> {
        Ok("local|models/best.bin".to_string())
    }

    async fn model_config_url(&self) -> Result<String, ServerError> {
        Ok("local|models/config.json".to_string())
    }

    async fn fetch_blob(&self, url: &str) -> Result<Blob, ServerError> {
        self.fetched.lock().push(url.to_string());
        Ok(blob(url.as_bytes()))
    }
}

/// Binds a websocket server on a random local port.
///
/// # Returns
/// The url to connect to and a task resolving to the accepted connection.
pub async fn loopback() -> (
    String,
    tokio::task::JoinHandle<WebSocketStream<TcpStream>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepted = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    });

    (format!("ws://{addr}"), accepted)
}
