//! The persistent channel used to exchange model deltas while training.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::{stream::SplitSink, SinkExt, StreamExt};
use log::{debug, info};
use tokio::{net::TcpStream, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::{compute::ModelState, error::SocketError, logging::LogSink, server::Registrar};

pub type Result<T> = std::result::Result<T, SocketError>;

/// Soft limit above which a push gets reported.
pub const PUSH_WARN_BYTES: usize = 500_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<Result<()>>,
}

/// Single websocket shared by the training jobs of a session.
///
/// Incoming binary frames are server deltas and get applied to the local
/// model as they arrive; local deltas are pushed whenever the model says
/// enough progress accumulated. Lost connections are not re-established.
pub struct TrainSocket {
    registrar: Arc<dyn Registrar>,
    model: Arc<dyn ModelState>,
    logs: LogSink,
    conn: Mutex<Option<Connection>>,
    closing: AtomicBool,
}

impl TrainSocket {
    /// Creates a new, disconnected `TrainSocket`.
    ///
    /// # Arguments
    /// * `registrar` - Hands out the socket url on first use.
    /// * `model` - The model deltas are applied to and exported from.
    /// * `logs` - Sink for protocol violations and oversized pushes.
    ///
    /// # Returns
    /// A new `TrainSocket` instance.
    pub fn new(registrar: Arc<dyn Registrar>, model: Arc<dyn ModelState>, logs: LogSink) -> Self {
        Self {
            registrar,
            model,
            logs,
            conn: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    /// Whether a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Opens the connection unless one is already open.
    ///
    /// # Errors
    /// Registration or websocket handshake failures.
    pub async fn assert_connected(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Ok(());
        }

        let url = self.registrar.register_training_worker().await?;
        let (stream, _) = connect_async(url.as_str()).await?;
        info!("training socket connected to {url}");

        let (sink, stream) = stream.split();
        let reader = tokio::spawn(read_deltas(stream, self.model.clone(), self.logs.clone()));

        *conn = Some(Connection { sink, reader });
        Ok(())
    }

    /// Sends the accumulated local deltas if the model asks for it.
    ///
    /// # Returns
    /// Whether a push was transmitted.
    ///
    /// # Errors
    /// A protocol violation previously observed on the connection, delta export
    /// or transport failures.
    pub async fn push_if_necessary(&self) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        self.push(&mut conn).await
    }

    async fn push(&self, conn: &mut Option<Connection>) -> Result<bool> {
        let Some(connection) = conn.as_mut() else {
            return Ok(false);
        };

        if connection.reader.is_finished() {
            // The reader only stops on close frames, transport errors or
            // protocol violations.
            let Some(Connection { reader, .. }) = conn.take() else {
                return Ok(false);
            };

            return match reader.await {
                Ok(Err(e)) => Err(e),
                _ => Ok(false),
            };
        }

        if !self.model.should_push() {
            return Ok(false);
        }

        let deltas = self.model.export_deltas()?;
        if deltas.len() > PUSH_WARN_BYTES {
            self.logs
                .warn(format!("pushing {} bytes of deltas, more than 500KB", deltas.len()));
        }

        debug!("pushing {} bytes of deltas", deltas.len());
        connection.sink.send(Message::Binary(deltas)).await?;
        Ok(true)
    }

    /// Flushes pending deltas and closes the connection.
    ///
    /// Calls made while another close is running, or without a connection,
    /// return immediately.
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self.flush_and_close().await;
        self.closing.store(false, Ordering::Release);
        result
    }

    async fn flush_and_close(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            return Ok(());
        }

        let pushed = self.push(&mut conn).await;

        if let Some(Connection { mut sink, reader }) = conn.take() {
            let closed = sink.close().await;
            reader.abort();
            info!("training socket closed");
            pushed?;
            closed?;
            return Ok(());
        }

        pushed.map(|_| ())
    }
}

/// Applies every binary frame to the model, anything else but control frames
/// ends the connection with a protocol error.
async fn read_deltas(
    mut stream: futures::stream::SplitStream<WsStream>,
    model: Arc<dyn ModelState>,
    logs: LogSink,
) -> Result<()> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Binary(deltas) => {
                debug!("received {} bytes of deltas", deltas.len());
                model.load_deltas(&deltas)?;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            Message::Close(_) => break,
            Message::Text(text) => {
                let e = SocketError::Protocol(format!(
                    "invalid type for socket message, expected binary, got text ({} bytes)",
                    text.len()
                ));
                logs.error(e.to_string());
                return Err(e);
            }
        }
    }

    debug!("training socket reader stopped");
    Ok(())
}
