//! Client-side connector.
//!
//! A [`Connector`] registers once and then either renders every pushed message ([`Connector::run`])
//! or issues synchronous queries ([`Connector::query`]). Interactive clients that also want
//! asynchronous events use [`Connector::start_callback_thread`]: a single connection carries
//! both, replies are told apart from events by their shape.

use crate::error::excerpt;
use crate::proto::codec;
use crate::proto::{ClientConfig, ClientKind, Message, Query, QueryValue, Response};
use crate::transport::{Connection, TransportError};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Capacity of the reply queue between the callback thread and [`Connector::query`].
const RESPONSE_QUEUE_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("disconnected from debugger")]
    Disconnected,
    #[error("no debugger listening on {} after {after:?}", path.display())]
    Timeout { path: PathBuf, after: Duration },
    #[error("callback thread already running")]
    CallbackThreadRunning,
    #[error("unexpected `{0}` message")]
    UnexpectedMessage(&'static str),
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => ClientError::Disconnected,
            err => ClientError::Transport(err),
        }
    }
}

/// Connection state reported to the status sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    /// Server not reachable yet, another attempt follows.
    Waiting { error: String },
    Connected,
    Disconnected,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Waiting { error } => write!(f, "waiting for debugger: {error}"),
            ConnectionStatus::Connected => f.write_str("connected to debugger"),
            ConnectionStatus::Disconnected => f.write_str("disconnected from debugger"),
        }
    }
}

pub type StatusSink = Box<dyn FnMut(&ConnectionStatus) + Send>;

pub struct ConnectOptions {
    /// Delay before the second connection attempt, doubled on every failure.
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Reconnect and register again when the server goes away during [`Connector::run`].
    pub reconnect: bool,
    /// Give up connecting after this long, [`None`] means retry forever.
    pub connect_timeout: Option<Duration>,
    pub status: Option<StatusSink>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
            reconnect: false,
            connect_timeout: None,
            status: None,
        }
    }
}

impl ConnectOptions {
    pub fn with_status(self, sink: impl FnMut(&ConnectionStatus) + Send + 'static) -> Self {
        Self {
            status: Some(Box::new(sink)),
            ..self
        }
    }

    fn report(&mut self, status: ConnectionStatus) {
        debug!("{status}");
        if let Some(ref mut sink) = self.status {
            sink(&status);
        }
    }
}

struct CallbackThread {
    responses: Receiver<Response>,
    handle: JoinHandle<()>,
}

pub struct Connector {
    path: PathBuf,
    config: ClientConfig,
    options: ConnectOptions,
    conn: Connection,
    /// Events received while waiting for a reply, delivered before anything else.
    pending: VecDeque<Message>,
    callback_thread: Option<CallbackThread>,
}

impl Connector {
    /// Connect to the server and register. Blocks until the server accepts the connection,
    /// failed attempts are reported to the status sink and retried with a growing delay.
    pub fn connect(
        path: impl AsRef<Path>,
        config: ClientConfig,
        mut options: ConnectOptions,
    ) -> Result<Self, ClientError> {
        let path = path.as_ref().to_path_buf();
        let conn = establish(&path, &config, &mut options)?;
        Ok(Self {
            path,
            config,
            options,
            conn,
            pending: VecDeque::new(),
            callback_thread: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Receive and decode the next message. Malformed messages are logged and skipped.
    fn next_message(&mut self) -> Result<Message, ClientError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        loop {
            let body = self.conn.receive()?;
            match codec::decode(&body) {
                Ok(message) => return Ok(message),
                Err(e) => error!("malformed message: {e:#}: {}", excerpt(&body)),
            }
        }
    }

    /// Pass every received message to `render` until the connection is lost.
    ///
    /// With reconnection enabled, a lost connection is established again and the same
    /// registration is sent, messages sent meanwhile are lost. Otherwise the loss is
    /// returned as [`ClientError::Disconnected`].
    pub fn run(&mut self, mut render: impl FnMut(Message)) -> Result<(), ClientError> {
        if self.callback_thread.is_some() {
            return Err(ClientError::CallbackThreadRunning);
        }

        loop {
            match self.next_message() {
                Ok(message) => render(message),
                Err(e) => {
                    if !matches!(e, ClientError::Disconnected) {
                        warn!("connection lost: {e:#}");
                    }
                    self.options.report(ConnectionStatus::Disconnected);
                    if !self.options.reconnect {
                        return Err(ClientError::Disconnected);
                    }
                    self.conn = establish(&self.path, &self.config, &mut self.options)?;
                }
            }
        }
    }

    /// Send a query and block for its reply. Events received meanwhile are kept for
    /// [`Connector::run`] or the callback thread.
    ///
    /// Not for concurrent use from several threads without external locking.
    pub fn query(&mut self, query: Query) -> Result<Option<QueryValue>, ClientError> {
        self.conn.send(&Message::Interactive(query))?;

        if let Some(ref thread) = self.callback_thread {
            let response = thread
                .responses
                .recv()
                .map_err(|_| ClientError::Disconnected)?;
            return Ok(response.value);
        }

        loop {
            let body = self.conn.receive()?;
            match codec::decode(&body) {
                Ok(Message::Response(response)) => return Ok(response.value),
                Ok(message) => self.pending.push_back(message),
                Err(e) => error!("malformed message: {e:#}: {}", excerpt(&body)),
            }
        }
    }

    /// Ask the server to relay `data` to every client of `kind`, wait for the acknowledgement.
    /// Receivers get `data` exactly as given, any JSON value is accepted.
    pub fn push(&mut self, kind: ClientKind, data: serde_json::Value) -> Result<(), ClientError> {
        if self.callback_thread.is_some() {
            return Err(ClientError::CallbackThreadRunning);
        }

        self.conn.send(&Message::PushUpdate {
            update_type: kind,
            data,
        })?;
        loop {
            let body = self.conn.receive()?;
            match codec::decode(&body) {
                Ok(Message::Ack) => return Ok(()),
                Ok(Message::Response(_)) => return Err(ClientError::UnexpectedMessage("response")),
                Ok(message) => self.pending.push_back(message),
                Err(e) => error!("malformed message: {e:#}: {}", excerpt(&body)),
            }
        }
    }

    /// Spawn a thread receiving from this connection. Query replies are queued for
    /// [`Connector::query`], every other message is passed to `callback` with `lock` held.
    pub fn start_callback_thread<T, F>(
        &mut self,
        lock: Arc<Mutex<T>>,
        mut callback: F,
    ) -> Result<(), ClientError>
    where
        T: Send + 'static,
        F: FnMut(&mut T, Message) + Send + 'static,
    {
        if self.callback_thread.is_some() {
            return Err(ClientError::CallbackThreadRunning);
        }

        let reader = self.conn.try_clone()?;
        let (tx, rx) = mpsc::sync_channel(RESPONSE_QUEUE_LEN);
        let mut pending = std::mem::take(&mut self.pending);

        let handle = thread::Builder::new()
            .name("stopcast-callback".to_string())
            .spawn(move || {
                let mut deliver = |message: Message| {
                    let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
                    callback(&mut state, message);
                };
                pending.drain(..).for_each(&mut deliver);

                loop {
                    let body = match reader.receive() {
                        Ok(body) => body,
                        Err(TransportError::Disconnected) => {
                            info!("disconnected from debugger");
                            break;
                        }
                        Err(e) => {
                            warn!("connection lost: {e:#}");
                            break;
                        }
                    };

                    match codec::decode(&body) {
                        Ok(Message::Response(response)) => {
                            if tx.send(response).is_err() {
                                break;
                            }
                        }
                        Ok(message) => deliver(message),
                        Err(e) => error!("malformed message: {e:#}: {}", excerpt(&body)),
                    }
                }
            })?;

        self.callback_thread = Some(CallbackThread {
            responses: rx,
            handle,
        });
        Ok(())
    }

    /// Close the connection and wait for the callback thread, if any.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.conn.close();
        if let Some(thread) = self.callback_thread.take() {
            drop(thread.responses);
            if thread.handle.join().is_err() {
                error!("callback thread panicked");
            }
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Connect and register, retrying with a growing delay until the server accepts.
fn establish(
    path: &Path,
    config: &ClientConfig,
    options: &mut ConnectOptions,
) -> Result<Connection, ClientError> {
    let started = Instant::now();
    let mut delay = options.retry_delay;
    let register = Message::Register {
        config: config.clone(),
    };

    loop {
        let attempt = Connection::connect(path)
            .map_err(TransportError::from)
            .and_then(|conn| conn.send(&register).map(|_| conn));

        match attempt {
            Ok(conn) => {
                options.report(ConnectionStatus::Connected);
                return Ok(conn);
            }
            Err(e) => {
                if let Some(timeout) = options.connect_timeout {
                    if started.elapsed() >= timeout {
                        return Err(ClientError::Timeout {
                            path: path.to_path_buf(),
                            after: timeout,
                        });
                    }
                }
                options.report(ConnectionStatus::Waiting {
                    error: e.to_string(),
                });
                thread::sleep(delay);
                delay = (delay * 2).min(options.max_retry_delay);
            }
        }
    }
}
