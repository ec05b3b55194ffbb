//! Update server, lives next to the host debugger.
//!
//! [`Server::start`] binds the listening socket and moves the connection handling to a
//! dedicated thread, so the debugger thread never blocks on client I/O. The debugger thread
//! calls [`Server::update_clients`] from its stop-hook.

pub mod dispatch;
mod event_loop;
pub mod registry;

use crate::adapter::DebuggerAdapter;
use crate::proto::ClientConfig;
use crate::server::dispatch::{DispatchStats, Dispatcher};
use crate::server::event_loop::EventLoop;
use crate::server::registry::{ClientId, Registry};
use crate::transport::Listener;
use log::{error, info, warn};
use os_pipe::PipeWriter;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind {}: {source}", path.display())]
    Bind { path: PathBuf, source: io::Error },
    #[error("server already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Handle of a running event loop thread.
struct Worker {
    waker: PipeWriter,
    handle: JoinHandle<()>,
}

pub struct Server {
    socket_path: PathBuf,
    registry: Arc<Mutex<Registry>>,
    dispatcher: Arc<Dispatcher>,
    worker: Option<Worker>,
}

impl Server {
    pub fn new(socket_path: impl Into<PathBuf>, adapter: Arc<dyn DebuggerAdapter>) -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), adapter));
        Self {
            socket_path: socket_path.into(),
            registry,
            dispatcher,
            worker: None,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Bind the listening socket and spawn the event loop thread. Returns immediately.
    ///
    /// Failure to bind is the only fatal server condition.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.worker.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = Listener::bind(&self.socket_path).map_err(|source| ServerError::Bind {
            path: self.socket_path.clone(),
            source,
        })?;
        let (wake_rx, wake_tx) = os_pipe::pipe()?;

        let event_loop = EventLoop::new(
            listener,
            wake_rx,
            self.registry.clone(),
            self.dispatcher.clone(),
        );
        let handle = thread::Builder::new()
            .name("stopcast-server".to_string())
            .spawn(move || event_loop.run())?;

        self.worker = Some(Worker {
            waker: wake_tx,
            handle,
        });
        info!("server started on {}", self.socket_path.display());
        Ok(())
    }

    /// Wake the event loop up, wait for it to exit and close all client connections.
    /// The socket file is removed together with the listener.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        let Some(mut worker) = self.worker.take() else {
            return Err(ServerError::NotRunning);
        };

        // fails if the loop is already gone, the join below returns right away then
        if let Err(e) = worker.waker.write_all(&[1]) {
            warn!("wake server thread: {e}");
        }
        if worker.handle.join().is_err() {
            error!("server thread panicked");
        }

        self.registry().clear();
        info!("server stopped");
        Ok(())
    }

    /// One line per connected client, in connection order.
    pub fn client_summary(&self) -> Vec<String> {
        self.registry().summary()
    }

    /// Connected clients and their registrations.
    pub fn clients(&self) -> Vec<(ClientId, Option<ClientConfig>)> {
        self.registry()
            .iter()
            .map(|record| (record.id(), record.config().cloned()))
            .collect()
    }

    /// Send fresh updates to clients, called on every debugger stop.
    pub fn update_clients(&self) -> DispatchStats {
        self.dispatcher.update_clients()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            _ = self.stop();
        }
    }
}
