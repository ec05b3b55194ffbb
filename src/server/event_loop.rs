//! Server event loop: accepts connections and serves client requests until woken up for exit.

use crate::error::excerpt;
use crate::proto::codec;
use crate::proto::Message;
use crate::server::dispatch::Dispatcher;
use crate::server::registry::{ClientId, ClientSender, Registration, Registry};
use crate::transport::{Connection, Listener, TransportError};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use os_pipe::PipeReader;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A client has this long to deliver the rest of a frame once it started sending one.
const FRAME_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// What a single poll round reported.
enum Event {
    Wake,
    Accept,
    Client(ClientId),
}

pub(super) struct EventLoop {
    listener: Listener,
    waker: PipeReader,
    /// Read halves of accepted connections, write halves live in the registry.
    readers: Vec<(ClientId, Connection)>,
    registry: Arc<Mutex<Registry>>,
    dispatcher: Arc<Dispatcher>,
}

impl EventLoop {
    pub(super) fn new(
        listener: Listener,
        waker: PipeReader,
        registry: Arc<Mutex<Registry>>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            listener,
            waker,
            readers: vec![],
            registry,
            dispatcher,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn run(mut self) {
        info!("listening on {}", self.listener.path().display());

        'outer: loop {
            let events = match self.wait() {
                Ok(events) => events,
                Err(e) => {
                    error!("poll: {e}, server loop stopped");
                    break;
                }
            };

            for event in events {
                match event {
                    Event::Wake => break 'outer,
                    Event::Accept => self.accept(),
                    Event::Client(id) => {
                        if let Err(e) = self.serve(id) {
                            match e {
                                TransportError::Disconnected => debug!("client {id} disconnected"),
                                e if e.is_timeout() => warn!(
                                    "client {id}: frame not completed within {FRAME_READ_TIMEOUT:?}"
                                ),
                                e => warn!("client {id}: {e:#}"),
                            }
                            self.drop_client(id);
                        }
                    }
                }
            }
        }

        debug!("server loop exited");
    }

    /// Block until the waker, the listener or any client socket is ready.
    fn wait(&self) -> nix::Result<Vec<Event>> {
        let mut fds = Vec::with_capacity(self.readers.len() + 2);
        fds.push(PollFd::new(self.waker.as_fd(), PollFlags::POLLIN));
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        fds.extend(
            self.readers
                .iter()
                .map(|(_, conn)| PollFd::new(conn.as_fd(), PollFlags::POLLIN)),
        );

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }

        let ready = |fd: &PollFd| fd.revents().is_some_and(|flags| !flags.is_empty());

        if ready(&fds[0]) {
            return Ok(vec![Event::Wake]);
        }

        let mut events = vec![];
        if ready(&fds[1]) {
            events.push(Event::Accept);
        }
        // hangup and error conditions are observed by the following read as well
        events.extend(
            fds[2..]
                .iter()
                .zip(&self.readers)
                .filter(|(fd, _)| ready(fd))
                .map(|(_, (id, _))| Event::Client(*id)),
        );
        Ok(events)
    }

    fn accept(&mut self) {
        let conn = match self.listener.accept() {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept: {e}");
                return;
            }
        };
        let writer = match conn.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                warn!("accept: clone connection: {e}");
                return;
            }
        };

        let added = self.registry().add(writer);
        match added {
            Ok(id) => {
                info!("client {id} connected");
                self.readers.push((id, conn));
            }
            Err(e) => warn!("accept: {e}"),
        }
    }

    fn sender(&self, id: ClientId) -> Option<ClientSender> {
        self.registry().get(id).map(|record| record.sender().clone())
    }

    /// Read and handle one message of a ready client.
    fn serve(&self, id: ClientId) -> Result<(), TransportError> {
        let Some((_, reader)) = self.readers.iter().find(|(reader_id, _)| *reader_id == id) else {
            return Ok(());
        };
        let body = reader.receive_within(FRAME_READ_TIMEOUT)?;

        let message = match codec::decode(&body) {
            Ok(message) => message,
            Err(e) => {
                error!("client {id}: malformed message: {e:#}: {}", excerpt(&body));
                return Ok(());
            }
        };

        match message {
            Message::Register { config } => {
                let description = config.to_string();
                match self.registry().register(id, config) {
                    Registration::Accepted => info!("client {id} registered: {description}"),
                    Registration::AlreadyRegistered => {
                        warn!("client {id} is already registered, registration ignored")
                    }
                    Registration::UnknownClient => return Err(TransportError::Disconnected),
                }
            }
            Message::PushUpdate { update_type, data } => {
                let sender = self.sender(id).ok_or(TransportError::Disconnected)?;
                self.dispatcher.handle_push_update(&sender, update_type, data);
            }
            Message::Interactive(query) => {
                let sender = self.sender(id).ok_or(TransportError::Disconnected)?;
                self.dispatcher.handle_interactive_query(&sender, query);
            }
            other => warn!("client {id}: unexpected `{}` message ignored", other.name()),
        }
        Ok(())
    }

    fn drop_client(&mut self, id: ClientId) {
        self.readers.retain(|(reader_id, _)| *reader_id != id);
        if self.registry().purge(id) {
            info!("client {id} removed");
        }
    }
}
