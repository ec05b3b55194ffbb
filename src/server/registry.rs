use crate::proto::{ClientConfig, ClientKind, Message, UpdateOn};
use crate::transport::{Connection, TransportError};
use indexmap::IndexMap;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Connection identity, unique for the server lifetime.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Write half of a client connection. Sends are serialized, so concurrent updates to the same
/// client never interleave on the wire.
#[derive(Clone)]
pub struct ClientSender {
    id: ClientId,
    conn: Arc<Mutex<Connection>>,
    /// Separate handle for shutdown, usable while a send holds the lock.
    control: Arc<Connection>,
}

impl ClientSender {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.send(message)
    }

    /// Shut the socket down, the event loop observes it as a disconnection.
    pub fn close(&self) {
        self.control.close();
    }
}

/// Server-side state of an accepted connection.
pub struct ClientRecord {
    sender: ClientSender,
    config: Option<ClientConfig>,
    connected_at: Instant,
}

impl ClientRecord {
    pub fn id(&self) -> ClientId {
        self.sender.id
    }

    /// Registration config, [`None`] until the client registers.
    pub fn config(&self) -> Option<&ClientConfig> {
        self.config.as_ref()
    }

    pub fn sender(&self) -> &ClientSender {
        &self.sender
    }

    /// True if the client wants updates of `kind`.
    pub fn wants(&self, kind: ClientKind) -> bool {
        self.config.as_ref().is_some_and(|c| c.kind == kind)
    }

    /// True if the client wants an update on every debugger stop.
    pub fn wants_stop_updates(&self) -> bool {
        self.config
            .as_ref()
            .is_some_and(|c| c.update_on == UpdateOn::Stop)
    }

    pub fn summary(&self) -> String {
        let uptime = self.connected_at.elapsed().as_secs();
        match self.config {
            Some(ref config) => format!("{} {config}, connected {uptime}s", self.id()),
            None => format!("{} unregistered, connected {uptime}s", self.id()),
        }
    }
}

/// Outcome of a registration attempt.
#[derive(Debug, PartialEq)]
pub enum Registration {
    Accepted,
    AlreadyRegistered,
    UnknownClient,
}

/// Live set of connected clients, in accept order.
#[derive(Default)]
pub struct Registry {
    clients: IndexMap<ClientId, ClientRecord>,
    next_id: u64,
}

impl Registry {
    /// Add a freshly accepted connection. The record starts unregistered.
    pub fn add(&mut self, conn: Connection) -> io::Result<ClientId> {
        let control = Arc::new(conn.try_clone()?);
        self.next_id += 1;
        let id = ClientId(self.next_id);
        let record = ClientRecord {
            sender: ClientSender {
                id,
                conn: Arc::new(Mutex::new(conn)),
                control,
            },
            config: None,
            connected_at: Instant::now(),
        };
        self.clients.insert(id, record);
        Ok(id)
    }

    /// Store the client registration. A registration is final.
    pub fn register(&mut self, id: ClientId, config: ClientConfig) -> Registration {
        match self.clients.get_mut(&id) {
            None => Registration::UnknownClient,
            Some(record) if record.config.is_some() => Registration::AlreadyRegistered,
            Some(record) => {
                record.config = Some(config);
                Registration::Accepted
            }
        }
    }

    /// Remove a client and close its socket. Return false if the client is already gone.
    pub fn purge(&mut self, id: ClientId) -> bool {
        match self.clients.shift_remove(&id) {
            Some(record) => {
                record.sender.close();
                true
            }
            None => false,
        }
    }

    /// Close and forget all clients.
    pub fn clear(&mut self) {
        for (_, record) in self.clients.drain(..) {
            record.sender.close();
        }
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn summary(&self) -> Vec<String> {
        self.iter().map(ClientRecord::summary).collect()
    }
}
