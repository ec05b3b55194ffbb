//! Local stream socket transport.
//!
//! Frames are a 4-byte big-endian length followed by the message body, so a message is never
//! coalesced with or split across its neighbours.

use crate::proto::codec::{self, CodecError};
use crate::proto::Message;
use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags};
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Upper bound of a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("frame of {0} bytes exceeds the limit of {MAX_FRAME_LEN} bytes")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => TransportError::Disconnected,
            _ => TransportError::Io(err),
        }
    }

    /// True if the read timeout set by [`Connection::set_read_timeout`] expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
    }
}

/// Listening socket. The backing file is removed before binding and again on drop.
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => log::debug!("stale socket {} removed", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let inner = UnixListener::bind(&path)?;
        Ok(Self { inner, path })
    }

    pub fn accept(&self) -> io::Result<Connection> {
        let (stream, _) = self.inner.accept()?;
        Ok(Connection::from_stream(stream))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        _ = std::fs::remove_file(&self.path);
    }
}

/// One end of a client-server connection.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        UnixStream::connect(path).map(Self::from_stream)
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Two connected ends, without a listener.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }

    /// Another handle to the same socket, used to read and write from different threads.
    pub fn try_clone(&self) -> io::Result<Self> {
        self.stream.try_clone().map(Self::from_stream)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Encode and send a single message.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        let body = codec::encode(message)?;
        self.send_frame(&body)
    }

    /// Send a single frame. Partial writes are retried until the whole frame is out.
    pub fn send_frame(&self, body: &[u8]) -> Result<(), TransportError> {
        if body.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(body.len()));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);

        let mut rest = frame.as_slice();
        while !rest.is_empty() {
            match socket::send(self.stream.as_raw_fd(), rest, MsgFlags::MSG_NOSIGNAL) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => rest = &rest[n..],
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(TransportError::from_io(errno.into())),
            }
        }
        Ok(())
    }

    /// Block until a whole frame is received and return its body.
    ///
    /// End of stream is reported as [`TransportError::Disconnected`].
    pub fn receive(&self) -> Result<Vec<u8>, TransportError> {
        self.receive_frame(None)
    }

    /// Like [`Connection::receive`], but the whole frame must arrive within `limit`,
    /// otherwise a timeout error is returned. Overrides the read timeout of the connection.
    pub fn receive_within(&self, limit: Duration) -> Result<Vec<u8>, TransportError> {
        self.receive_frame(Some(Instant::now() + limit))
    }

    fn receive_frame(&self, deadline: Option<Instant>) -> Result<Vec<u8>, TransportError> {
        let mut header = [0u8; HEADER_LEN];
        self.read_full(&mut header, deadline)?;

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len];
        self.read_full(&mut body, deadline)?;
        Ok(body)
    }

    fn read_full(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<(), TransportError> {
        let Some(deadline) = deadline else {
            return (&self.stream)
                .read_exact(buf)
                .map_err(TransportError::from_io);
        };

        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Io(io::ErrorKind::TimedOut.into()));
            }
            self.stream.set_read_timeout(Some(remaining))?;

            match (&self.stream).read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::from_io(e)),
            }
        }
        Ok(())
    }

    /// Shut down both directions. Every clone of this connection observes the close.
    pub fn close(&self) {
        _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
