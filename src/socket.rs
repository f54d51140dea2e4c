use nix::errno::Errno;
use socket2::Socket;
use std::fmt;
use std::io::Write;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use tracing::debug;

use super::Result;
use crate::buffer::{Buffering, NonBlockingReader, DEFAULT_READ_CHUNK};

/// A connected socket whose incoming data is collected without blocking.
///
/// Accepts anything convertible into a [`socket2::Socket`], such as a `TcpStream` or a
/// `UnixStream`. The socket is closed exactly once, by [`close`](Self::close) or on drop.
pub struct ManagedSocket {
    reader: NonBlockingReader<Socket>,
    fd: RawFd,
}

impl ManagedSocket {
    /// Takes ownership of a connected socket and switches it to non-blocking mode.
    ///
    /// # Arguments
    /// * `socket` - A connected stream socket such as a `TcpStream` or `UnixStream`
    ///
    /// # Examples
    /// ```no_run
    /// use proctest::ManagedSocket;
    /// use std::net::TcpStream;
    ///
    /// let mut socket = ManagedSocket::new(TcpStream::connect("127.0.0.1:6379")?)?;
    /// socket.send(b"PING\r\n")?;
    /// # Ok::<(), eyre::Report>(())
    /// ```
    pub fn new<S: Into<Socket>>(socket: S) -> Result<Self> {
        Self::with_chunk_size(socket, DEFAULT_READ_CHUNK)
    }

    /// Same as [`new`](Self::new), reading up to `chunk_size` bytes at a time
    pub fn with_chunk_size<S: Into<Socket>>(socket: S, chunk_size: usize) -> Result<Self> {
        let socket: Socket = socket.into();
        let fd = socket.as_raw_fd();
        let reader = NonBlockingReader::with_chunk_size(socket, chunk_size)?;
        debug!("Managing socket {}", fd);
        Ok(Self { reader, fd })
    }

    /// Descriptor of the socket while it is open
    pub fn fd(&self) -> Option<RawFd> {
        self.reader.is_open().then_some(self.fd)
    }

    /// Collects any available data and returns everything received so far
    pub fn read(&mut self) -> &str {
        self.reader.read()
    }

    /// Forgets the data received so far; the socket stays open
    pub fn reset(&mut self) {
        self.reader.reset()
    }

    /// Data received so far, without reading
    pub fn output(&self) -> &str {
        self.reader.contents()
    }

    /// Writes all of `data` to the peer.
    ///
    /// The socket is non-blocking, so a full send buffer surfaces as a `WouldBlock` error.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let Some(mut socket) = self.reader.source() else {
            return Err(eyre::eyre!("Cannot send on closed socket {}", self.fd));
        };
        socket.write_all(data)?;
        Ok(())
    }

    /// Closes the socket.
    ///
    /// A descriptor that turns out to be closed already is not an error. Calling this again
    /// does nothing.
    pub fn close(&mut self) -> Result<()> {
        let Some(socket) = self.reader.take_source() else {
            return Ok(());
        };
        debug!("Closing socket {}", self.fd);
        close_descriptor(socket.into_raw_fd())
    }
}

impl Buffering for ManagedSocket {
    fn read(&mut self) -> &str {
        ManagedSocket::read(self)
    }

    fn reset(&mut self) {
        ManagedSocket::reset(self)
    }
}

impl fmt::Debug for ManagedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSocket")
            .field("fd", &self.fd)
            .field("open", &self.reader.is_open())
            .finish()
    }
}

impl Drop for ManagedSocket {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            eprintln!("Failed to close socket {}: {}", self.fd, e);
        }
    }
}

/// Closes `fd`, treating "bad descriptor" as already closed
fn close_descriptor(fd: RawFd) -> Result<()> {
    // Plain close(2) so that its errors are seen instead of dropped
    if unsafe { libc::close(fd) } == 0 {
        return Ok(());
    }
    match Errno::last() {
        errno if is_already_closed(errno) => {
            debug!("Socket {} was already closed", fd);
            Ok(())
        }
        errno => Err(errno.into()),
    }
}

fn is_already_closed(errno: Errno) -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if errno == Errno::EBADFD {
        return true;
    }
    errno == Errno::EBADF
}
