use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::io::{self, ErrorKind, Read};
use std::os::fd::AsFd;
use tracing::{trace, warn};

/// Size of a single read from the underlying descriptor
pub const DEFAULT_READ_CHUNK: usize = 8192;

/// Switches a descriptor to non-blocking mode, keeping its other status flags.
pub fn set_non_blocking<F: AsFd>(fd: &F) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Anything that accumulates output which can be polled and discarded.
pub trait Buffering {
    /// Pulls in whatever is available right now and returns everything collected so far.
    fn read(&mut self) -> &str;

    /// Forgets everything collected so far.
    fn reset(&mut self);
}

/// Collects the output of a descriptor into a text buffer without ever blocking.
///
/// The source is put in non-blocking mode on construction. Each [`read`](Self::read)
/// drains the bytes that are available at that moment and appends them to the buffer;
/// "no data yet" simply ends the drain. Other read failures are logged and swallowed so a
/// misbehaving stream never takes the calling test down.
#[derive(Debug)]
pub struct NonBlockingReader<R> {
    source: Option<R>,
    buffer: String,
    /// Tail of an UTF-8 sequence that was split across reads
    pending: Vec<u8>,
    chunk_size: usize,
}

impl<R: Read + AsFd> NonBlockingReader<R> {
    /// Wraps `source`, switching it to non-blocking mode.
    ///
    /// # Arguments
    /// * `source` - Any readable descriptor: a pipe end, a socket, a pty master
    ///
    /// # Returns
    /// * `nix::Result<Self>` - An error if the descriptor flags cannot be changed
    pub fn new(source: R) -> nix::Result<Self> {
        Self::with_chunk_size(source, DEFAULT_READ_CHUNK)
    }

    /// Same as [`new`](Self::new) with a custom read size
    pub fn with_chunk_size(source: R, chunk_size: usize) -> nix::Result<Self> {
        set_non_blocking(&source)?;
        Ok(Self {
            source: Some(source),
            buffer: String::new(),
            pending: Vec::new(),
            chunk_size: chunk_size.max(1),
        })
    }

    /// Drains all currently available bytes and returns the accumulated text.
    pub fn read(&mut self) -> &str {
        if let Some(source) = self.source.as_mut() {
            let mut chunk = vec![0u8; self.chunk_size];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        trace!(bytes = n, "read chunk");
                        self.pending.extend_from_slice(&chunk[..n]);
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) if is_would_block(&e) => break,
                    Err(e) => {
                        let fd = source.as_fd();
                        warn!("Failed to read from {:?}: {}", fd, e);
                        break;
                    }
                }
            }
            self.decode_pending();
        }
        &self.buffer
    }

    /// Detaches the source from the reader, flushing any split UTF-8 tail into the buffer.
    ///
    /// Later reads return the buffer unchanged.
    pub fn take_source(&mut self) -> Option<R> {
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }
        self.source.take()
    }

    /// The wrapped source, until [`take_source`](Self::take_source) detaches it
    pub fn source(&self) -> Option<&R> {
        self.source.as_ref()
    }
}

impl<R> NonBlockingReader<R> {
    /// Discards the accumulated content
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Accumulated content, without reading
    pub fn contents(&self) -> &str {
        &self.buffer
    }

    /// True while the reader still owns its source.
    ///
    /// # Returns
    /// * `bool` - `false` once the source was taken, after which reads only return the buffer
    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    fn decode_pending(&mut self) {
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    self.buffer.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end, wait for the rest of it
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let tail = rest.to_vec();
        self.pending = tail;
    }
}

impl<R: Read + AsFd> Buffering for NonBlockingReader<R> {
    fn read(&mut self) -> &str {
        NonBlockingReader::read(self)
    }

    fn reset(&mut self) {
        NonBlockingReader::reset(self)
    }
}

fn is_would_block(error: &io::Error) -> bool {
    error.kind() == ErrorKind::WouldBlock
        || matches!(error.raw_os_error(), Some(code) if code == Errno::EAGAIN as i32 || code == Errno::EINPROGRESS as i32)
}
