//! Per-endpoint state: the raw handle, its tag, lifecycle state, output
//! buffer and (lazily created) read coroutine.
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::coroutine::Coroutine;
use crate::output::OutputBuffer;
use crate::time::TimerHandle;

/// Internal identifier for a registered endpoint, used as the `popol`
/// source key and as the value side of the tag index. Never exposed to
/// handler code, which only ever deals in tags.
pub(crate) type EndpointId = u64;

/// Lifecycle state of an endpoint, as seen by the readiness loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Connecting,
    Connected,
    Listening,
    Error,
}

/// The raw I/O object behind an endpoint. A listener never reads or writes;
/// a file is always seekable; a stream is neither a listener nor seekable.
pub(crate) enum Io {
    Stream(TcpStream),
    Listener(TcpListener),
    File(File),
}

impl Io {
    pub(crate) fn as_stream(&self) -> Option<&TcpStream> {
        match self {
            Io::Stream(s) => Some(s),
            _ => None,
        }
    }
}

impl AsRawFd for Io {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Io::Stream(s) => s.as_raw_fd(),
            Io::Listener(l) => l.as_raw_fd(),
            Io::File(f) => f.as_raw_fd(),
        }
    }
}

impl Read for Io {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Io::Stream(s) => s.read(buf),
            Io::File(f) => f.read(buf),
            Io::Listener(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                "cannot read a listening socket",
            )),
        }
    }
}

impl Write for Io {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Io::Stream(s) => s.write(buf),
            Io::File(f) => f.write(buf),
            Io::Listener(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                "cannot write a listening socket",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Io::Stream(s) => s.flush(),
            Io::File(f) => f.flush(),
            Io::Listener(_) => Ok(()),
        }
    }
}

impl Seek for Io {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Io::File(f) => f.seek(pos),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "endpoint is not seekable",
            )),
        }
    }
}

/// One registered I/O object, mutated only on the reactor thread.
pub(crate) struct Endpoint<T> {
    pub(crate) io: Io,
    /// `None` only for the brief window between accepting a connection and
    /// the handler's `server_init` assigning it one via `set_meta_info`.
    pub(crate) tag: Option<T>,
    pub(crate) state: State,
    pub(crate) seekable: bool,
    pub(crate) output: OutputBuffer,
    /// At most one alive per endpoint; recreated (not reused) once dead.
    pub(crate) coroutine: Option<Coroutine<T>>,
    pub(crate) last_read_error: Option<String>,
    pub(crate) connect_timer: Option<TimerHandle>,
    pub(crate) use_error_handler: bool,
    /// Virtual write cursor for seekable endpoints, advanced by writes and
    /// relocated by `seek`, independent of the real file descriptor's
    /// position (which `flush` repositions before draining each chunk).
    pub(crate) write_offset: u64,
    /// Set by a `Close` request issued by the endpoint's own coroutine;
    /// disposal is deferred until that coroutine's `Done` is observed so we
    /// never tear down state a still-running coroutine thread is using.
    pub(crate) closing: bool,
}

impl<T> Endpoint<T> {
    pub(crate) fn new(io: Io, tag: Option<T>, state: State, seekable: bool, use_error_handler: bool) -> Self {
        let output = if seekable {
            OutputBuffer::seekable()
        } else {
            OutputBuffer::sequential()
        };

        Self {
            io,
            tag,
            state,
            seekable,
            output,
            coroutine: None,
            last_read_error: None,
            connect_timer: None,
            use_error_handler,
            write_offset: 0,
            closing: false,
        }
    }

    /// Whether this endpoint belongs in the readiness read set.
    pub(crate) fn wants_read(&self, stopped: bool) -> bool {
        self.state != State::Connecting && !stopped
    }

    /// Whether this endpoint belongs in the readiness write set.
    pub(crate) fn wants_write(&self) -> bool {
        self.state != State::Listening && (!self.output.is_empty() || self.state == State::Connecting)
    }
}
