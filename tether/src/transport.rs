//! Byte-stream transports and the connectors that open them.

use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use tether_proto::TimedRead;

use crate::config::Endpoint;

/// A bidirectional byte stream carrying the guest's serial console.
pub trait Transport: TimedRead + Write + Send {}

impl<T: TimedRead + Write + Send> Transport for T {}

/// Opens fresh transports. Reconnecting after a hang always goes through
/// this, so stale bytes from the old stream are never reused.
pub trait Connector {
    /// Stream type produced by [`connect`](Self::connect).
    type Stream: Transport;

    /// Opens a new stream to the guest.
    fn connect(&self) -> io::Result<Self::Stream>;
}

impl<F, S> Connector for F
where
    F: Fn() -> io::Result<S>,
    S: Transport,
{
    type Stream = S;

    fn connect(&self) -> io::Result<S> {
        self()
    }
}

/// A concrete stream opened from an [`Endpoint`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Link {
    /// Unix domain socket (QEMU `-serial unix:...`).
    #[cfg(unix)]
    Unix(UnixStream),
    /// TCP socket (QEMU `-serial tcp:...`).
    Tcp(TcpStream),
}

impl Read for Link {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Link {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

impl TimedRead for Link {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => UnixStream::set_read_timeout(s, timeout),
            Self::Tcp(s) => TcpStream::set_read_timeout(s, timeout),
        }
    }
}

impl Connector for Endpoint {
    type Stream = Link;

    fn connect(&self) -> io::Result<Link> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => UnixStream::connect(path).map(Link::Unix),
            #[cfg(not(unix))]
            Self::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix endpoints require a Unix host",
            )),
            Self::Tcp(addr) => {
                let s = TcpStream::connect(addr)?;
                s.set_nodelay(true)?;
                Ok(Link::Tcp(s))
            }
        }
    }
}
