//! Frame accounting for one transport.
//!
//! Every accepted command yields exactly two frames: the primary payload and
//! the wrapper's `OK`. [`Wire::collect`] is the only code that reads frames,
//! so the count cannot drift between operations.

use std::io;
use std::time::Duration;

use tether_proto::{ACK, FrameReader, READY, Reply};
use tracing::debug;

use crate::transport::Transport;
use crate::{Error, Result};

/// Deadlines for the two frames of one exchange.
#[derive(Debug, Clone, Copy)]
pub(super) struct Deadlines {
    /// Wait for the primary frame.
    pub(super) primary: Duration,
    /// Wait for the acknowledgement after the primary arrived.
    pub(super) ack: Duration,
}

/// A transport plus the bytes read from it but not yet consumed.
#[derive(Debug)]
pub(super) struct Wire<S> {
    /// The owned stream.
    stream: S,
    /// Leftover bytes between frames.
    frames: FrameReader,
    /// A launched command's two frames are still outstanding.
    launched: bool,
    /// An exchange timed out; its frames may still arrive, so nothing read
    /// from here on can be attributed to a command.
    stale: bool,
}

impl<S: Transport> Wire<S> {
    /// Wraps a freshly opened stream.
    pub(super) const fn new(stream: S) -> Self {
        Self {
            stream,
            frames: FrameReader::new(),
            launched: false,
            stale: false,
        }
    }

    /// Sends one command line and reads its two frames.
    pub(super) fn exchange(&mut self, line: &str, d: Deadlines) -> Result<Reply> {
        self.ensure_idle()?;
        self.write_line(line)?;
        self.collect_or_stale(d)
    }

    /// Runs the file-write sub-protocol: command, ready byte, raw data,
    /// end-of-data byte, then the usual two frames.
    ///
    /// The data travels unescaped, so it must not contain the end-of-data
    /// byte; such data is refused before anything is written.
    pub(super) fn upload(
        &mut self,
        line: &str,
        data: &[u8],
        ready: Duration,
        d: Deadlines,
    ) -> Result<Reply> {
        if let Some(offset) = data.iter().position(|&b| b == READY) {
            return Err(Error::UnsendableData { offset });
        }
        self.ensure_idle()?;
        self.write_line(line)?;
        match self.frames.read_until(&mut self.stream, READY, ready) {
            Ok(skipped) if !skipped.is_empty() => {
                debug!(bytes = skipped.len(), "discarded bytes before ready signal");
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(Error::ProtocolDesync(
                    "guest never signalled ready for file data".into(),
                ));
            }
            Err(e) => return Err(map_io(e)),
        }
        self.stream.write_all(data).map_err(map_io)?;
        self.stream.write_all(&[READY]).map_err(map_io)?;
        self.stream.flush().map_err(map_io)?;
        self.collect_or_stale(d)
    }

    /// Sends a command whose frames arrive only when it returns.
    pub(super) fn launch(&mut self, line: &str) -> Result<()> {
        self.ensure_idle()?;
        self.write_line(line)?;
        self.launched = true;
        Ok(())
    }

    /// Reads the frames of a launched command.
    ///
    /// On timeout the frames stay outstanding so the call can be retried.
    pub(super) fn join(&mut self, d: Deadlines) -> Result<Option<Reply>> {
        if !self.launched {
            return Ok(None);
        }
        let reply = self.collect(d)?;
        if !reply.is_timeout() {
            self.launched = false;
        }
        Ok(Some(reply))
    }

    /// Writes a line without expecting any frames back.
    pub(super) fn notify(&mut self, line: &str) -> Result<()> {
        self.write_line(line)
    }

    /// `true` while a launched command owns the wrapper.
    pub(super) const fn is_launched(&self) -> bool {
        self.launched
    }

    /// Refuses to start an exchange while launched frames are pending or
    /// after a timed-out exchange.
    fn ensure_idle(&self) -> Result<()> {
        if self.stale {
            return Err(Error::ProtocolDesync(
                "an earlier reply timed out and may still arrive; reconnect required".into(),
            ));
        }
        if self.launched { Err(Error::Busy) } else { Ok(()) }
    }

    /// [`collect`](Self::collect) for an ordinary exchange, poisoning the
    /// wire when the primary never came.
    fn collect_or_stale(&mut self, d: Deadlines) -> Result<Reply> {
        let reply = self.collect(d)?;
        if reply.is_timeout() {
            debug!("reply overdue; transport is out of step until reconnect");
            self.stale = true;
        }
        Ok(reply)
    }

    /// Writes `line` plus the newline the wrapper reads up to.
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes()).map_err(map_io)?;
        self.stream.write_all(b"\n").map_err(map_io)?;
        self.stream.flush().map_err(map_io)
    }

    /// Reads the primary frame, then the acknowledgement.
    ///
    /// A missing primary is a plain timeout. A missing or foreign
    /// acknowledgement means the frame count is off, which is never
    /// patched up here.
    fn collect(&mut self, d: Deadlines) -> Result<Reply> {
        let primary = match self.frames.read_frame(&mut self.stream, d.primary) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(Reply::Timeout),
            Err(e) => return Err(map_io(e)),
        };
        match self.frames.read_frame(&mut self.stream, d.ack) {
            Ok(ack) if ack == ACK => {
                debug!(bytes = primary.len(), "frame pair received");
                Ok(Reply::classify(primary))
            }
            Ok(other) => Err(Error::ProtocolDesync(format!(
                "expected acknowledgement frame, got {} bytes: {:?}",
                other.len(),
                String::from_utf8_lossy(&other[..other.len().min(32)])
            ))),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(Error::ProtocolDesync(
                "acknowledgement frame missing after primary".into(),
            )),
            Err(e) => Err(map_io(e)),
        }
    }
}

/// Maps stream failures that mean "peer is gone" to
/// [`Error::ConnectionClosed`].
fn map_io(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => Error::ConnectionClosed,
        _ => Error::Io(e),
    }
}
