//! Crash and hang recovery: snapshot restore, reconnect, re-freeze.

use std::io;
#[cfg(unix)]
use std::io::Write;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::error::RecoveryStage;
use crate::session::Session;
use crate::transport::Connector;
use crate::{Error, Result};

/// External named-checkpoint service for the guest VM.
pub trait SnapshotService {
    /// Restores the VM to the snapshot called `name`.
    fn load(&self, name: &str) -> io::Result<()>;

    /// Saves the current VM state as `name`.
    fn save(&self, name: &str) -> io::Result<()>;
}

impl<T: SnapshotService + ?Sized> SnapshotService for &T {
    fn load(&self, name: &str) -> io::Result<()> {
        (**self).load(name)
    }

    fn save(&self, name: &str) -> io::Result<()> {
        (**self).save(name)
    }
}

/// QEMU human monitor reached over a Unix socket (`-monitor unix:...`).
#[derive(Debug, Clone)]
pub struct QemuMonitor {
    /// Monitor socket path.
    socket: PathBuf,
    /// Pause after each command so the monitor can act on it.
    command_delay: Duration,
}

impl QemuMonitor {
    /// Creates a monitor client for `socket`.
    pub fn new(socket: impl AsRef<Path>) -> Self {
        Self {
            socket: socket.as_ref().to_path_buf(),
            command_delay: Duration::from_millis(500),
        }
    }

    /// Overrides the post-command pause.
    #[must_use]
    pub const fn command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    /// Sends one monitor command line.
    #[cfg(unix)]
    fn command(&self, line: &str) -> io::Result<()> {
        let mut s = UnixStream::connect(&self.socket)?;
        s.write_all(line.as_bytes())?;
        s.write_all(b"\n")?;
        s.flush()?;
        std::thread::sleep(self.command_delay);
        Ok(())
    }

    #[cfg(not(unix))]
    fn command(&self, _line: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "the QEMU monitor socket requires a Unix host",
        ))
    }
}

impl SnapshotService for QemuMonitor {
    fn load(&self, name: &str) -> io::Result<()> {
        self.command(&format!("loadvm {name}"))
    }

    fn save(&self, name: &str) -> io::Result<()> {
        self.command(&format!("savevm {name}"))
    }
}

/// Restores a dead session.
///
/// `Frozen --(is_ready fails)--> Dead --(recover)--> Frozen`
#[derive(Debug)]
pub struct Recovery<S> {
    /// Snapshot backend.
    snapshots: S,
    /// Snapshot restored on recovery.
    snapshot: String,
    /// Wait after the restore.
    settle: Duration,
    /// Wait between close and reconnect.
    reconnect_delay: Duration,
}

impl<S: SnapshotService> Recovery<S> {
    /// Creates a controller restoring `config.snapshot` through `snapshots`.
    pub fn new(snapshots: S, config: &RecoveryConfig) -> Self {
        Self {
            snapshots,
            snapshot: config.snapshot.clone(),
            settle: config.settle(),
            reconnect_delay: config.reconnect_delay(),
        }
    }

    /// The snapshot backend.
    pub const fn snapshots(&self) -> &S {
        &self.snapshots
    }

    /// Restores the snapshot, reopens the transport and re-runs `freeze`.
    ///
    /// On success the session is frozen and answers a no-op. Any failing
    /// step is reported as [`Error::Recovery`] and leaves the session dead;
    /// nothing is retried.
    pub fn recover<C: Connector>(&self, session: &mut Session<C>) -> Result<()> {
        info!(snapshot = %self.snapshot, "recovering session");
        session.mark_dead();

        self.snapshots
            .load(&self.snapshot)
            .map_err(|e| Error::Io(e).during(RecoveryStage::Snapshot))?;
        std::thread::sleep(self.settle);

        session.close();
        std::thread::sleep(self.reconnect_delay);
        session
            .reconnect()
            .map_err(|e| e.during(RecoveryStage::Reconnect))?;

        if let Err(e) = session.freeze() {
            session.mark_dead();
            return Err(e.during(RecoveryStage::Initialize));
        }
        let ready_timeout = session.config().ready_timeout();
        if !session.is_ready(ready_timeout) {
            return Err(Error::SessionDead.during(RecoveryStage::Initialize));
        }

        info!(snapshot = %self.snapshot, "session recovered");
        Ok(())
    }

    /// Probes the session and recovers it when the probe fails.
    ///
    /// Returns `true` when a recovery was performed. A launched program
    /// owning the wrapper is not a hang: that case fails with
    /// [`Error::Busy`] and leaves the session alone.
    pub fn ensure_ready<C: Connector>(&self, session: &mut Session<C>) -> Result<bool> {
        if session.is_launched() {
            return Err(Error::Busy);
        }
        let ready_timeout = session.config().ready_timeout();
        if session.is_ready(ready_timeout) {
            return Ok(false);
        }
        warn!(state = %session.state(), "session unresponsive");
        self.recover(session)?;
        Ok(true)
    }
}
