//! Synchronous protocol session with the guest's command wrapper.
//!
//! A [`Session`] owns exactly one transport. Operations are strictly
//! sequential: one command in flight, two frames read per command. Callers
//! sharing a session across threads must serialize access themselves.

pub mod commands;
mod wire;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tether_proto::Reply;
use tracing::{debug, info, warn};

use self::commands::{MemValue, SymbolMask};
use self::wire::{Deadlines, Wire};
use crate::config::{Endpoint, SessionConfig};
use crate::transport::Connector;
use crate::{Error, Result};

/// Lifecycle of the guest-side command wrapper as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionState {
    /// Connected, wrapper state not established (fresh connection, or a
    /// reply that never arrived and left the transport out of step).
    Unknown,
    /// Primitives deployed; every operation is available.
    Frozen,
    /// The wrapper loop was told to exit.
    Unfrozen,
    /// Desync, closed peer or unresponsive wrapper; needs recovery.
    Dead,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Frozen => "frozen",
            Self::Unfrozen => "unfrozen",
            Self::Dead => "dead",
        })
    }
}

/// A connection to the guest's command wrapper.
#[derive(Debug)]
pub struct Session<C: Connector> {
    /// Opens (and reopens) the transport.
    connector: C,
    /// The live transport; `None` after [`close`](Self::close).
    wire: Option<Wire<C::Stream>>,
    /// Current wrapper state.
    state: SessionState,
    /// Timeouts and guest paths.
    config: SessionConfig,
}

impl Session<Endpoint> {
    /// Connects to the endpoint named in `config`.
    pub fn open(config: SessionConfig) -> Result<Self> {
        Self::connect(config.endpoint.clone(), config)
    }
}

impl<C: Connector> Session<C> {
    /// Opens a transport through `connector`.
    pub fn connect(connector: C, config: SessionConfig) -> Result<Self> {
        let stream = connector.connect()?;
        debug!("transport connected");
        Ok(Self {
            connector,
            wire: Some(Wire::new(stream)),
            state: SessionState::Unknown,
            config,
        })
    }

    /// Current wrapper state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Session settings.
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Drops the transport. The session reports [`Error::ConnectionClosed`]
    /// until [`reconnect`](Self::reconnect).
    pub fn close(&mut self) {
        if self.wire.take().is_some() {
            debug!("transport closed");
        }
    }

    /// Replaces the transport with a fresh one, discarding any buffered
    /// bytes. The wrapper state becomes [`SessionState::Unknown`].
    pub fn reconnect(&mut self) -> Result<()> {
        self.close();
        self.state = SessionState::Dead;
        let stream = self.connector.connect()?;
        self.wire = Some(Wire::new(stream));
        self.state = SessionState::Unknown;
        info!("transport reconnected");
        Ok(())
    }

    /// Forces the session dead; only a reconnect revives it.
    pub(crate) fn mark_dead(&mut self) {
        self.state = SessionState::Dead;
    }

    // ---------------------------------------------------------------------
    // Primitive exchanges
    // ---------------------------------------------------------------------

    /// Sends one command with the default timeout.
    pub fn send(&mut self, command: &str) -> Result<Reply> {
        let timeout = self.config.timeout();
        self.send_with_timeout(command, timeout)
    }

    /// Sends one command and reads its primary and acknowledgement frames.
    ///
    /// A primary frame that never arrives yields [`Reply::Timeout`] and
    /// leaves the session [`Unknown`](SessionState::Unknown). Its frames may
    /// still turn up, so every later exchange on this transport fails with
    /// [`ProtocolDesync`](Error::ProtocolDesync) until
    /// [`reconnect`](Self::reconnect). A missing acknowledgement is a
    /// desync straight away and kills the session.
    pub fn send_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<Reply> {
        self.exchange("send", command, timeout)
    }

    /// Returns whether the wrapper answers a no-op before `timeout`.
    ///
    /// A negative answer marks the session dead, except while a launched
    /// program owns the wrapper: then nothing is sent, the answer is `false`
    /// and the state is left alone so the program can still be joined.
    pub fn is_ready(&mut self, timeout: Duration) -> bool {
        if self.is_launched() {
            debug!("launched program owns the wrapper; skipping liveness check");
            return false;
        }
        let ready = matches!(
            self.exchange("is_ready", commands::NOOP, timeout),
            Ok(reply) if !reply.is_timeout()
        );
        if !ready && self.state != SessionState::Dead {
            warn!(state = %self.state, "wrapper did not answer; marking session dead");
            self.state = SessionState::Dead;
        }
        ready
    }

    /// Deploys the primitives and the print helper.
    ///
    /// Must complete before any higher-level operation. A failure part way
    /// through leaves the guest in an unknown state that only reconnecting
    /// and freezing again repairs.
    pub fn freeze(&mut self) -> Result<()> {
        let timeout = self.config.timeout();
        for name in commands::PRIMITIVES {
            let path = commands::primitive_path(&self.config.primitive_dir, name);
            let reply = self.exchange("freeze", &commands::include(&path), timeout)?;
            into_bytes("freeze", reply, timeout)?;
            debug!(primitive = name, "primitive loaded");
        }

        let helper =
            commands::primitive_path(&self.config.primitive_dir, commands::PRINT_HELPER_NAME);
        self.upload(&helper, commands::PRINT_HELPER)?;
        let reply = self.exchange("freeze", &commands::include(&helper), timeout)?;
        into_bytes("freeze", reply, timeout)?;

        self.state = SessionState::Frozen;
        info!(primitives = commands::PRIMITIVES.len() + 1, "session frozen");
        Ok(())
    }

    /// Tells the wrapper loop to exit and waits out the grace period.
    ///
    /// Nothing is read back: the wrapper may already be gone.
    pub fn unfreeze(&mut self) -> Result<()> {
        self.wire_mut()?.notify(commands::EXIT)?;
        std::thread::sleep(self.config.unfreeze_grace());
        self.state = SessionState::Unfrozen;
        info!("session unfrozen");
        Ok(())
    }

    /// Sends a command whose frames arrive only when the guest program it
    /// starts returns. Ordinary exchanges fail with [`Error::Busy`] until
    /// [`join_launched`](Self::join_launched) consumes them.
    pub fn launch(&mut self, command: &str) -> Result<()> {
        check_line(command)?;
        let result = self.wire_mut().and_then(|w| w.launch(command));
        self.observe("launch", result)?;
        info!(command, "guest program launched");
        Ok(())
    }

    /// Waits for a launched command's frames.
    ///
    /// Returns `Ok(None)` when nothing was launched.
    pub fn join_launched(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let d = Deadlines {
            primary: timeout,
            ack: self.config.ack_timeout(),
        };
        let result = self.wire_mut().and_then(|w| w.join(d));
        match self.observe("join_launched", result)? {
            None => Ok(None),
            Some(reply) => into_bytes("join_launched", reply, timeout).map(Some),
        }
    }

    /// `true` while a launched program owns the wrapper.
    pub fn is_launched(&self) -> bool {
        self.wire.as_ref().is_some_and(Wire::is_launched)
    }

    // ---------------------------------------------------------------------
    // Typed operations
    // ---------------------------------------------------------------------

    /// Runs arbitrary guest source, returning the primary payload.
    ///
    /// Like [`send`](Self::send), this works in any state but `Dead`; a guest
    /// fault becomes [`Error::GuestException`].
    pub fn exec(&mut self, code: &str) -> Result<Vec<u8>> {
        let timeout = self.config.timeout();
        let reply = self.exchange("exec", code, timeout)?;
        into_bytes("exec", reply, timeout)
    }

    /// Reads a guest file. The primary frame is the content, verbatim.
    pub fn read_file(&mut self, path: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.require_frozen()?;
        if self.config.denied_reads.iter().any(|p| p == path) {
            return Err(Error::Denied(path.to_owned()));
        }
        let reply = self.exchange("read_file", &commands::file_read(path), timeout)?;
        into_bytes("read_file", reply, timeout)
    }

    /// Writes `data` to a guest file.
    ///
    /// On success a subsequent [`read_file`](Self::read_file) returns the
    /// same bytes. Data containing the end-of-data byte (`0x04`) is refused
    /// with [`Error::UnsendableData`] and the session stays usable.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.require_frozen()?;
        self.upload(path, data)
    }

    /// Lists absolute paths matching a wildcard pattern (`C:/Home/*`).
    pub fn list_dir(&mut self, pattern: &str) -> Result<Vec<String>> {
        self.require_frozen()?;
        let timeout = self.config.timeout();
        let reply = self.exchange("list_dir", &commands::list_dir(pattern), timeout)?;
        Ok(commands::parse_listing(&into_bytes("list_dir", reply, timeout)?))
    }

    /// Returns whether a guest file exists.
    pub fn file_exists(&mut self, path: &str) -> Result<bool> {
        self.require_frozen()?;
        let timeout = self.config.timeout();
        let reply = self.exchange("file_exists", &commands::file_exists(path), timeout)?;
        Ok(into_bytes("file_exists", reply, timeout)?.trim_ascii() == b"1")
    }

    /// Creates a guest directory.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.require_frozen()?;
        let timeout = self.config.timeout();
        let reply = self.exchange("mkdir", &commands::mkdir(path), timeout)?;
        into_bytes("mkdir", reply, timeout).map(drop)
    }

    /// Evaluates an integer expression.
    ///
    /// Raises [`Error::GuestException`] with the decoded mnemonic when the
    /// guest faults; the session stays usable.
    pub fn evaluate_expression(&mut self, expr: &str) -> Result<i64> {
        self.require_frozen()?;
        let timeout = self.config.timeout();
        let assign = commands::assign_scratch(expr);
        let reply = self.exchange("evaluate_expression", &assign, timeout)?;
        into_bytes("evaluate_expression", reply, timeout)?;

        let reply = self.exchange("evaluate_expression", commands::GET_SCRATCH, timeout)?;
        let raw = into_bytes("evaluate_expression", reply, timeout)?;
        let text = String::from_utf8_lossy(&raw);
        let value = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        value
            .parse()
            .map_err(|_| Error::InvalidResponse(format!("expected an integer, got {value:?}")))
    }

    /// Runs `code` against a fresh string buffer and returns the buffer.
    ///
    /// `code` appends with `GStrAdd("...")` or `StrPrint(g_str, ...)`.
    pub fn evaluate_string(&mut self, code: &str) -> Result<String> {
        self.require_frozen()?;
        let timeout = self.config.timeout();
        let reply = self.exchange("evaluate_string", &commands::string_eval(code), timeout)?;
        let raw = into_bytes("evaluate_string", reply, timeout)?;
        // The buffer is never sent when the user code throws; the wrapper's
        // own OK then stands in as the primary frame.
        if raw == commands::BARE_ACK {
            return Err(Error::GuestException("exception".into()));
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// [`evaluate_string`](Self::evaluate_string) parsed as tab-separated rows.
    pub fn evaluate_rows(&mut self, code: &str) -> Result<Vec<Vec<String>>> {
        Ok(commands::parse_rows(&self.evaluate_string(code)?))
    }

    /// [`evaluate_string`](Self::evaluate_string) parsed as `key\tvalue` pairs.
    pub fn evaluate_kv(&mut self, code: &str) -> Result<BTreeMap<String, String>> {
        Ok(commands::rows_to_kv(self.evaluate_rows(code)?))
    }

    /// Returns whether `name` is defined in the guest's symbol table.
    pub fn symbol_exists(&mut self, name: &str) -> Result<bool> {
        Ok(self.evaluate_string(&commands::symbol_exists(name))?.trim() == "1")
    }

    /// Lists `(name, kind)` pairs for the symbol kinds in `mask`.
    pub fn list_symbols(&mut self, mask: SymbolMask) -> Result<Vec<(String, String)>> {
        self.require_frozen()?;
        let timeout = self.config.timeout();
        let reply = self.exchange("list_symbols", &commands::symbol_list(mask), timeout)?;
        Ok(commands::parse_symbols(&into_bytes("list_symbols", reply, timeout)?))
    }

    /// Guest memory statistics.
    pub fn mem_info(&mut self) -> Result<BTreeMap<String, MemValue>> {
        Ok(commands::parse_mem_info(self.evaluate_kv(commands::MEM_INFO)?))
    }

    /// Writes guest source to `path`, compiles it with `#include`, and
    /// optionally evaluates `call` afterwards.
    pub fn run_source(
        &mut self,
        path: &str,
        code: &str,
        call: Option<&str>,
    ) -> Result<Option<String>> {
        self.write_file(path, code.as_bytes())?;
        let timeout = self.config.timeout();
        let reply = self.exchange("run_source", &commands::include(path), timeout)?;
        into_bytes("run_source", reply, timeout)?;
        call.map(|c| self.evaluate_string(c)).transpose()
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// One command, two frames, with state bookkeeping.
    fn exchange(&mut self, op: &'static str, line: &str, primary: Duration) -> Result<Reply> {
        check_line(line)?;
        let d = Deadlines {
            primary,
            ack: self.config.ack_timeout(),
        };
        debug!(op, command = line, "exchange");
        let result = self.wire_mut().and_then(|w| w.exchange(line, d));
        self.observe(op, result)
    }

    /// File-write sub-protocol without the frozen check (used by `freeze`).
    fn upload(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let line = commands::file_write(path);
        let ready = self.config.write_ready_timeout();
        let d = Deadlines {
            primary: self.config.write_ready_timeout(),
            ack: self.config.ack_timeout(),
        };
        debug!(path, bytes = data.len(), "uploading file");
        let result = self.wire_mut().and_then(|w| w.upload(&line, data, ready, d));
        let reply = self.observe("write_file", result)?;
        into_bytes("write_file", reply, d.primary).map(drop)
    }

    /// Updates the state from an exchange outcome.
    fn observe<T: Observed>(&mut self, op: &'static str, result: Result<T>) -> Result<T> {
        match &result {
            Ok(v) if v.timed_out() => {
                warn!(op, "no reply before deadline; reconnect before the next exchange");
                self.state = SessionState::Unknown;
            }
            Err(e) if e.is_session_fatal() => {
                warn!(op, error = %e, "session is dead");
                self.state = SessionState::Dead;
            }
            _ => {}
        }
        result
    }

    /// The live wire, unless the session is dead or closed.
    fn wire_mut(&mut self) -> Result<&mut Wire<C::Stream>> {
        if self.state == SessionState::Dead {
            return Err(Error::SessionDead);
        }
        self.wire.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Higher-level operations need the primitives in place.
    const fn require_frozen(&self) -> Result<()> {
        match self.state {
            SessionState::Frozen => Ok(()),
            SessionState::Dead => Err(Error::SessionDead),
            _ => Err(Error::NotFrozen),
        }
    }
}

/// Outcomes that can carry a timeout without being an error.
trait Observed {
    /// `true` when no primary frame arrived.
    fn timed_out(&self) -> bool;
}

impl Observed for Reply {
    fn timed_out(&self) -> bool {
        self.is_timeout()
    }
}

/// A launched program may outlive any deadline; its frames stay tracked
/// and joining again is safe.
impl Observed for Option<Reply> {
    fn timed_out(&self) -> bool {
        false
    }
}

impl Observed for () {
    fn timed_out(&self) -> bool {
        false
    }
}

/// Commands travel as exactly one line.
fn check_line(line: &str) -> Result<()> {
    if line.contains(['\n', '\r']) {
        return Err(Error::InvalidCommand(
            "command must fit on a single line".into(),
        ));
    }
    Ok(())
}

/// Converts a reply into its payload or a typed failure.
fn into_bytes(op: &'static str, reply: Reply, after: Duration) -> Result<Vec<u8>> {
    match reply {
        Reply::Plain(p) => Ok(p),
        Reply::Exception(fault) => Err(Error::GuestException(fault.name)),
        Reply::Timeout => Err(Error::Timeout { op, after }),
        other => Err(Error::InvalidResponse(format!(
            "{op}: unexpected reply {other:?}"
        ))),
    }
}
