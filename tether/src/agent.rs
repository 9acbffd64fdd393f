//! Bridge-driven execution against a guest loop program.
//!
//! The loop polls the [`QueueBridge`] over HTTP, runs each command in one
//! long-lived guest task and posts whatever the command wrote to
//! `g_agent_out`. Globals and functions defined by one command persist for
//! the next.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::{QueueBridge, wait_online};
use crate::config::ProbeConfig;
use crate::error::RecoveryStage;
use crate::recovery::SnapshotService;
use crate::session::{Session, commands};
use crate::transport::Connector;
use crate::{Error, Result};

/// How to put the guest loop in place.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct DeployPlan {
    /// Loop source written to the guest.
    pub source: Vec<u8>,
    /// Guest directory receiving the source.
    pub dir: String,
    /// File name inside `dir`.
    pub file: String,
    /// Snapshot restored before deploying.
    pub snapshot: String,
    /// Wait after the restore.
    pub settle: Duration,
}

impl DeployPlan {
    /// Plans a deployment of `source` to `C:/AI/AgentLoop.HC` from `snap1`.
    pub fn new(source: impl Into<Vec<u8>>) -> Self {
        Self {
            source: source.into(),
            dir: "C:/AI".into(),
            file: "AgentLoop.HC".into(),
            snapshot: "snap1".into(),
            settle: Duration::from_secs(8),
        }
    }

    /// Reads the loop source from a host file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }

    /// Guest path of the deployed source.
    pub fn target(&self) -> String {
        format!("{}/{}", self.dir.trim_end_matches('/'), self.file)
    }
}

/// A guest loop driven through a [`QueueBridge`], with a [`Session`] used to
/// deploy it.
///
/// While the loop runs it owns the guest's command wrapper, so session
/// operations fail with [`Error::Busy`] between [`start`](Self::start) and
/// [`stop`](Self::stop).
pub struct Agent<C: Connector> {
    /// Queues polled by the loop.
    bridge: Arc<QueueBridge>,
    /// Deploys the loop and collects its launch frames.
    session: Session<C>,
    /// Default deadline for `eval_*` and `define`.
    timeout: Duration,
    /// Wait between `EXIT` and collecting the loop's frames.
    exit_grace: Duration,
    /// Time a timed-out command gets to post its late result.
    settle: Duration,
    /// The loop answered its probe and has not been stopped.
    live: bool,
}

impl<C: Connector> fmt::Debug for Agent<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("bridge", &self.bridge)
            .field("session", &self.session.state())
            .field("timeout", &self.timeout)
            .field("exit_grace", &self.exit_grace)
            .field("settle", &self.settle)
            .field("live", &self.live)
            .finish()
    }
}

impl<C: Connector> Agent<C> {
    /// Creates an agent over `bridge`, deploying through `session`.
    pub const fn new(bridge: Arc<QueueBridge>, session: Session<C>) -> Self {
        Self {
            bridge,
            session,
            timeout: Duration::from_secs(20),
            exit_grace: Duration::from_secs(10),
            settle: Duration::from_secs(2),
            live: false,
        }
    }

    /// Overrides the default evaluation deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the wait after `EXIT`.
    #[must_use]
    pub const fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    /// Overrides how long a timed-out `run` waits for a late result to
    /// flush.
    #[must_use]
    pub const fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// The bridge the loop polls.
    pub const fn bridge(&self) -> &Arc<QueueBridge> {
        &self.bridge
    }

    /// The deployment session, for file access while the loop is stopped.
    pub const fn session_mut(&mut self) -> &mut Session<C> {
        &mut self.session
    }

    /// `true` between a successful `start` and `stop`.
    pub const fn is_live(&self) -> bool {
        self.live
    }

    /// Restores a clean guest, deploys the loop and waits for it to answer.
    ///
    /// Returns `Ok(false)` when the loop never came online within
    /// `probe.timeout`; it stays launched so [`stop`](Self::stop) can still
    /// collect it.
    pub fn start(
        &mut self,
        snapshots: &dyn SnapshotService,
        plan: &DeployPlan,
        probe: &ProbeConfig,
    ) -> Result<bool> {
        self.bridge.flush();

        snapshots
            .load(&plan.snapshot)
            .map_err(|e| Error::Io(e).during(RecoveryStage::Snapshot))?;
        std::thread::sleep(plan.settle);

        self.session.reconnect()?;
        let ready_timeout = self.session.config().ready_timeout();
        if !self.session.is_ready(ready_timeout) {
            return Err(Error::SessionDead);
        }
        self.session.freeze()?;

        let target = plan.target();
        self.session.mkdir(&plan.dir)?;
        self.session.write_file(&target, &plan.source)?;
        self.session.launch(&commands::include(&target))?;
        info!(%target, "guest loop deployed");

        self.live = wait_online(&self.bridge, probe);
        Ok(self.live)
    }

    /// Asks the loop to exit and collects its launch frames.
    pub fn stop(&mut self) -> Result<()> {
        if !self.session.is_launched() {
            self.live = false;
            return Ok(());
        }
        self.bridge.enqueue_command(commands::EXIT);
        self.live = false;
        std::thread::sleep(self.exit_grace);

        let timeout = self.session.config().timeout();
        match self.session.join_launched(timeout) {
            Ok(_) => info!("guest loop stopped"),
            Err(Error::GuestException(name)) => warn!(%name, "guest loop exited with a fault"),
            Err(e) => return Err(e),
        }
        self.bridge.flush();
        Ok(())
    }

    /// Stops the loop, drops the connection and starts over from the
    /// snapshot. Everything the previous loop defined is gone afterwards.
    ///
    /// A loop that cannot be stopped cleanly is abandoned; the snapshot
    /// restore replaces it anyway.
    pub fn restart(
        &mut self,
        snapshots: &dyn SnapshotService,
        plan: &DeployPlan,
        probe: &ProbeConfig,
    ) -> Result<bool> {
        if let Err(e) = self.stop() {
            warn!(error = %e, "guest loop did not stop cleanly; restarting anyway");
        }
        self.session.close();
        info!("restarting guest loop");
        self.start(snapshots, plan, probe)
    }

    /// Runs `code` in the loop and returns what it wrote to `g_agent_out`,
    /// trailing whitespace trimmed.
    ///
    /// Returns an empty string on timeout. If the loop had already picked
    /// the command up, the call waits out the settle delay and flushes, so
    /// a result landing within it is not taken for the next `run`.
    pub fn run(&self, code: &str, timeout: Duration) -> String {
        match self.bridge.exchange(code, timeout, self.settle) {
            Ok(raw) => String::from_utf8_lossy(&raw).trim_end().to_owned(),
            Err(e) => {
                warn!(error = %e, "no result from guest loop");
                String::new()
            }
        }
    }

    /// Loads definitions; output is discarded.
    pub fn define(&self, code: &str) {
        let out = self.run(code, self.timeout);
        if !out.is_empty() {
            debug!(output = %out, "definition produced output");
        }
    }

    /// Evaluates an `I64` expression.
    pub fn eval_i64(&self, expr: &str) -> Option<i64> {
        self.print("%lld", expr).trim().parse().ok()
    }

    /// Evaluates an `F64` expression.
    pub fn eval_f64(&self, expr: &str) -> Option<f64> {
        self.print("%.10f", expr).trim().parse().ok()
    }

    /// Evaluates a `U8 *` expression.
    pub fn eval_str(&self, expr: &str) -> String {
        self.print("%s", expr).trim().to_owned()
    }

    /// Evaluates an expression printed as hex.
    pub fn eval_hex(&self, expr: &str) -> Option<u64> {
        u64::from_str_radix(self.print("%X", expr).trim(), 16).ok()
    }

    /// Guest uptime in seconds.
    pub fn uptime(&self) -> Option<f64> {
        self.eval_f64("tS")
    }

    /// Runs `expr` through `StrPrint` with `fmt`.
    fn print(&self, fmt: &str, expr: &str) -> String {
        self.run(&print_command(fmt, expr), self.timeout)
    }
}

/// `StrPrint(g_agent_out,"<fmt>\n",(<expr>));`
fn print_command(fmt: &str, expr: &str) -> String {
    format!("StrPrint(g_agent_out,\"{fmt}\\n\",({expr}));")
}
