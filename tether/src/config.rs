//! Host configuration and JSON persistence.
//!
//! Every field has a default, so a partial file (or none at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, fs, io};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where the guest's serial console is exposed on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[non_exhaustive]
pub enum Endpoint {
    /// Unix socket path (`unix:/tmp/temple-serial.sock`).
    Unix(PathBuf),
    /// TCP address (`tcp:127.0.0.1:4555`).
    Tcp(String),
}

impl std::str::FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            Ok(Self::Unix(PathBuf::from(path)))
        } else if let Some(addr) = s.strip_prefix("tcp:") {
            Ok(Self::Tcp(addr.to_owned()))
        } else if s.starts_with('/') {
            Ok(Self::Unix(PathBuf::from(s)))
        } else {
            Err(Error::Config(format!(
                "endpoint '{s}' must start with 'unix:' or 'tcp:'"
            )))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(p) => write!(f, "unix:{}", p.display()),
            Self::Tcp(a) => write!(f, "tcp:{a}"),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(e: Endpoint) -> Self {
        e.to_string()
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Unix(PathBuf::from("/tmp/temple-serial.sock"))
    }
}

/// Protocol session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Serial console endpoint.
    pub endpoint: Endpoint,
    /// Default deadline for a primary frame.
    pub timeout_ms: u64,
    /// Deadline for the wrapper's acknowledgement frame.
    pub ack_timeout_ms: u64,
    /// Deadline for the `is_ready` no-op.
    pub ready_timeout_ms: u64,
    /// Deadline for the file-write ready byte.
    pub write_ready_timeout_ms: u64,
    /// Grace period after sending `EXIT`.
    pub unfreeze_grace_ms: u64,
    /// Guest directory holding the primitive sources.
    pub primitive_dir: String,
    /// Guest paths that must never be transferred.
    pub denied_reads: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            timeout_ms: 20_000,
            ack_timeout_ms: 3_000,
            ready_timeout_ms: 3_000,
            write_ready_timeout_ms: 10_000,
            unfreeze_grace_ms: 500,
            primitive_dir: "C:/Home".into(),
            denied_reads: vec![
                "C:/Adam/AutoComplete/ACDefs.DATA".into(),
                "C:/Adam/AutoComplete/ACWords.DATA.Z".into(),
            ],
        }
    }
}

impl SessionConfig {
    /// Default primary-frame deadline.
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Acknowledgement-frame deadline.
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// `is_ready` deadline.
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// File-write handshake deadline.
    pub const fn write_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.write_ready_timeout_ms)
    }

    /// Grace period after `unfreeze`.
    pub const fn unfreeze_grace(&self) -> Duration {
        Duration::from_millis(self.unfreeze_grace_ms)
    }
}

/// Snapshot-based recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RecoveryConfig {
    /// QEMU monitor Unix socket.
    pub monitor: PathBuf,
    /// Snapshot restored on recovery.
    pub snapshot: String,
    /// Wait after restoring the snapshot.
    pub settle_ms: u64,
    /// Wait between closing and reopening the transport.
    pub reconnect_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            monitor: PathBuf::from("/tmp/qmon.sock"),
            snapshot: "snap1".into(),
            settle_ms: 3_000,
            reconnect_delay_ms: 500,
        }
    }
}

impl RecoveryConfig {
    /// Post-restore settle delay.
    pub const fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Delay before reconnecting.
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Command queue bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct BridgeConfig {
    /// Address the HTTP surface listens on.
    pub listen: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8081".into(),
        }
    }
}

/// Liveness probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ProbeConfig {
    /// Overall deadline for the guest loop to come online.
    pub timeout_ms: u64,
    /// Wait for each probe's result.
    pub interval_ms: u64,
    /// Pause between the two post-online flushes.
    pub settle_ms: u64,
    /// Guest source enqueued as the probe.
    pub command: String,
    /// Substring a result must contain to count as online.
    pub marker: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            interval_ms: 5_000,
            settle_ms: 2_500,
            command: "CatPrint(g_agent_out,\"PONG\\n\");".into(),
            marker: "PONG".into(),
        }
    }
}

impl ProbeConfig {
    /// Overall deadline.
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Per-probe wait.
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Flush settle delay.
    pub const fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Protocol session.
    pub session: SessionConfig,
    /// Crash recovery.
    pub recovery: RecoveryConfig,
    /// Queue bridge.
    pub bridge: BridgeConfig,
    /// Liveness probing.
    pub probe: ProbeConfig,
}

impl Config {
    /// Loads configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Loads `path` if it exists, falling back to defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            other => other,
        }
    }

    /// Persists configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(|e| Error::Io(io::Error::other(e)))
    }

    /// `{config_dir}/tether/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tether").join("config.json"))
    }
}
