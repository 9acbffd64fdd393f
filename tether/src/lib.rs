//! Host-side control of a long-lived guest runtime over a serial console.
//!
//! `tether` drives a guest-side command wrapper through a terminator-framed
//! byte stream ([`Session`]), restores hung guests from a VM snapshot
//! ([`Recovery`]) and feeds an autonomous guest loop through an HTTP-polled
//! command queue ([`QueueBridge`], [`Agent`]).
//!
//! # Quick start
//!
//! ```no_run
//! use tether::{Config, Session};
//!
//! let config = Config::default();
//! let mut session = Session::open(config.session)?;
//! session.freeze()?;
//! assert_eq!(session.evaluate_expression("2+2")?, 4);
//! session.write_file("C:/Home/Note.TXT", b"hello")?;
//! # Ok::<(), tether::Error>(())
//! ```

mod agent;
pub mod bridge;
mod config;
mod error;
mod recovery;
pub mod session;
mod transport;

pub use agent::{Agent, DeployPlan};
pub use bridge::QueueBridge;
pub use bridge::http::BridgeServer;
pub use config::{BridgeConfig, Config, Endpoint, ProbeConfig, RecoveryConfig, SessionConfig};
pub use error::{Error, RecoveryStage, Result};
pub use recovery::{QemuMonitor, Recovery, SnapshotService};
pub use session::commands::{MemValue, SymbolMask};
pub use session::{Session, SessionState};
pub use tether_proto::{GuestFault, Reply};
pub use transport::{Connector, Link, Transport};
