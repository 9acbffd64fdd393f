//! CLI for driving a guest runtime through tether.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod bridge;
mod session;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tether::{Config, Endpoint};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether", version, about = "Drive a guest runtime over its serial console")]
struct Cli {
    /// Configuration file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial endpoint, overriding the configuration (`unix:<path>` or `tcp:<host:port>`).
    #[arg(long, global = true)]
    endpoint: Option<Endpoint>,

    /// Log protocol exchanges to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run guest source and print its payload.
    Exec(session::ExecArgs),

    /// Evaluate an integer expression.
    Eval {
        /// Expression, e.g. `6*7`.
        expr: String,
    },

    /// Run code against a fresh string buffer and print the buffer.
    #[command(name = "eval-str")]
    EvalStr {
        /// Code appending to the buffer, e.g. `GStrAdd("hi");`.
        code: String,
    },

    /// Print a guest file to stdout.
    Cat(session::CatArgs),

    /// Copy a host file into the guest.
    Put(session::PutArgs),

    /// List guest entries matching a wildcard pattern.
    Ls(session::LsArgs),

    /// List guest symbols.
    Symbols(session::SymbolsArgs),

    /// Print guest memory statistics.
    Mem {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Check that the command wrapper answers.
    Ping,

    /// Restore the snapshot, reconnect and re-initialize.
    Recover,

    /// Save or load a VM snapshot through the QEMU monitor.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Command queue bridge for a guest loop program.
    Bridge {
        #[command(subcommand)]
        action: BridgeAction,
    },

    /// Deploy the guest loop, run snippets through it, then stop it.
    Agent(bridge::AgentArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Subcommands for `tether snapshot`.
#[derive(Subcommand)]
enum SnapshotAction {
    /// Save the current VM state.
    Save {
        /// Snapshot name (defaults to the configured one).
        name: Option<String>,
    },
    /// Restore a saved VM state.
    Load {
        /// Snapshot name (defaults to the configured one).
        name: Option<String>,
    },
}

/// Subcommands for `tether bridge`.
#[derive(Subcommand)]
enum BridgeAction {
    /// Serve `GET /cmd` and `POST /result` until interrupted.
    Serve(bridge::ServeArgs),
}

/// Output format for list commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(e) = cli.dispatch().await {
        eprintln!("tether: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("tether=debug,tether_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let path = match &self.config {
            Some(p) => p.clone(),
            None => match Config::default_path() {
                Some(p) => p,
                None => return Ok(self.with_overrides(Config::default())),
            },
        };
        let cfg = Config::load_or_default(&path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        Ok(self.with_overrides(cfg))
    }

    fn with_overrides(&self, mut cfg: Config) -> Config {
        if let Some(endpoint) = &self.endpoint {
            cfg.session.endpoint = endpoint.clone();
        }
        cfg
    }

    async fn dispatch(self) -> Result<()> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "tether", &mut std::io::stdout());
            return Ok(());
        }
        let cfg = self.load_config()?;

        match self.command {
            Command::Exec(args) => session::exec(&cfg, &args),
            Command::Eval { expr } => session::eval(&cfg, &expr),
            Command::EvalStr { code } => session::eval_str(&cfg, &code),
            Command::Cat(args) => session::cat(&cfg, &args),
            Command::Put(args) => session::put(&cfg, &args),
            Command::Ls(args) => session::ls(&cfg, &args),
            Command::Symbols(args) => session::symbols(&cfg, &args),
            Command::Mem { format } => session::mem(&cfg, format),
            Command::Ping => session::ping(&cfg),
            Command::Recover => session::recover(&cfg),
            Command::Snapshot { action } => snapshot(&cfg, action),
            Command::Bridge {
                action: BridgeAction::Serve(args),
            } => bridge::serve(&cfg, &args).await,
            Command::Agent(args) => bridge::agent(&cfg, &args),
            Command::Completion { .. } => Ok(()),
        }
    }
}

fn snapshot(cfg: &Config, action: SnapshotAction) -> Result<()> {
    use tether::SnapshotService;

    let monitor = tether::QemuMonitor::new(&cfg.recovery.monitor);
    match action {
        SnapshotAction::Save { name } => {
            let name = name.unwrap_or_else(|| cfg.recovery.snapshot.clone());
            monitor
                .save(&name)
                .with_context(|| format!("savevm {name} failed"))?;
            println!("{name}");
        }
        SnapshotAction::Load { name } => {
            let name = name.unwrap_or_else(|| cfg.recovery.snapshot.clone());
            monitor
                .load(&name)
                .with_context(|| format!("loadvm {name} failed"))?;
            println!("{name}");
        }
    }
    Ok(())
}
