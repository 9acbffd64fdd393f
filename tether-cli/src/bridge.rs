//! Queue bridge and guest-loop subcommands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use tether::{Agent, BridgeServer, Config, DeployPlan, QemuMonitor, QueueBridge, Session};
use tokio::net::TcpListener;
use tracing::info;

/// Arguments for `tether bridge serve`.
#[derive(Args)]
pub struct ServeArgs {
    /// Listen address (defaults to the configured one).
    #[arg(long)]
    listen: Option<String>,

    /// Also probe until the guest loop answers and report it.
    #[arg(long)]
    probe: bool,
}

/// Arguments for `tether agent`.
#[derive(Args)]
pub struct AgentArgs {
    /// Guest loop source on the host.
    #[arg(long)]
    source: PathBuf,

    /// Snippets to run in order; each writes its output to `g_agent_out`.
    #[arg(required = true, num_args = 1..)]
    code: Vec<String>,

    /// Seconds to wait for each snippet.
    #[arg(long, default_value = "20")]
    timeout: u64,
}

pub async fn serve(cfg: &Config, args: &ServeArgs) -> Result<()> {
    let addr = args.listen.as_deref().unwrap_or(&cfg.bridge.listen);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let bridge = Arc::new(QueueBridge::new());

    if args.probe {
        let bridge = Arc::clone(&bridge);
        let probe = cfg.probe.clone();
        tokio::task::spawn_blocking(move || {
            if tether::bridge::wait_online(&bridge, &probe) {
                info!("guest loop online");
            } else {
                info!("guest loop did not come online");
            }
        });
    }

    tether::bridge::http::serve(listener, bridge, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

pub fn agent(cfg: &Config, args: &AgentArgs) -> Result<()> {
    let bridge = Arc::new(QueueBridge::new());
    let server = BridgeServer::spawn(cfg.bridge.listen.as_str(), Arc::clone(&bridge))
        .with_context(|| format!("failed to bind {}", cfg.bridge.listen))?;

    let session = Session::open(cfg.session.clone())
        .with_context(|| format!("failed to connect to {}", cfg.session.endpoint))?;
    let mut plan = DeployPlan::from_file(&args.source)
        .with_context(|| format!("failed to read {}", args.source.display()))?;
    plan.snapshot.clone_from(&cfg.recovery.snapshot);
    plan.settle = cfg.recovery.settle();

    let monitor = QemuMonitor::new(&cfg.recovery.monitor);
    let mut agent = Agent::new(bridge, session);
    if !agent.start(&monitor, &plan, &cfg.probe)? {
        agent.stop()?;
        bail!("guest loop did not come online within {:?}", cfg.probe.timeout());
    }

    let timeout = Duration::from_secs(args.timeout);
    for code in &args.code {
        println!("{}", agent.run(code, timeout));
    }
    agent.stop()?;
    server.shutdown()?;
    Ok(())
}
