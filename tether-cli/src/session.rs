//! Serial-session subcommands.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use tether::{Config, Endpoint, MemValue, QemuMonitor, Recovery, Reply, Session, SymbolMask};

use crate::OutputFormat;

/// Arguments for `tether exec`.
#[derive(Args)]
pub struct ExecArgs {
    /// Guest source, sent as one line.
    code: String,

    /// Skip deploying the primitives first.
    #[arg(long)]
    raw: bool,

    /// Seconds to wait for the reply.
    #[arg(long)]
    timeout: Option<u64>,
}

/// Arguments for `tether cat`.
#[derive(Args)]
pub struct CatArgs {
    /// Guest path, e.g. `C:/Home/Notes.TXT`.
    path: String,

    /// Seconds to wait for the file.
    #[arg(long, default_value = "30")]
    timeout: u64,
}

/// Arguments for `tether put`.
#[derive(Args)]
pub struct PutArgs {
    /// Host file to upload.
    local: PathBuf,

    /// Guest destination path.
    remote: String,
}

/// Arguments for `tether ls`.
#[derive(Args)]
pub struct LsArgs {
    /// Wildcard pattern.
    #[arg(default_value = "C:/Home/*")]
    pattern: String,

    /// Output format.
    #[arg(long, default_value = "table")]
    format: OutputFormat,
}

/// Arguments for `tether symbols`.
#[derive(Args)]
pub struct SymbolsArgs {
    /// Symbol kinds: `functions`, `globals`, `classes`, `all` or raw bits.
    #[arg(long, default_value = "functions")]
    kind: SymbolMask,

    /// Only print names containing this substring.
    filter: Option<String>,

    /// Output format.
    #[arg(long, default_value = "table")]
    format: OutputFormat,
}

fn connect(cfg: &Config) -> Result<Session<Endpoint>> {
    Session::open(cfg.session.clone())
        .with_context(|| format!("failed to connect to {}", cfg.session.endpoint))
}

fn frozen(cfg: &Config) -> Result<Session<Endpoint>> {
    let mut session = connect(cfg)?;
    if !session.is_ready(cfg.session.ready_timeout()) {
        bail!("command wrapper is not answering; try `tether recover`");
    }
    session.freeze().context("failed to deploy primitives")?;
    Ok(session)
}

pub fn exec(cfg: &Config, args: &ExecArgs) -> Result<()> {
    let mut session = if args.raw { connect(cfg)? } else { frozen(cfg)? };
    let timeout = args
        .timeout
        .map_or_else(|| cfg.session.timeout(), Duration::from_secs);
    match session.send_with_timeout(&args.code, timeout)? {
        Reply::Plain(payload) => std::io::stdout().write_all(&payload)?,
        Reply::Exception(fault) => bail!("guest exception: {}", fault.name),
        Reply::Timeout => bail!("no reply within {timeout:?}"),
        other => bail!("unexpected reply: {other:?}"),
    }
    Ok(())
}

pub fn eval(cfg: &Config, expr: &str) -> Result<()> {
    println!("{}", frozen(cfg)?.evaluate_expression(expr)?);
    Ok(())
}

pub fn eval_str(cfg: &Config, code: &str) -> Result<()> {
    println!("{}", frozen(cfg)?.evaluate_string(code)?);
    Ok(())
}

pub fn cat(cfg: &Config, args: &CatArgs) -> Result<()> {
    let data = frozen(cfg)?.read_file(&args.path, Duration::from_secs(args.timeout))?;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

pub fn put(cfg: &Config, args: &PutArgs) -> Result<()> {
    let data = std::fs::read(&args.local)
        .with_context(|| format!("failed to read {}", args.local.display()))?;
    frozen(cfg)?.write_file(&args.remote, &data)?;
    println!("{}", args.remote);
    Ok(())
}

pub fn ls(cfg: &Config, args: &LsArgs) -> Result<()> {
    let entries = frozen(cfg)?.list_dir(&args.pattern)?;
    if matches!(args.format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for e in &entries {
        println!("{e}");
    }
    Ok(())
}

pub fn symbols(cfg: &Config, args: &SymbolsArgs) -> Result<()> {
    let mut list = frozen(cfg)?.list_symbols(args.kind)?;
    if let Some(f) = &args.filter {
        list.retain(|(name, _)| name.contains(f.as_str()));
    }
    if matches!(args.format, OutputFormat::Json) {
        let rows: Vec<_> = list
            .iter()
            .map(|(name, kind)| serde_json::json!({ "name": name, "kind": kind }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for (name, kind) in &list {
        println!("{name:<40} {kind}");
    }
    Ok(())
}

pub fn mem(cfg: &Config, format: OutputFormat) -> Result<()> {
    let info = frozen(cfg)?.mem_info()?;
    if matches!(format, OutputFormat::Json) {
        let obj: serde_json::Map<_, _> = info
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    MemValue::Int(i) => serde_json::Value::from(*i),
                    MemValue::Text(t) => serde_json::Value::from(t.as_str()),
                    _ => serde_json::Value::Null,
                };
                (k.clone(), v)
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }
    for (k, v) in &info {
        match v {
            MemValue::Int(i) => println!("{k:<24} {i}"),
            MemValue::Text(t) => println!("{k:<24} {t}"),
            _ => println!("{k:<24} ?"),
        }
    }
    Ok(())
}

pub fn ping(cfg: &Config) -> Result<()> {
    let mut session = connect(cfg)?;
    if !session.is_ready(cfg.session.ready_timeout()) {
        bail!("no answer within {:?}", cfg.session.ready_timeout());
    }
    println!("ready");
    Ok(())
}

pub fn recover(cfg: &Config) -> Result<()> {
    let monitor = QemuMonitor::new(&cfg.recovery.monitor);
    let recovery = Recovery::new(monitor, &cfg.recovery);
    let mut session = match connect(cfg) {
        Ok(s) => s,
        // A hung guest may still accept connections; a dead one may not.
        Err(_) => {
            tether::SnapshotService::load(recovery.snapshots(), &cfg.recovery.snapshot)
                .context("snapshot restore failed")?;
            connect(cfg)?
        }
    };
    if recovery.ensure_ready(&mut session)? {
        println!("recovered from {}", cfg.recovery.snapshot);
    } else {
        session.freeze().context("failed to deploy primitives")?;
        println!("ready");
    }
    Ok(())
}
