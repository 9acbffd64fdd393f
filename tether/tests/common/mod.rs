//! Scripted stand-in for the guest's command wrapper.
//!
//! Each connection gets its own thread speaking the framed protocol over a
//! `UnixStream::pair()`. Guest state (files, symbols, hang flag) is shared
//! across connections so it survives a reconnect the way a VM does.

#![allow(dead_code, clippy::unwrap_used, clippy::missing_docs_in_private_items)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tether::{SessionConfig, SnapshotService};
use tether_proto::{READY, TERMINATOR};

#[derive(Debug, Default)]
pub struct GuestState {
    pub files: BTreeMap<String, Vec<u8>>,
    pub symbols: BTreeSet<String>,
    pub includes: Vec<String>,
    pub scratch: i64,
    pub hung: bool,
    /// Base URL of the bridge the loop program polls.
    pub bridge_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeGuest {
    pub state: Arc<Mutex<GuestState>>,
    pub connections: Arc<AtomicUsize>,
}

impl FakeGuest {
    pub fn new() -> Self {
        let guest = Self::default();
        guest.state.lock().unwrap().symbols.insert("Print".into());
        guest
    }

    /// A connector that spawns a fresh wrapper thread per connection.
    pub fn connector(&self) -> impl Fn() -> io::Result<UnixStream> + use<> {
        let guest = self.clone();
        move || {
            let (host, dev) = UnixStream::pair()?;
            guest.connections.fetch_add(1, Ordering::SeqCst);
            let state = Arc::clone(&guest.state);
            thread::spawn(move || serve(dev, &state));
            Ok(host)
        }
    }

    pub fn hang(&self) {
        self.state.lock().unwrap().hung = true;
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }
}

/// Snapshot service that clears the hang and counts restores.
#[derive(Debug)]
pub struct FakeSnapshots {
    pub guest: FakeGuest,
    pub loads: AtomicUsize,
    pub fail: bool,
}

impl FakeSnapshots {
    pub fn new(guest: &FakeGuest) -> Self {
        Self {
            guest: guest.clone(),
            loads: AtomicUsize::new(0),
            fail: false,
        }
    }
}

impl SnapshotService for FakeSnapshots {
    fn load(&self, _name: &str) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::other("monitor unreachable"));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.guest.state.lock().unwrap().hung = false;
        Ok(())
    }

    fn save(&self, _name: &str) -> io::Result<()> {
        Ok(())
    }
}

/// Short deadlines so failure paths stay fast.
pub fn fast_config() -> SessionConfig {
    let mut cfg = SessionConfig::default();
    cfg.timeout_ms = 2_000;
    cfg.ack_timeout_ms = 1_000;
    cfg.ready_timeout_ms = 300;
    cfg.write_ready_timeout_ms = 1_000;
    cfg.unfreeze_grace_ms = 0;
    cfg
}

fn frame(w: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    w.write_all(payload)?;
    w.write_all(&TERMINATOR)
}

fn reply(w: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    frame(w, payload)?;
    frame(w, b"OK")?;
    w.flush()
}

/// First quoted argument of `Fn("arg");`.
fn arg(line: &str) -> String {
    line.split('"').nth(1).unwrap_or_default().to_owned()
}

fn except(name: &str) -> Vec<u8> {
    let mut word = [0u8; 8];
    word[..name.len()].copy_from_slice(name.as_bytes());
    format!("EXCEPT:{:X}", u64::from_le_bytes(word)).into_bytes()
}

/// `a op b` over integers; `None` on division by zero.
fn eval(expr: &str) -> Option<i64> {
    let expr = expr.trim();
    for op in ['+', '-', '*', '/'] {
        if let Some((a, b)) = expr.rsplit_once(op).filter(|(a, _)| !a.is_empty()) {
            let (a, b) = (eval(a)?, eval(b)?);
            return match op {
                '+' => Some(a + b),
                '-' => Some(a - b),
                '*' => Some(a * b),
                _ => a.checked_div(b),
            };
        }
    }
    expr.parse().ok()
}

fn serve(dev: UnixStream, state: &Mutex<GuestState>) {
    let mut out = dev.try_clone().unwrap();
    let mut input = BufReader::new(dev);
    let mut line = String::new();
    loop {
        line.clear();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let cmd = line.trim_end_matches(['\n', '\r']).to_owned();
        if state.lock().unwrap().hung {
            continue;
        }
        if handle(&cmd, &mut input, &mut out, state).is_err() {
            return;
        }
    }
}

fn handle(
    cmd: &str,
    input: &mut BufReader<UnixStream>,
    out: &mut UnixStream,
    state: &Mutex<GuestState>,
) -> io::Result<()> {
    if cmd == "EXIT" {
        return Err(io::ErrorKind::ConnectionAborted.into());
    }
    if cmd == "while(1);" {
        state.lock().unwrap().hung = true;
        return Ok(());
    }
    if cmd == "SLOW" {
        thread::sleep(Duration::from_millis(300));
        return reply(out, b"slow");
    }
    if cmd == "DESYNC" {
        frame(out, b"payload")?;
        frame(out, b"NOT-OK")?;
        return out.flush();
    }
    if cmd == "NEAR" {
        let mut payload = b"a".to_vec();
        payload.extend_from_slice(&TERMINATOR[..7]);
        payload.extend_from_slice(b"b");
        payload.extend_from_slice(&TERMINATOR[..3]);
        return reply(out, &payload);
    }
    if let Some(expr) = cmd.strip_prefix("g_r=").and_then(|r| r.strip_suffix(';')) {
        return match eval(expr) {
            Some(v) => {
                state.lock().unwrap().scratch = v;
                reply(out, b"")
            }
            None => reply(out, &except("DivZero")),
        };
    }
    if cmd == "SerGetI64(g_r);" {
        let v = state.lock().unwrap().scratch;
        return reply(out, v.to_string().as_bytes());
    }
    if cmd.starts_with("SerFileWrite(") {
        out.write_all(&[READY])?;
        out.flush()?;
        let mut data = Vec::new();
        input.read_until(READY, &mut data)?;
        data.pop();
        state.lock().unwrap().files.insert(arg(cmd), data);
        return reply(out, b"");
    }
    if cmd.starts_with("SerFileRead(") {
        let data = state.lock().unwrap().files.get(&arg(cmd)).cloned().unwrap_or_default();
        return reply(out, &data);
    }
    if cmd.starts_with("SerFileExists(") {
        let found = state.lock().unwrap().files.contains_key(&arg(cmd));
        return reply(out, if found { b"1" } else { b"0" });
    }
    if cmd.starts_with("SerDir(") {
        let pattern = arg(cmd);
        let prefix = pattern.trim_end_matches('*');
        let mut listing = format!("{prefix}.\n{prefix}..\n");
        for path in state.lock().unwrap().files.keys() {
            if path.starts_with(prefix) {
                listing.push_str(path);
                listing.push('\n');
            }
        }
        return reply(out, listing.as_bytes());
    }
    if cmd.starts_with("SerSymList(") {
        let rows: String = state
            .lock()
            .unwrap()
            .symbols
            .iter()
            .map(|s| format!("{s}\tfunction\n"))
            .collect();
        return reply(out, rows.as_bytes());
    }
    if let Some(body) = cmd
        .strip_prefix("GStrReset();")
        .and_then(|r| r.strip_suffix("SerSendStr();"))
    {
        if body.starts_with("SerSymExists(") {
            let found = state.lock().unwrap().symbols.contains(&arg(body));
            return reply(out, if found { b"1" } else { b"0" });
        }
        if body.starts_with("throw") {
            return reply(out, b"OK");
        }
        return reply(out, arg(body).as_bytes());
    }
    if let Some(path) = cmd.strip_prefix("#include ") {
        let path = arg(path);
        state.lock().unwrap().includes.push(path.clone());
        if path.ends_with("AgentLoop.HC") {
            run_loop(state);
        }
        return reply(out, b"");
    }
    reply(out, b"")
}

/// The deployed loop program: polls the bridge until it fetches `EXIT`.
fn run_loop(state: &Mutex<GuestState>) {
    let Some(base) = state.lock().unwrap().bridge_url.clone() else {
        return;
    };
    loop {
        let cmd = match ureq::get(&format!("{base}/cmd")).call() {
            Ok(mut resp) => resp.body_mut().read_to_string().unwrap_or_default(),
            Err(_) => return,
        };
        if cmd.is_empty() {
            thread::sleep(Duration::from_millis(10));
            continue;
        }
        if cmd == "EXIT" {
            return;
        }
        let out = loop_eval(&cmd);
        if ureq::post(&format!("{base}/result")).send(out.as_bytes()).is_err() {
            return;
        }
    }
}

/// Understands `CatPrint(g_agent_out,"TEXT\n");` and
/// `StrPrint(g_agent_out,"%lld\n",(expr));`.
fn loop_eval(cmd: &str) -> String {
    if cmd.starts_with("CatPrint(") {
        return arg(cmd).replace("\\n", "\n");
    }
    if let Some(rest) = cmd.strip_prefix("StrPrint(g_agent_out,\"%lld\\n\",(") {
        let expr = rest.trim_end_matches(");").trim_end_matches(')');
        return eval(expr).map_or_else(String::new, |v| format!("{v}\n"));
    }
    String::new()
}
