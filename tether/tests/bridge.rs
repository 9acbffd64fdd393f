//! Queue bridge over real HTTP, and liveness probing.

#![allow(clippy::unwrap_used, clippy::missing_docs_in_private_items)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tether::{BridgeServer, ProbeConfig, QueueBridge};

#[test]
fn guest_polls_and_posts_over_http() {
    let bridge = Arc::new(QueueBridge::new());
    let server = BridgeServer::spawn("127.0.0.1:0", Arc::clone(&bridge)).unwrap();
    let base = format!("http://{}", server.local_addr());

    let empty = ureq::get(&format!("{base}/cmd"))
        .call()
        .unwrap()
        .body_mut()
        .read_to_string()
        .unwrap();
    assert_eq!(empty, "");

    bridge.enqueue_command("Beep;");
    let cmd = ureq::get(&format!("{base}/cmd"))
        .call()
        .unwrap()
        .body_mut()
        .read_to_string()
        .unwrap();
    assert_eq!(cmd, "Beep;");

    let echo = ureq::post(&format!("{base}/result"))
        .send("done\n")
        .unwrap()
        .body_mut()
        .read_to_string()
        .unwrap();
    assert_eq!(echo, "ECHO:done\n");
    assert_eq!(bridge.await_result(Duration::from_secs(1)).unwrap(), b"done\n");

    server.shutdown().unwrap();
}

/// A guest loop that ignores the queue until `delay` has passed, then
/// answers every command with `PONG` after a short execution time.
fn late_guest(
    bridge: Arc<QueueBridge>,
    delay: Duration,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(delay);
        while !stop.load(Ordering::SeqCst) {
            match bridge.dequeue_command() {
                Some(_) => {
                    thread::sleep(Duration::from_millis(20));
                    bridge.post_result(b"PONG\n".to_vec());
                }
                None => thread::sleep(Duration::from_millis(5)),
            }
        }
    })
}

#[test]
fn wait_online_returns_with_clean_queues() {
    // 30 s deadline, 5 s probes, guest answering after 12 s; scaled 1:20.
    let mut probe = ProbeConfig::default();
    probe.timeout_ms = 1_500;
    probe.interval_ms = 250;
    probe.settle_ms = 200;

    let bridge = Arc::new(QueueBridge::new());
    let stop = Arc::new(AtomicBool::new(false));
    let guest = late_guest(
        Arc::clone(&bridge),
        Duration::from_millis(600),
        Arc::clone(&stop),
    );

    let started = Instant::now();
    assert!(tether::bridge::wait_online(&bridge, &probe));
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert_eq!(bridge.pending_commands(), 0);
    assert_eq!(bridge.pending_results(), 0);

    stop.store(true, Ordering::SeqCst);
    guest.join().unwrap();
}

#[test]
fn wait_online_gives_up_at_deadline() {
    let mut probe = ProbeConfig::default();
    probe.timeout_ms = 300;
    probe.interval_ms = 100;
    probe.settle_ms = 0;

    let bridge = QueueBridge::new();
    let started = Instant::now();
    assert!(!tether::bridge::wait_online(&bridge, &probe));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(2));
}
