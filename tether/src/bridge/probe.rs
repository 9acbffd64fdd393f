//! Liveness probing of the guest loop behind a [`QueueBridge`].

use std::time::Instant;

use tracing::{debug, info, warn};

use super::QueueBridge;
use crate::config::ProbeConfig;

/// Waits until the guest loop answers a probe, then leaves both queues
/// clean.
///
/// Each round enqueues `probe.command` and waits up to `probe.interval` for
/// a result containing `probe.marker`. Rounds that time out leave their
/// probe queued, and the guest may already be running one when the first
/// marker arrives. So once online the queues are flushed, the settle delay
/// lets that in-flight probe finish, and a second flush drops its result.
///
/// Returns `false` when `probe.timeout` elapses without a marker.
pub fn wait_online(bridge: &QueueBridge, probe: &ProbeConfig) -> bool {
    let deadline = Instant::now() + probe.timeout();
    let mut round = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(rounds = round, "guest loop never answered a probe");
            return false;
        }
        round += 1;
        bridge.enqueue_command(probe.command.as_str());

        match bridge.await_result(probe.interval().min(remaining)) {
            Ok(result) if contains(&result, probe.marker.as_bytes()) => break,
            Ok(result) => debug!(round, bytes = result.len(), "ignoring non-probe result"),
            Err(_) => debug!(round, "no probe result yet"),
        }
    }

    bridge.flush();
    std::thread::sleep(probe.settle());
    bridge.flush();
    info!(rounds = round, "guest loop online");
    true
}

/// Byte-substring search; an empty needle always matches.
fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
