//! Command/result queues shared between the host and a polling guest loop.
//!
//! The guest fetches commands with `GET /cmd` and submits results with
//! `POST /result` (see [`http`]). Results carry no correlation id, so a
//! result is matched to a command purely by order. [`QueueBridge::exchange`]
//! is the single-flight way to use the queues and cleans up after itself on
//! timeout; the raw methods are for callers that clean up with
//! [`QueueBridge::flush`] themselves.

pub mod http;
mod probe;

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

pub use self::probe::wait_online;
use crate::{Error, Result};

/// Two independent FIFOs plus the wake-up for blocked result waiters.
#[derive(Debug, Default)]
pub struct QueueBridge {
    /// Commands waiting for the guest.
    commands: Mutex<VecDeque<String>>,
    /// Results waiting for the host.
    results: Mutex<VecDeque<Vec<u8>>>,
    /// Signalled on every posted result.
    result_posted: Condvar,
    /// Held across enqueue and await by [`exchange`](Self::exchange).
    flight: Mutex<()>,
}

impl QueueBridge {
    /// Creates an empty bridge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command for the guest.
    pub fn enqueue_command(&self, command: impl Into<String>) {
        let command = command.into();
        debug!(bytes = command.len(), "command queued");
        lock(&self.commands).push_back(command);
    }

    /// Pops the next command, if any. Never blocks.
    pub fn dequeue_command(&self) -> Option<String> {
        lock(&self.commands).pop_front()
    }

    /// Appends a result from the guest and wakes one waiter.
    pub fn post_result(&self, result: impl Into<Vec<u8>>) {
        let result = result.into();
        debug!(bytes = result.len(), "result posted");
        lock(&self.results).push_back(result);
        self.result_posted.notify_one();
    }

    /// Pops the oldest result, waiting up to `timeout` for one to arrive.
    ///
    /// Only the calling thread blocks; the queues stay available to the
    /// guest side while it waits.
    pub fn await_result(&self, timeout: Duration) -> Result<Vec<u8>> {
        let results = lock(&self.results);
        let (mut results, _) = self
            .result_posted
            .wait_timeout_while(results, timeout, |q| q.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        results.pop_front().ok_or(Error::Timeout {
            op: "await_result",
            after: timeout,
        })
    }

    /// Sends one command and waits for its result while holding the flight
    /// lock, so no other `exchange` can interleave.
    ///
    /// On timeout the queues are cleaned before the lock is released. A
    /// command the guest never fetched is simply dropped. One it already
    /// fetched may still post a result, so unless that result was already
    /// flushed, `settle` gives it time to land and a second flush drops it.
    pub fn exchange(
        &self,
        command: impl Into<String>,
        timeout: Duration,
        settle: Duration,
    ) -> Result<Vec<u8>> {
        let _flight = lock(&self.flight);
        self.enqueue_command(command);
        let result = self.await_result(timeout);
        if result.is_err() && self.flush() == (0, 0) {
            debug!(?settle, "abandoned command already fetched; settling");
            std::thread::sleep(settle);
            self.flush();
        }
        result
    }

    /// Drains both queues at once, returning how many commands and results
    /// were discarded.
    pub fn flush(&self) -> (usize, usize) {
        let mut commands = lock(&self.commands);
        let mut results = lock(&self.results);
        let dropped = (commands.len(), results.len());
        commands.clear();
        results.clear();
        if dropped != (0, 0) {
            debug!(commands = dropped.0, results = dropped.1, "queues flushed");
        }
        dropped
    }

    /// Commands not yet fetched by the guest.
    pub fn pending_commands(&self) -> usize {
        lock(&self.commands).len()
    }

    /// Results not yet taken by the host.
    pub fn pending_results(&self) -> usize {
        lock(&self.results).len()
    }

    /// `true` when both queues are empty.
    pub fn is_empty(&self) -> bool {
        self.pending_commands() == 0 && self.pending_results() == 0
    }
}

/// A panicking holder cannot leave a `VecDeque` half-updated, so poisoning
/// is ignored.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
