//! Per-shard fault injection for failure-semantics testing.
//!
//! The in-memory connector consults a shared `ShardFaults` before opening a
//! connection and before every remote call, so a test can make one shard
//! slow, failing, unreachable or panicking while its siblings stay healthy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ddal_common::cancel::CancelToken;
use ddal_common::error::ShardError;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
enum Failure {
    Once(String),
    Always(String),
}

#[derive(Default)]
pub struct ShardFaults {
    delays: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashMap<String, Failure>>,
    refused: Mutex<HashSet<String>>,
    panics: Mutex<HashSet<String>>,
    /// Count of faults that have fired.
    faults_fired: AtomicU64,
}

impl ShardFaults {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Latency ──

    /// Every remote call on `shard` first waits `delay`, waking early on cancel.
    pub fn set_delay(&self, shard: &str, delay: Duration) {
        self.delays.lock().insert(shard.to_string(), delay);
    }

    pub fn delay(&self, shard: &str) -> Duration {
        self.delays.lock().get(shard).copied().unwrap_or(Duration::ZERO)
    }

    // ── Remote failures ──

    /// The next remote call on `shard` fails (one-shot).
    pub fn fail_next(&self, shard: &str, message: &str) {
        self.failures
            .lock()
            .insert(shard.to_string(), Failure::Once(message.to_string()));
    }

    /// Every remote call on `shard` fails until cleared.
    pub fn fail_always(&self, shard: &str, message: &str) {
        self.failures
            .lock()
            .insert(shard.to_string(), Failure::Always(message.to_string()));
    }

    /// Connection attempts to `shard` are refused.
    pub fn refuse_connections(&self, shard: &str) {
        self.refused.lock().insert(shard.to_string());
    }

    /// The next remote call on `shard` panics the executing thread.
    pub fn panic_next(&self, shard: &str) {
        self.panics.lock().insert(shard.to_string());
    }

    pub fn clear(&self, shard: &str) {
        self.delays.lock().remove(shard);
        self.failures.lock().remove(shard);
        self.refused.lock().remove(shard);
        self.panics.lock().remove(shard);
    }

    pub fn faults_fired(&self) -> u64 {
        self.faults_fired.load(Ordering::Relaxed)
    }

    // ── Hooks called by connectors ──

    pub fn check_connect(&self, shard: &str) -> Result<(), ShardError> {
        if self.refused.lock().contains(shard) {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
            return Err(ShardError::ConnectionRefused(shard.to_string()));
        }
        Ok(())
    }

    /// Apply armed faults ahead of a remote call on `shard`.
    pub fn before_call(&self, shard: &str, cancel: &CancelToken) -> Result<(), ShardError> {
        let delay = self.delay(shard);
        if !delay.is_zero() {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
            if cancel.wait_timeout(delay) {
                return Err(ShardError::Cancelled);
            }
        }
        if cancel.is_cancelled() {
            return Err(ShardError::Cancelled);
        }

        let failure = {
            let mut failures = self.failures.lock();
            match failures.get(shard).cloned() {
                Some(Failure::Once(msg)) => {
                    failures.remove(shard);
                    Some(msg)
                }
                Some(Failure::Always(msg)) => Some(msg),
                None => None,
            }
        };
        if let Some(msg) = failure {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
            return Err(ShardError::Remote(msg));
        }

        if self.panics.lock().remove(shard) {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
            panic!("injected panic on shard {}", shard);
        }
        Ok(())
    }
}
