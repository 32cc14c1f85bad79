//! Link counters
//!
//! Shared between the session and its keep-alive thread, so every field is an
//! atomic and reads go through [`LinkStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one session and its keep-alive
#[derive(Debug, Default)]
pub struct LinkStats {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    crc_failures: AtomicU64,
    naks: AtomicU64,
    timeouts: AtomicU64,
    keep_alives: AtomicU64,
    keep_alive_failures: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames written, keep-alives included
    pub frames_sent: u64,
    /// Bytes written
    pub bytes_sent: u64,
    /// Bytes read back
    pub bytes_received: u64,
    /// ACK responses whose payload CRC did not match (retried as no response)
    pub crc_failures: u64,
    /// NAK responses
    pub naks: u64,
    /// Receive deadlines that expired, recovered or not
    pub timeouts: u64,
    /// Keep-alive probes the meter acknowledged
    pub keep_alives: u64,
    /// Keep-alive rounds that got no ACK
    pub keep_alive_failures: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl LinkStats {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        bump(&self.frames_sent, 1);
        bump(&self.bytes_sent, bytes as u64);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        bump(&self.bytes_received, bytes as u64);
    }

    pub(crate) fn record_crc_failure(&self) {
        bump(&self.crc_failures, 1);
    }

    pub(crate) fn record_nak(&self) {
        bump(&self.naks, 1);
    }

    pub(crate) fn record_timeout(&self) {
        bump(&self.timeouts, 1);
    }

    pub(crate) fn record_keep_alive(&self, ok: bool) {
        if ok {
            bump(&self.keep_alives, 1);
        } else {
            bump(&self.keep_alive_failures, 1);
        }
    }

    /// Copy out the current values
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_sent: get(&self.frames_sent),
            bytes_sent: get(&self.bytes_sent),
            bytes_received: get(&self.bytes_received),
            crc_failures: get(&self.crc_failures),
            naks: get(&self.naks),
            timeouts: get(&self.timeouts),
            keep_alives: get(&self.keep_alives),
            keep_alive_failures: get(&self.keep_alive_failures),
        }
    }
}
