//! Per-rank traffic counters.
//!
//! Updated only from the rank's own execution context, so plain `Cell`s
//! suffice. These counters are informational: quiescence detection keeps its
//! own counters, and resetting these never affects a barrier.

use std::cell::Cell;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Snapshot of one rank's counters since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Async calls issued by this rank, self-sends included.
    pub async_count: u64,
    /// Handlers executed on this rank.
    pub rpc_count: u64,
    /// Envelope bytes enqueued by this rank.
    pub bytes_sent: u64,
    /// Batches handed to the transport.
    pub packets_sent: u64,
    /// Batches taken from the transport.
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Completed barriers.
    pub barriers: u64,
    /// Reduction rounds spent in those barriers.
    pub barrier_rounds: u64,
}

impl Stats {
    #[must_use]
    pub const fn async_count(&self) -> u64 {
        self.async_count
    }

    #[must_use]
    pub const fn rpc_count(&self) -> u64 {
        self.rpc_count
    }

    #[must_use]
    pub const fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    #[must_use]
    pub const fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    #[must_use]
    pub const fn barriers(&self) -> u64 {
        self.barriers
    }

    #[must_use]
    pub const fn barrier_rounds(&self) -> u64 {
        self.barrier_rounds
    }

    /// Field-wise sum, e.g. to total the snapshots of every rank.
    #[must_use]
    pub const fn merge(&self, other: &Self) -> Self {
        Self {
            async_count: self.async_count + other.async_count,
            rpc_count: self.rpc_count + other.rpc_count,
            bytes_sent: self.bytes_sent + other.bytes_sent,
            packets_sent: self.packets_sent + other.packets_sent,
            packets_received: self.packets_received + other.packets_received,
            bytes_received: self.bytes_received + other.bytes_received,
            barriers: self.barriers + other.barriers,
            barrier_rounds: self.barrier_rounds + other.barrier_rounds,
        }
    }

    /// Average envelopes per transport packet, if anything was sent.
    #[must_use]
    pub fn envelopes_per_packet(&self) -> Option<f64> {
        (self.packets_sent > 0).then(|| self.async_count as f64 / self.packets_sent as f64)
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "async={} rpc={} sent={}B/{}pkt recv={}B/{}pkt barriers={} rounds={}",
            self.async_count,
            self.rpc_count,
            self.bytes_sent,
            self.packets_sent,
            self.bytes_received,
            self.packets_received,
            self.barriers,
            self.barrier_rounds,
        )
    }
}

/// Interior-mutable holder for a rank's [`Stats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCell(Cell<Stats>);

impl StatsCell {
    #[inline]
    pub(crate) fn record(&self, f: impl FnOnce(&mut Stats)) {
        let mut stats = self.0.get();
        f(&mut stats);
        self.0.set(stats);
    }

    #[inline]
    pub(crate) fn snapshot(&self) -> Stats {
        self.0.get()
    }

    pub(crate) fn reset(&self) {
        self.0.set(Stats::default());
    }
}
