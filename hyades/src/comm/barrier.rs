//! Quiescence detection.
//!
//! A barrier repeats rounds of: forced progress step, then an all-gather of
//! every rank's `(sent, received, active)` triple, where `sent` and `received`
//! are the rank's lifetime envelope counters and `active` says whether they
//! moved since the rank's previous contribution. The gathered triples are
//! summed into a [`RoundTally`] and the phase advances:
//!
//! ```text
//!                 sent != received
//!   +--------+ <------------------- +--------------------+
//!   | Active |                      | ProvisionallyQuiet |
//!   +--------+ -------------------> +--------------------+
//!       |       balanced, some rank           |
//!       |       still moved                   | balanced, nobody moved
//!       |                                     v
//!       |    balanced, nobody moved     +-----------+
//!       +-----------------------------> | Quiescent |
//!                                       +-----------+
//! ```
//!
//! "Nobody moved" means every rank's counters are unchanged since the previous
//! round, so the previous reading and this one are identical and balanced:
//! nothing was in flight at the moment the previous round completed and
//! nothing has happened since. The previous contribution carries over from the
//! last barrier, so a barrier entered with no pending work finishes in one
//! round. Every rank sees the same tally and leaves in the same round.

use std::cell::Cell;

use serde::{Deserialize, Serialize};

use super::{Comm, CommError, Flush};
use crate::trace::{debug, trace};
use crate::transport::decode_gathered;
use crate::wire;

/// Where a barrier stands after a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    /// Envelopes are in flight.
    Active,
    /// Counts balance but some rank did work since its last reading.
    ProvisionallyQuiet,
    /// Two identical balanced readings: nothing is in flight anywhere.
    Quiescent,
}

impl BarrierPhase {
    /// Next phase given the tally of the round that just completed.
    #[must_use]
    pub const fn advance(self, tally: RoundTally) -> Self {
        match self {
            Self::Quiescent => Self::Quiescent,
            Self::Active | Self::ProvisionallyQuiet => {
                if tally.sent != tally.received {
                    Self::Active
                } else if tally.active_ranks > 0 {
                    Self::ProvisionallyQuiet
                } else {
                    Self::Quiescent
                }
            }
        }
    }
}

/// One rank's reading for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Reading {
    pub(crate) sent: u64,
    pub(crate) received: u64,
    pub(crate) active: bool,
}

/// Global sums over one round's readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundTally {
    pub sent: u64,
    pub received: u64,
    pub active_ranks: u64,
}

impl RoundTally {
    pub(crate) fn from_readings(readings: &[Reading]) -> Self {
        readings.iter().fold(Self::default(), |tally, reading| Self {
            sent: tally.sent + reading.sent,
            received: tally.received + reading.received,
            active_ranks: tally.active_ranks + u64::from(reading.active),
        })
    }
}

/// Envelope counters used only for quiescence. Never reset.
#[derive(Debug, Default)]
pub(crate) struct ProtocolCounters {
    sent: Cell<u64>,
    received: Cell<u64>,
    /// `(sent, received)` at this rank's previous reading.
    last_reading: Cell<(u64, u64)>,
}

impl ProtocolCounters {
    #[inline]
    pub(crate) fn note_sent(&self, envelopes: usize) {
        self.sent.set(self.sent.get() + envelopes as u64);
    }

    #[inline]
    pub(crate) fn note_received(&self) {
        self.received.set(self.received.get() + 1);
    }

    /// Takes a reading and makes it the baseline for the next one.
    pub(crate) fn read(&self) -> Reading {
        let now = (self.sent.get(), self.received.get());
        let active = now != self.last_reading.replace(now);
        Reading {
            sent: now.0,
            received: now.1,
            active,
        }
    }
}

#[derive(Clone, Copy)]
enum Wait {
    Blocking,
    Overlapped,
}

impl<S> Comm<S> {
    /// Blocks until every envelope sent anywhere before or during the barrier
    /// has been delivered, including envelopes sent by handlers.
    ///
    /// Collective: every rank must call it.
    pub fn barrier(&self) {
        let result = self.quiesce(Wait::Blocking);
        self.check(result);
    }

    /// Like [`Comm::barrier`], but keeps servicing incoming envelopes while
    /// waiting for the other ranks, so peers still issuing work before they
    /// enter the barrier see their calls handled right away.
    pub fn cf_barrier(&self) {
        let result = self.quiesce(Wait::Overlapped);
        self.check(result);
    }

    fn quiesce(&self, wait: Wait) -> Result<(), CommError> {
        self.ensure_outside_handler("barrier")?;
        let mut phase = BarrierPhase::Active;
        let mut round = 0u64;
        while phase != BarrierPhase::Quiescent {
            round += 1;
            self.step(Flush::Forced)?;
            let reading = self.counters.read();
            let contribution = wire::to_bytes(&reading)?;

            let gathered = match wait {
                Wait::Blocking => self.transport_mut().all_gather(contribution)?,
                Wait::Overlapped => self.overlapped_gather(contribution)?,
            };
            let tally = RoundTally::from_readings(&decode_gathered::<Reading>(&gathered, self.size)?);
            phase = phase.advance(tally);
            trace!(
                rank = self.rank,
                round,
                sent = tally.sent,
                received = tally.received,
                active_ranks = tally.active_ranks,
                ?phase,
                "barrier round"
            );
        }
        self.stats.record(|s| {
            s.barriers += 1;
            s.barrier_rounds += round;
        });
        debug!(rank = self.rank, rounds = round, "barrier complete");
        debug_assert!(self.buffers_empty());
        Ok(())
    }

    fn overlapped_gather(&self, contribution: Vec<u8>) -> Result<Vec<Vec<u8>>, CommError> {
        self.transport_mut().start_all_gather(contribution)?;
        loop {
            if let Some(gathered) = self.transport_mut().poll_all_gather()? {
                return Ok(gathered);
            }
            // Replies from handlers run here go out now: their sender may be
            // waiting on them before it can join the gather.
            if self.step(Flush::Due)? > 0 {
                self.flush_buffers(Flush::Forced)?;
            } else {
                std::thread::yield_now();
            }
        }
    }
}
