//! The progress step: the only place envelopes move.
//!
//! One step drains what is available right now (self-sends queued before the
//! step started, then up to [`PACKETS_PER_STEP`] transport packets), runs each envelope's
//! handler in delivery order, and finally flushes send buffers. Handlers may
//! enqueue new envelopes while the step runs; those become eligible for the
//! flush at the end of the same step. A step never waits for new work.
//!
//! Inside a handler a nested step only flushes, so handlers never nest.

use minstant::Instant;

use super::{Comm, CommError, Flush};
use crate::dispatch::DispatchError;
use crate::trace::trace;
use crate::transport::Rank;
use crate::wire::{Batch, UnpackingIter};

/// Packets received per step. A peer that keeps sending cannot hold one step
/// open; the rest wait for the next step.
pub(crate) const PACKETS_PER_STEP: usize = 64;

impl<S> Comm<S> {
    /// Runs one step. Returns the number of handlers executed.
    pub(crate) fn step(&self, flush: Flush) -> Result<usize, CommError> {
        if self.in_handler() {
            self.flush_buffers(flush)?;
            return Ok(0);
        }
        let mut handled = self.drain_local()?;
        handled += self.drain_transport()?;
        self.flush_buffers(flush)?;
        Ok(handled)
    }

    fn drain_local(&self) -> Result<usize, CommError> {
        let pending = self.local.borrow().len();
        let mut handled = 0;
        for _ in 0..pending {
            let Some(envelope) = self.local.borrow_mut().pop_front() else {
                break;
            };
            handled += self.deliver(self.rank, &envelope)?;
        }
        Ok(handled)
    }

    fn drain_transport(&self) -> Result<usize, CommError> {
        let mut handled = 0;
        for _ in 0..PACKETS_PER_STEP {
            let next = self.transport_mut().try_recv()?;
            let Some((src, packet)) = next else {
                break;
            };
            self.stats.record(|s| {
                s.packets_received += 1;
                s.bytes_received += packet.len() as u64;
            });
            trace!(rank = self.rank, src, bytes = packet.len(), "received packet");
            handled += self.deliver(src, &packet)?;
        }
        Ok(handled)
    }

    /// Runs every envelope of `packet` in order.
    fn deliver(&self, src: Rank, packet: &[u8]) -> Result<usize, CommError> {
        let mut handled = 0;
        for envelope in UnpackingIter::new(packet) {
            let envelope = envelope.map_err(|e| CommError::Dispatch {
                src,
                source: DispatchError::from(e),
            })?;

            let mut state = self
                .state
                .try_borrow_mut()
                .map_err(|_| CommError::StateBorrowed)?;
            self.depth.set(self.depth.get() + 1);
            let result = self.table.invoke(self, &mut state, envelope);
            self.depth.set(self.depth.get() - 1);
            drop(state);

            result.map_err(|source| CommError::Dispatch { src, source })?;
            self.counters.note_received();
            self.stats.record(|s| s.rpc_count += 1);
            handled += 1;
        }
        Ok(handled)
    }

    /// Sends every buffer whose trigger fired, or every non-empty buffer when forced.
    pub(crate) fn flush_buffers(&self, flush: Flush) -> Result<(), CommError> {
        let now = Instant::now();
        let interval = self.config.flush_interval;
        let mut buffers = self.buffers.borrow_mut();
        for (dest, buffer) in buffers.iter_mut().enumerate() {
            let due = match flush {
                Flush::Forced => !buffer.is_empty(),
                Flush::Due => buffer.is_due(now, interval),
            };
            if due && let Some(batch) = buffer.take() {
                self.send_batch(dest, batch)?;
            }
        }
        Ok(())
    }

    pub(crate) fn send_batch(&self, dest: Rank, batch: Batch) -> Result<(), CommError> {
        trace!(
            rank = self.rank,
            dest,
            envelopes = batch.envelopes,
            bytes = batch.bytes.len(),
            "flushing batch"
        );
        self.transport_mut().send(dest, batch.bytes)?;
        self.counters.note_sent(batch.envelopes);
        self.stats.record(|s| s.packets_sent += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::Transport;
    use crate::wire::encode_envelope;
    use crate::{Config, LocalWorld, Registry};

    #[test]
    fn step_receives_a_bounded_number_of_packets() {
        let mut registry = Registry::<usize>::new();
        let count = registry.register("count", |_comm, n: &mut usize, _: ()| *n += 1);
        let table = registry.freeze();

        let mut transport = LocalWorld::new(1).transports().remove(0);
        let mut packet = Vec::new();
        encode_envelope(count.id(), &(), &mut packet).unwrap();
        for _ in 0..3 * PACKETS_PER_STEP {
            transport.send(0, packet.clone()).unwrap();
        }

        let comm = Comm::new(transport, Arc::clone(&table), 0, Config::default()).unwrap();
        comm.progress();
        assert_eq!(comm.with_state(|n| *n), PACKETS_PER_STEP);
        comm.progress();
        assert_eq!(comm.with_state(|n| *n), 2 * PACKETS_PER_STEP);
    }
}
