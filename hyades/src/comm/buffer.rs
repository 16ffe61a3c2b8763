//! Per-destination send buffers.

use std::time::Duration;

use minstant::Instant;

use crate::wire::{Batch, PackingBuffer};

/// Pending envelopes for one remote rank.
///
/// Tracks when the oldest pending envelope arrived so the progress engine can
/// flush a buffer that has waited longer than the flush interval.
#[derive(Debug)]
pub(crate) struct SendBuffer {
    packer: PackingBuffer,
    opened_at: Option<Instant>,
}

impl SendBuffer {
    pub(crate) const fn new(capacity: usize) -> Self {
        Self {
            packer: PackingBuffer::new(capacity),
            opened_at: None,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.packer.is_empty()
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.packer.is_full()
    }

    #[cfg(test)]
    fn envelope_count(&self) -> usize {
        self.packer.envelope_count()
    }

    /// Appends an encoded envelope.
    ///
    /// If it does not fit, the current contents are sealed and returned; they
    /// must be sent before this buffer's next batch to keep FIFO order.
    pub(crate) fn enqueue(&mut self, envelope: &[u8]) -> Option<Batch> {
        let mut sealed = None;
        if !self.packer.push(envelope) {
            sealed = self.take();
            // An empty packer accepts anything.
            let pushed = self.packer.push(envelope);
            debug_assert!(pushed);
        }
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        sealed
    }

    /// True if the buffer is full or has held data for at least `interval`.
    pub(crate) fn is_due(&self, now: Instant, interval: Option<Duration>) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.is_full() {
            return true;
        }
        match (interval, self.opened_at) {
            (Some(interval), Some(opened)) => now.duration_since(opened) >= interval,
            _ => false,
        }
    }

    pub(crate) fn take(&mut self) -> Option<Batch> {
        self.opened_at = None;
        self.packer.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_seals_previous_batch() {
        let mut buffer = SendBuffer::new(64);
        assert!(buffer.enqueue(&[1; 40]).is_none());
        let sealed = buffer.enqueue(&[2; 40]).unwrap();
        assert_eq!(sealed.bytes, vec![1; 40]);
        assert_eq!(sealed.envelopes, 1);
        assert_eq!(buffer.envelope_count(), 1);

        let rest = buffer.take().unwrap();
        assert_eq!(rest.bytes, vec![2; 40]);
        assert!(buffer.is_empty());
        assert!(buffer.take().is_none());
    }

    #[test]
    fn oversized_envelope_travels_alone() {
        let mut buffer = SendBuffer::new(16);
        assert!(buffer.enqueue(&[7; 100]).is_none());
        assert!(buffer.is_due(Instant::now(), None));
        assert_eq!(buffer.take().unwrap().bytes.len(), 100);
    }

    #[test]
    fn age_trigger() {
        let mut buffer = SendBuffer::new(1024);
        let now = Instant::now();
        assert!(!buffer.is_due(now, Some(Duration::ZERO)));

        buffer.enqueue(&[0; 8]);
        assert!(!buffer.is_due(Instant::now(), None));
        assert!(!buffer.is_due(Instant::now(), Some(Duration::from_secs(3600))));
        assert!(buffer.is_due(Instant::now(), Some(Duration::ZERO)));

        buffer.take();
        assert!(!buffer.is_due(Instant::now(), Some(Duration::ZERO)));
    }
}
