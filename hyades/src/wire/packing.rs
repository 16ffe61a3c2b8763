//! Envelope batching for per-destination sends.
//!
//! # Problem
//! One transport send per async call caps throughput at the transport's
//! per-message rate and wastes a header per call.
//!
//! # Solution
//! Concatenate encoded envelopes into batches of at most `capacity` bytes and
//! hand each batch to the transport as a single packet. The receiver walks the
//! packet with [`UnpackingIter`].
//!
//! # Design
//! - `PackingBuffer`: accumulates encoded envelopes for one destination
//! - `UnpackingIter`: iterates over the envelopes of a received packet

use super::envelope::{EnvelopeError, HEADER_LEN, RawEnvelope, decode_envelope};

/// Typical envelope size for the "buffer nearly full" heuristic.
/// Header (8) plus a couple of small integer arguments.
const TYPICAL_ENVELOPE_SIZE: usize = 32;

/// Accumulates encoded envelopes into one outgoing packet.
///
/// # Usage
/// ```ignore
/// let mut packer = PackingBuffer::new(64 * 1024);
///
/// if !packer.can_fit(envelope.len()) {
///     transport.send(dest, packer.take().unwrap())?;
/// }
/// packer.push(&envelope);
/// if packer.is_full() {
///     transport.send(dest, packer.take().unwrap())?;
/// }
/// ```
#[derive(Debug)]
pub struct PackingBuffer {
    /// The buffer accumulating envelopes
    buffer: Vec<u8>,
    /// Maximum batch size in bytes
    capacity: usize,
    /// Number of envelopes in current buffer
    envelope_count: usize,
}

impl PackingBuffer {
    /// Create a new packing buffer holding batches of up to `capacity` bytes.
    ///
    /// The backing allocation grows on demand, so idle destinations cost nothing.
    #[inline]
    pub const fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::new(),
            capacity,
            envelope_count: 0,
        }
    }

    /// Returns the batch capacity in bytes.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the current buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns true if the buffer can't fit a typical envelope.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.remaining() < TYPICAL_ENVELOPE_SIZE
    }

    /// Returns the number of envelopes in the buffer.
    #[inline]
    pub fn envelope_count(&self) -> usize {
        self.envelope_count
    }

    /// Returns remaining capacity before the batch limit is reached.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    /// Check if an envelope of given size would fit.
    #[inline]
    pub fn can_fit(&self, envelope_len: usize) -> bool {
        self.buffer.len() + envelope_len <= self.capacity
    }

    /// Push an encoded envelope into the buffer.
    ///
    /// Returns `true` if the envelope was added, `false` if it doesn't fit.
    /// An envelope larger than the capacity is accepted into an empty buffer,
    /// so oversized calls travel alone instead of being refused.
    #[inline]
    pub fn push(&mut self, envelope: &[u8]) -> bool {
        if !self.is_empty() && !self.can_fit(envelope.len()) {
            return false;
        }
        self.buffer.extend_from_slice(envelope);
        self.envelope_count += 1;
        true
    }

    /// Take the batch, leaving the buffer empty.
    /// Returns `None` if buffer is empty.
    #[inline]
    pub fn take(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.buffer);
        let envelopes = std::mem::take(&mut self.envelope_count);
        Some(Batch { bytes, envelopes })
    }
}

/// A sealed batch ready for the transport.
#[derive(Debug, PartialEq, Eq)]
pub struct Batch {
    /// Concatenated envelopes.
    pub bytes: Vec<u8>,
    /// Number of envelopes in `bytes`.
    pub envelopes: usize,
}

/// Iterator over envelopes packed in a received packet.
///
/// Yields `Err` once if the packet ends mid-envelope and stops afterwards: a
/// torn batch is a protocol violation, not something to skip over.
///
/// # Usage
/// ```ignore
/// for envelope in UnpackingIter::new(&packet) {
///     table.invoke(comm, state, envelope?)?;
/// }
/// ```
pub struct UnpackingIter<'a> {
    data: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> UnpackingIter<'a> {
    /// Create iterator over packed envelopes.
    #[inline]
    pub const fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            cursor: 0,
            failed: false,
        }
    }

    /// Remaining bytes not yet parsed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.cursor)
    }
}

impl<'a> Iterator for UnpackingIter<'a> {
    type Item = Result<RawEnvelope<'a>, EnvelopeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining() == 0 {
            return None;
        }
        match decode_envelope(&self.data[self.cursor..]) {
            Ok((envelope, used)) => {
                self.cursor += used;
                Some(Ok(envelope))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining() / HEADER_LEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::envelope::{HandlerId, encode_envelope};

    fn envelope(handler: u32, value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_envelope(HandlerId(handler), &value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn batch_counts_whole_envelopes() {
        let first = envelope(3, 1);
        let second = envelope(4, u64::MAX);
        let mut packer = PackingBuffer::new(first.len() + second.len());

        assert!(packer.push(&first));
        assert!(packer.push(&second));
        assert_eq!(packer.envelope_count(), 2);
        assert_eq!(packer.remaining(), 0);

        // Payloads are varints, so a large value takes more bytes.
        assert!(second.len() > first.len());
        let batch = packer.take().unwrap();
        assert_eq!(batch.bytes, [first, second].concat());
    }

    #[test]
    fn envelope_that_would_split_starts_next_batch() {
        let small = envelope(0, 7);
        let mut packer = PackingBuffer::new(small.len() * 2 + 1);

        assert!(packer.push(&small));
        assert!(packer.push(&small));
        // One spare byte: never enough for a header, so the envelope is refused whole.
        assert!(!packer.push(&small));
        assert_eq!(packer.envelope_count(), 2);

        let sealed = packer.take().unwrap();
        assert_eq!(UnpackingIter::new(&sealed.bytes).count(), 2);
        assert!(packer.push(&small));
        assert_eq!(packer.envelope_count(), 1);
    }

    #[test]
    fn take_releases_the_allocation() {
        let mut packer = PackingBuffer::new(1 << 20);
        packer.push(&envelope(1, 2));
        packer.take().unwrap();
        assert_eq!(packer.buffer.capacity(), 0);
    }

    #[test]
    fn oversized_envelope_travels_alone() {
        let mut packer = PackingBuffer::new(64);

        assert!(packer.push(&[7u8; 200]));
        assert!(packer.is_full());
        assert!(!packer.push(&[7u8; 8]));

        let batch = packer.take().unwrap();
        assert_eq!(batch.bytes.len(), 200);
        assert_eq!(batch.envelopes, 1);
    }

    #[test]
    fn take_empties_buffer() {
        let mut packer = PackingBuffer::new(1024);
        assert!(packer.take().is_none());

        packer.push(&[42u8; 100]);
        let batch = packer.take().unwrap();
        assert_eq!(batch.bytes.len(), 100);
        assert_eq!(batch.bytes[0], 42);
        assert_eq!(batch.envelopes, 1);

        assert!(packer.is_empty());
        assert_eq!(packer.envelope_count(), 0);
        assert!(packer.take().is_none());
    }

    #[test]
    fn full_heuristic() {
        let mut packer = PackingBuffer::new(128);
        packer.push(&[0u8; 90]);
        assert!(!packer.is_full());
        packer.push(&[0u8; 10]);
        assert!(packer.is_full());
    }

    #[test]
    fn unpacking_preserves_order() {
        let mut packer = PackingBuffer::new(4096);
        for i in 0..10u64 {
            assert!(packer.push(&envelope(i as u32, i * 1000)));
        }
        let batch = packer.take().unwrap();

        let decoded: Vec<(u32, u64)> = UnpackingIter::new(&batch.bytes)
            .map(|env| {
                let env = env.unwrap();
                (env.handler.0, env.decode_args::<u64>().unwrap())
            })
            .collect();

        let expected: Vec<(u32, u64)> = (0..10u64).map(|i| (i as u32, i * 1000)).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn unpacking_empty_packet() {
        assert!(UnpackingIter::new(&[]).next().is_none());
    }

    #[test]
    fn unpacking_torn_packet_reports_once() {
        let mut packet = envelope(1, 5);
        packet.extend_from_slice(&envelope(2, 6)[..5]);

        let mut iter = UnpackingIter::new(&packet);
        assert!(iter.next().unwrap().is_ok());
        assert!(matches!(
            iter.next(),
            Some(Err(EnvelopeError::TruncatedHeader { available: 5 }))
        ));
        assert!(iter.next().is_none());
    }
}
