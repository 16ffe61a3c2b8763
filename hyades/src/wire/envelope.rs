//! Envelope framing: one handler invocation on the wire.
//!
//! ## Wire Format
//!
//! All multi-byte integers are little-endian.
//!
//! | Field   | Layout |
//! |---------|--------|
//! | header  | `[handler:4][len:4]` |
//! | payload | `[postcard bytes:len]` |
//!
//! Envelopes are concatenated with no padding inside a batch (see
//! [`crate::wire::packing`]). The payload is the postcard encoding of the
//! handler's argument type, so tuples, containers and `Option`s nest naturally.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Wire;

/// Bytes taken by the envelope header.
pub const HEADER_LEN: usize = 8;

/// Index of a handler in the frozen dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(pub u32);

impl From<u32> for HandlerId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<HandlerId> for u32 {
    fn from(id: HandlerId) -> Self {
        id.0
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors during envelope encode/decode.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Input too short to hold an envelope header.
    #[error("truncated envelope header: {available} of {HEADER_LEN} bytes")]
    TruncatedHeader { available: usize },
    /// Header announces more payload than the packet carries.
    #[error("envelope payload length {declared} exceeds remaining {available} bytes")]
    TruncatedPayload { declared: usize, available: usize },
    /// Payload does not fit the 32-bit length field.
    #[error("envelope payload of {0} bytes is too large")]
    TooLarge(usize),
    /// Serialization or deserialization of the arguments failed.
    #[error("argument codec error: {0}")]
    Codec(#[from] postcard::Error),
    /// Arguments decoded but left bytes unread.
    #[error("{0} trailing bytes after arguments")]
    TrailingBytes(usize),
}

/// A decoded envelope borrowing its payload from the received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEnvelope<'a> {
    pub handler: HandlerId,
    pub payload: &'a [u8],
}

impl RawEnvelope<'_> {
    /// Size of the envelope on the wire.
    #[inline]
    #[must_use]
    pub const fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Decodes the payload as `T`, rejecting trailing bytes.
    ///
    /// # Errors
    /// [`EnvelopeError::Codec`] if the bytes are not a `T`,
    /// [`EnvelopeError::TrailingBytes`] if a `T` decodes from a prefix only.
    pub fn decode_args<T: Wire>(&self) -> Result<T, EnvelopeError> {
        let (value, rest) = postcard::take_from_bytes::<T>(self.payload)?;
        if !rest.is_empty() {
            return Err(EnvelopeError::TrailingBytes(rest.len()));
        }
        Ok(value)
    }
}

/// Encode an envelope for `handler` carrying `args` into `buf`.
///
/// `buf` is cleared first; callers keep one scratch buffer per communicator so
/// the allocation is reused (`Vec::clear()` preserves capacity).
///
/// # Errors
/// [`EnvelopeError::Codec`] if `args` cannot be serialized,
/// [`EnvelopeError::TooLarge`] if the payload exceeds `u32::MAX` bytes.
pub fn encode_envelope<T: Wire>(
    handler: HandlerId,
    args: &T,
    buf: &mut Vec<u8>,
) -> Result<usize, EnvelopeError> {
    buf.clear();
    buf.extend_from_slice(&handler.0.to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);

    *buf = postcard::to_extend(args, std::mem::take(buf))?;

    let payload_len = buf.len() - HEADER_LEN;
    let len = u32::try_from(payload_len).map_err(|_| EnvelopeError::TooLarge(payload_len))?;
    buf[4..HEADER_LEN].copy_from_slice(&len.to_le_bytes());
    Ok(buf.len())
}

/// Decode the envelope at the start of `bytes`.
///
/// Returns the envelope and the number of bytes it occupies so callers can
/// walk a batch.
///
/// # Errors
/// [`EnvelopeError::TruncatedHeader`] or [`EnvelopeError::TruncatedPayload`]
/// when `bytes` ends mid-envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<(RawEnvelope<'_>, usize), EnvelopeError> {
    if bytes.len() < HEADER_LEN {
        return Err(EnvelopeError::TruncatedHeader {
            available: bytes.len(),
        });
    }
    let handler = HandlerId(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
    let declared = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

    let available = bytes.len() - HEADER_LEN;
    if declared > available {
        return Err(EnvelopeError::TruncatedPayload {
            declared,
            available,
        });
    }
    let payload = &bytes[HEADER_LEN..HEADER_LEN + declared];
    Ok((RawEnvelope { handler, payload }, HEADER_LEN + declared))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        key: String,
        weight: f64,
        tags: Vec<u16>,
        parent: Option<u64>,
    }

    #[test]
    fn nested_arguments_survive_encoding() {
        let sample = Sample {
            key: "elderberry".into(),
            weight: -0.0,
            tags: vec![3, 1, 4, 1, 5],
            parent: None,
        };
        let mut buf = Vec::new();
        let len = encode_envelope(HandlerId(7), &sample, &mut buf).unwrap();
        assert_eq!(len, buf.len());

        let (env, used) = decode_envelope(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(env.handler, HandlerId(7));
        assert_eq!(env.wire_len(), buf.len());

        let decoded: Sample = env.decode_args().unwrap();
        assert_eq!(decoded, sample);
        assert!(decoded.weight.is_sign_negative());
    }

    #[test]
    fn header_layout_is_little_endian() {
        let mut buf = Vec::new();
        encode_envelope(HandlerId(0x0102_0304), &0xABu8, &mut buf).unwrap();
        assert_eq!(&buf[..HEADER_LEN], &[4, 3, 2, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn unit_arguments_have_empty_payload() {
        let mut buf = Vec::new();
        encode_envelope(HandlerId(1), &(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);

        let (env, _) = decode_envelope(&buf).unwrap();
        env.decode_args::<()>().unwrap();
    }

    #[test]
    fn encode_reuses_buffer_capacity() {
        let mut buf = Vec::with_capacity(1024);
        encode_envelope(HandlerId(1), &(1u32, 2u32), &mut buf).unwrap();
        encode_envelope(HandlerId(1), &(1u32, 2u32), &mut buf).unwrap();
        assert!(buf.capacity() >= 1024);
        assert_eq!(buf.len(), HEADER_LEN + 2);
    }

    #[test]
    fn decode_truncated_header() {
        let result = decode_envelope(&[1, 0, 0]);
        assert!(matches!(
            result,
            Err(EnvelopeError::TruncatedHeader { available: 3 })
        ));
    }

    #[test]
    fn decode_truncated_payload() {
        let mut buf = Vec::new();
        encode_envelope(HandlerId(2), &String::from("payload"), &mut buf).unwrap();
        buf.truncate(buf.len() - 2);

        assert!(matches!(
            decode_envelope(&buf),
            Err(EnvelopeError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn wrong_argument_type_is_rejected() {
        let mut buf = Vec::new();
        encode_envelope(HandlerId(3), &(0xFFu8, 0xFFu8, 0xFFu8), &mut buf).unwrap();
        let (env, _) = decode_envelope(&buf).unwrap();

        assert!(matches!(
            env.decode_args::<u8>(),
            Err(EnvelopeError::TrailingBytes(2))
        ));
        assert!(matches!(
            env.decode_args::<bool>(),
            Err(EnvelopeError::Codec(_))
        ));
    }
}
