//! Wire formats: envelopes, batches and cell values.

pub mod envelope;
pub mod packing;
pub mod value;

use serde::{Deserialize, Serialize};

pub use envelope::{EnvelopeError, HEADER_LEN, HandlerId, RawEnvelope, decode_envelope, encode_envelope};
pub use packing::{Batch, PackingBuffer, UnpackingIter};
pub use value::{Row, Value, ValueKind};

/// Marker trait for types that can travel as handler arguments or collective
/// contributions.
///
/// Automatically implemented for all `Serialize + Deserialize` types.
pub trait Wire: Serialize + for<'de> Deserialize<'de> {}
impl<T> Wire for T where T: Serialize + for<'de> Deserialize<'de> {}

/// Serialize a value with the crate's wire codec.
///
/// # Errors
/// Returns the codec error if `value` cannot be serialized.
pub fn to_bytes<T: Wire>(value: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(value)
}

/// Deserialize a value produced by [`to_bytes`].
///
/// # Errors
/// Returns the codec error if `bytes` are not a `T`.
pub fn from_bytes<T: Wire>(bytes: &[u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(bytes)
}
