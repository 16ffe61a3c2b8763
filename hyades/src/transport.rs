//! Transport adapter: raw packets and collectives between ranks.
//!
//! A transport moves opaque byte packets between the `size()` ranks of a fixed
//! group and provides one collective primitive, an all-gather. Everything above
//! (envelopes, batching, quiescence) is built on these few calls.
//!
//! # Contract
//!
//! - `send` hands a packet off and returns without waiting for the receiver.
//!   Packets from one source to one destination arrive in send order.
//! - `try_recv` never blocks.
//! - Collectives must be entered by every rank in the same order. At most one
//!   collective is outstanding per rank; the split `start_all_gather` /
//!   `poll_all_gather` form lets callers keep working while it completes.
//! - Errors are fatal to the group. No layer above retries.
//!
//! Implementations:
//! - [`local::LocalWorld`] - every rank is a thread of the current process
//! - [`tcp::TcpTransport`] - every rank is a process; full TCP mesh

pub mod local;
pub mod tcp;

use thiserror::Error;

use crate::net::Endpoint;
use crate::wire::{self, Wire};

/// Index of a participant in the group, in `0..size`.
pub type Rank = usize;

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Destination outside `0..size`.
    #[error("rank {rank} out of range for group of {size}")]
    RankOutOfRange { rank: Rank, size: usize },
    /// Another rank failed; the group cannot make collective progress.
    #[error("rank {0} failed")]
    PeerFailed(Rank),
    /// A peer's connection closed while it was still needed.
    #[error("connection to rank {0} closed")]
    Disconnected(Rank),
    /// `start_all_gather` called while a collective is still outstanding.
    #[error("a collective is already in flight")]
    CollectiveInFlight,
    /// `poll_all_gather` called without a started collective.
    #[error("no collective in flight")]
    NoCollective,
    /// A collective result did not carry one contribution per rank.
    #[error("collective returned {got} contributions, expected {expected}")]
    GatherSize { expected: usize, got: usize },
    /// Could not reach a peer during bootstrap.
    #[error("timed out connecting to rank {rank} at {endpoint}")]
    ConnectTimeout { rank: Rank, endpoint: Endpoint },
    /// Rank table or rank id missing or invalid.
    #[error("invalid transport configuration: {0}")]
    Config(String),
    /// Bootstrap handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Peer sent a frame this transport does not understand.
    #[error("malformed frame from rank {rank}: {reason}")]
    MalformedFrame { rank: Rank, reason: &'static str },
    /// Contribution or result codec failure.
    #[error("collective codec error: {0}")]
    Codec(#[from] postcard::Error),
    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-to-point packets plus an all-gather collective over a fixed group.
pub trait Transport: Send {
    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Hands `packet` to the transport for delivery to `dest`.
    fn send(&mut self, dest: Rank, packet: Vec<u8>) -> Result<(), TransportError>;

    /// Returns the next available packet and its source, if any.
    fn try_recv(&mut self) -> Result<Option<(Rank, Vec<u8>)>, TransportError>;

    /// Starts an all-gather of `contribution`.
    fn start_all_gather(&mut self, contribution: Vec<u8>) -> Result<(), TransportError>;

    /// Completes the outstanding all-gather if every rank has contributed.
    ///
    /// Returns one contribution per rank, indexed by rank, identical on every rank.
    fn poll_all_gather(&mut self) -> Result<Option<Vec<Vec<u8>>>, TransportError>;

    /// Blocking all-gather.
    fn all_gather(&mut self, contribution: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
        self.start_all_gather(contribution)?;
        loop {
            if let Some(all) = self.poll_all_gather()? {
                return Ok(all);
            }
            std::thread::yield_now();
        }
    }
}

/// Decodes a gathered set of contributions, checking there is one per rank.
///
/// # Errors
/// [`TransportError::GatherSize`] on a short result,
/// [`TransportError::Codec`] if a contribution is not a `T`.
pub fn decode_gathered<T: Wire>(
    gathered: &[Vec<u8>],
    size: usize,
) -> Result<Vec<T>, TransportError> {
    if gathered.len() != size {
        return Err(TransportError::GatherSize {
            expected: size,
            got: gathered.len(),
        });
    }
    gathered
        .iter()
        .map(|bytes| wire::from_bytes(bytes).map_err(TransportError::from))
        .collect()
}

/// Blocking all-reduce over the transport's all-gather.
///
/// Contributions are folded in rank order, so every rank computes the same
/// result even for non-commutative or floating point `op`s.
///
/// # Errors
/// Propagates transport and codec errors.
pub fn all_reduce<T, F>(
    transport: &mut dyn Transport,
    value: &T,
    op: F,
) -> Result<T, TransportError>
where
    T: Wire,
    F: Fn(T, T) -> T,
{
    let size = transport.size();
    let gathered = transport.all_gather(wire::to_bytes(value)?)?;
    fold_in_rank_order(decode_gathered(&gathered, size)?, op)
}

pub(crate) fn fold_in_rank_order<T, F>(values: Vec<T>, op: F) -> Result<T, TransportError>
where
    F: Fn(T, T) -> T,
{
    let got = values.len();
    values
        .into_iter()
        .reduce(op)
        .ok_or(TransportError::GatherSize { expected: 1, got })
}

pub(crate) fn check_rank(rank: Rank, size: usize) -> Result<(), TransportError> {
    if rank < size {
        Ok(())
    } else {
        Err(TransportError::RankOutOfRange { rank, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_is_left_to_right() {
        let folded = fold_in_rank_order(vec!["a".to_string(), "b".into(), "c".into()], |a, b| {
            a + &b
        })
        .unwrap();
        assert_eq!(folded, "abc");
    }

    #[test]
    fn fold_of_nothing_is_an_error() {
        let result = fold_in_rank_order(Vec::<u64>::new(), |a, b| a + b);
        assert!(matches!(result, Err(TransportError::GatherSize { .. })));
    }

    #[test]
    fn decode_gathered_checks_count() {
        let one = wire::to_bytes(&1u64).unwrap();
        let result = decode_gathered::<u64>(&[one.clone()], 2);
        assert!(matches!(
            result,
            Err(TransportError::GatherSize {
                expected: 2,
                got: 1
            })
        ));
        assert_eq!(decode_gathered::<u64>(&[one.clone(), one], 2).unwrap(), vec![1, 1]);
    }

    #[test]
    fn rank_range_check() {
        assert!(check_rank(3, 4).is_ok());
        assert!(matches!(
            check_rank(4, 4),
            Err(TransportError::RankOutOfRange { rank: 4, size: 4 })
        ));
    }
}
