//! Reductions and broadcasts.
//!
//! Every operation here is collective, barriers first so each rank's
//! contribution reflects all async work issued before the call, and must be
//! called by every rank in the same order with the same operation.

use std::ops::Add;

use super::{Comm, CommError};
use crate::transport::{self, Rank, TransportError, check_rank, decode_gathered};
use crate::wire::{self, Wire};

impl<S> Comm<S> {
    /// Folds every rank's `value` with `op` in rank order.
    ///
    /// Every rank gets the identical result, also for non-commutative or
    /// floating point operations.
    pub fn all_reduce<T, F>(&self, value: &T, op: F) -> T
    where
        T: Wire,
        F: Fn(T, T) -> T,
    {
        let result = self.collective("all_reduce").and_then(|()| {
            transport::all_reduce(&mut **self.transport_mut(), value, op).map_err(CommError::from)
        });
        self.check(result)
    }

    pub fn sum<T: Wire + Add<Output = T>>(&self, value: T) -> T {
        self.all_reduce(&value, |a, b| a + b)
    }

    pub fn min<T: Wire + PartialOrd>(&self, value: T) -> T {
        self.all_reduce(&value, |a, b| if b < a { b } else { a })
    }

    pub fn max<T: Wire + PartialOrd>(&self, value: T) -> T {
        self.all_reduce(&value, |a, b| if b > a { b } else { a })
    }

    /// True on every rank iff `value` is true on every rank.
    pub fn logical_and(&self, value: bool) -> bool {
        self.all_reduce(&value, |a, b| a && b)
    }

    /// True on every rank iff `value` is true on some rank.
    pub fn logical_or(&self, value: bool) -> bool {
        self.all_reduce(&value, |a, b| a || b)
    }

    /// Returns `root`'s `value` on every rank. Other ranks' values are ignored.
    pub fn broadcast<T: Wire>(&self, value: &T, root: Rank) -> T {
        let result = self.collective("broadcast").and_then(|()| {
            check_rank(root, self.size)?;
            let contribution = if self.rank == root {
                wire::to_bytes(value)?
            } else {
                Vec::new()
            };
            let gathered = self.transport_mut().all_gather(contribution)?;
            let bytes = gathered.get(root).ok_or(TransportError::GatherSize {
                expected: self.size,
                got: gathered.len(),
            })?;
            Ok(wire::from_bytes(bytes)?)
        });
        self.check(result)
    }

    /// Every rank's `value`, indexed by rank.
    pub fn all_gather<T: Wire>(&self, value: &T) -> Vec<T> {
        let result = self.collective("all_gather").and_then(|()| {
            let gathered = self.transport_mut().all_gather(wire::to_bytes(value)?)?;
            Ok(decode_gathered(&gathered, self.size)?)
        });
        self.check(result)
    }

    fn collective(&self, name: &'static str) -> Result<(), CommError> {
        self.ensure_outside_handler(name)?;
        self.barrier();
        Ok(())
    }
}
