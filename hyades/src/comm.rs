//! The communicator: async calls, barriers and collectives for one rank.
//!
//! # Execution model
//!
//! A [`Comm`] is owned by one thread and is not `Sync`. Handlers run inline,
//! inside whatever `Comm` call drove the progress engine, and receive the same
//! `&Comm` so they can issue further async calls. The rank's state `S` is
//! handed to handlers as `&mut S`; outside handlers it is reached through
//! [`Comm::with_state`] and [`Comm::with_state_mut`].
//!
//! ```ignore
//! let mut registry = Registry::<u64>::new();
//! let add = registry.register("add", |_comm, total: &mut u64, n: u64| *total += n);
//! let table = registry.freeze();
//!
//! LocalWorld::new(4).run(|transport| {
//!     let comm = Comm::new(transport, Arc::clone(&table), 0u64, Config::default())?;
//!     comm.async_call(0, add, &(comm.rank() as u64));
//!     comm.barrier();
//!     comm.into_state()
//! });
//! ```
//!
//! # Errors
//!
//! Construction returns `Result`. After that, every failure is a protocol
//! violation or a transport failure that the group cannot recover from
//! together: the communicator logs it and panics with the diagnostic.

mod barrier;
mod buffer;
mod collective;
mod engine;
mod stats;

use std::cell::{Cell, RefCell, RefMut};
use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

pub use barrier::{BarrierPhase, RoundTally};
pub use stats::Stats;

use crate::config::{Config, ConfigError};
use crate::dispatch::{DispatchError, Handler, HandlerTable};
use crate::trace::{debug, error, warn};
use crate::transport::{Rank, Transport, TransportError, check_rank, decode_gathered};
use crate::wire::{self, EnvelopeError, Wire, encode_envelope};
use barrier::ProtocolCounters;
use buffer::SendBuffer;
use stats::StatsCell;

/// Errors raised by the communicator.
#[derive(Debug, Error)]
pub enum CommError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// An envelope from `src` could not be dispatched.
    #[error("dispatch of envelope from rank {src} failed: {source}")]
    Dispatch {
        src: Rank,
        #[source]
        source: DispatchError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("collective codec error: {0}")]
    Codec(#[from] postcard::Error),
    /// Ranks registered different handler sets.
    #[error("handler tables differ across ranks (local {local:#018x}, min {min:#018x}, max {max:#018x})")]
    HandlerTableMismatch { local: u64, min: u64, max: u64 },
    /// A collective was called by a handler.
    #[error("{0} called from inside a handler")]
    CollectiveInHandler(&'static str),
    /// The rank state was needed while already borrowed.
    #[error("rank state is already borrowed")]
    StateBorrowed,
}

/// Logs `err` and aborts the rank.
#[cold]
#[track_caller]
pub(crate) fn fatal(rank: Rank, err: &CommError) -> ! {
    error!(rank, error = %err, "fatal communicator error");
    panic!("hyades rank {rank}: {err}");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flush {
    /// Buffers that are full or older than the flush interval.
    Due,
    /// Every non-empty buffer.
    Forced,
}

/// One rank's endpoint for async calls and collectives.
pub struct Comm<S> {
    rank: Rank,
    size: usize,
    config: Config,
    transport: RefCell<Box<dyn Transport>>,
    table: Arc<HandlerTable<S>>,
    state: RefCell<S>,
    /// Indexed by destination; our own slot stays empty.
    buffers: RefCell<Vec<SendBuffer>>,
    /// Encoded envelopes addressed to this rank.
    local: RefCell<VecDeque<Vec<u8>>>,
    scratch: RefCell<Vec<u8>>,
    counters: ProtocolCounters,
    stats: StatsCell,
    /// Handler nesting depth; nonzero while a handler runs.
    depth: Cell<u32>,
    calls_since_progress: Cell<u32>,
}

impl<S> Comm<S> {
    /// Wraps `transport` into a communicator.
    ///
    /// Collective: every rank must call it. The ranks compare their handler
    /// tables' fingerprints before any envelope is exchanged.
    ///
    /// # Errors
    /// [`CommError::HandlerTableMismatch`] if the ranks registered different
    /// handlers, [`CommError::Config`] for an unusable `config`, or the
    /// transport's error if the comparison fails.
    pub fn new<T>(
        transport: T,
        table: Arc<HandlerTable<S>>,
        state: S,
        config: Config,
    ) -> Result<Self, CommError>
    where
        T: Transport + 'static,
    {
        if config.batch_bytes == 0 {
            return Err(ConfigError::ZeroBatch.into());
        }
        let mut transport: Box<dyn Transport> = Box::new(transport);
        let rank = transport.rank();
        let size = transport.size();

        let local = table.fingerprint();
        let gathered = transport.all_gather(wire::to_bytes(&local)?)?;
        let fingerprints = decode_gathered::<u64>(&gathered, size)?;
        let min = fingerprints.iter().copied().min().unwrap_or(local);
        let max = fingerprints.iter().copied().max().unwrap_or(local);
        if min != max {
            return Err(CommError::HandlerTableMismatch { local, min, max });
        }
        debug!(rank, size, handlers = table.len(), "communicator ready");

        Ok(Self {
            rank,
            size,
            buffers: RefCell::new((0..size).map(|_| SendBuffer::new(config.batch_bytes)).collect()),
            config,
            transport: RefCell::new(transport),
            table,
            state: RefCell::new(state),
            local: RefCell::new(VecDeque::new()),
            scratch: RefCell::new(Vec::new()),
            counters: ProtocolCounters::default(),
            stats: StatsCell::default(),
            depth: Cell::new(0),
            calls_since_progress: Cell::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub const fn rank(&self) -> Rank {
        self.rank
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// True on the first rank only.
    #[inline]
    #[must_use]
    pub const fn rank0(&self) -> bool {
        self.rank == 0
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn table(&self) -> &HandlerTable<S> {
        &self.table
    }

    /// Asynchronously runs `handler(args)` on rank `dest`.
    ///
    /// Returns once the call is buffered. Its effects are guaranteed visible
    /// only after the next barrier.
    pub fn async_call<A: Wire>(&self, dest: Rank, handler: Handler<A>, args: &A) {
        let result = self.enqueue(dest, handler, args).and_then(|()| self.after_call());
        self.check(result);
    }

    /// Asynchronously runs `handler(args)` on every rank, this one included.
    pub fn async_bcast<A: Wire>(&self, handler: Handler<A>, args: &A) {
        let result = (0..self.size)
            .try_for_each(|dest| self.enqueue(dest, handler, args))
            .and_then(|()| self.after_call());
        self.check(result);
    }

    /// Sends every buffered envelope now. Does not run handlers.
    pub fn flush(&self) {
        let result = self.flush_buffers(Flush::Forced);
        self.check(result);
    }

    /// Runs one progress step: handles available envelopes, flushes due buffers.
    ///
    /// Inside a handler this only flushes.
    pub fn progress(&self) {
        let result = self.step(Flush::Due).map(drop);
        self.check(result);
    }

    /// This rank's counters since the last reset.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Zeroes this rank's counters. Call it right after a barrier.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Runs `f` with shared access to the rank state.
    ///
    /// # Panics
    /// If called from a handler, which already holds the state.
    pub fn with_state<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let state = self.state.try_borrow().map_err(|_| CommError::StateBorrowed);
        let state = self.check(state);
        f(&state)
    }

    /// Runs `f` with exclusive access to the rank state.
    ///
    /// # Panics
    /// If called from a handler, which already holds the state.
    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let state = self.state.try_borrow_mut().map_err(|_| CommError::StateBorrowed);
        let mut state = self.check(state);
        f(&mut state)
    }

    /// Consumes the communicator and returns the rank state.
    ///
    /// Call after a barrier; envelopes still buffered are dropped.
    pub fn into_state(self) -> S {
        if self.has_undelivered() {
            warn!(rank = self.rank, "communicator dropped with undelivered envelopes");
        }
        self.state.into_inner()
    }

    fn enqueue<A: Wire>(&self, dest: Rank, handler: Handler<A>, args: &A) -> Result<(), CommError> {
        check_rank(dest, self.size)?;
        let mut scratch = self.scratch.borrow_mut();
        let len = encode_envelope(handler.id(), args, &mut scratch)?;
        self.stats.record(|s| {
            s.async_count += 1;
            s.bytes_sent += len as u64;
        });

        if dest == self.rank {
            self.local.borrow_mut().push_back(scratch.to_vec());
            self.counters.note_sent(1);
            return Ok(());
        }

        let mut buffers = self.buffers.borrow_mut();
        let buffer = &mut buffers[dest];
        if let Some(sealed) = buffer.enqueue(&scratch) {
            self.send_batch(dest, sealed)?;
        }
        if buffer.is_full()
            && let Some(batch) = buffer.take()
        {
            self.send_batch(dest, batch)?;
        }
        Ok(())
    }

    /// Drives progress after an async call, every `progress_every` calls.
    fn after_call(&self) -> Result<(), CommError> {
        if self.in_handler() {
            return self.flush_buffers(Flush::Due);
        }
        let calls = self.calls_since_progress.get() + 1;
        if calls >= self.config.progress_every() {
            self.calls_since_progress.set(0);
            self.step(Flush::Due)?;
        } else {
            self.calls_since_progress.set(calls);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn in_handler(&self) -> bool {
        self.depth.get() > 0
    }

    pub(crate) fn ensure_outside_handler(&self, operation: &'static str) -> Result<(), CommError> {
        if self.in_handler() {
            Err(CommError::CollectiveInHandler(operation))
        } else {
            Ok(())
        }
    }

    pub(crate) fn transport_mut(&self) -> RefMut<'_, Box<dyn Transport>> {
        self.transport.borrow_mut()
    }

    pub(crate) fn buffers_empty(&self) -> bool {
        self.local.borrow().is_empty() && self.buffers.borrow().iter().all(SendBuffer::is_empty)
    }

    /// Envelopes this rank has queued but not yet handed to the transport or
    /// run locally. Per-rank protocol counts say nothing here: only their
    /// sums over the group balance.
    fn has_undelivered(&self) -> bool {
        !self.buffers_empty()
    }

    /// Unwraps `result` or aborts the rank.
    #[track_caller]
    pub(crate) fn check<T, E: Into<CommError>>(&self, result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => fatal(self.rank, &err.into()),
        }
    }
}

impl<S> std::fmt::Debug for Comm<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
