//! Handler registration and the frozen dispatch table.
//!
//! Handlers are registered on a [`Registry`] before any communicator exists.
//! Registration order assigns each handler its [`HandlerId`], so every rank
//! must register the same handlers in the same order. [`Registry::freeze`]
//! produces the immutable [`HandlerTable`] shared by every rank of a process.
//!
//! ```ignore
//! let mut registry = Registry::<Counter>::new();
//! let bump = registry.register("bump", |_comm, state: &mut Counter, by: u64| {
//!     state.0 += by;
//! });
//! let table = registry.freeze();
//! ```
//!
//! A [`Handler<A>`] is a typed reference: `async_call` only accepts arguments of
//! the type it was registered with, and the receiving side decodes exactly that
//! type before invoking the callable.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;
use xxhash_rust::xxh3::Xxh3;

use crate::comm::Comm;
use crate::wire::{EnvelopeError, HandlerId, RawEnvelope, Wire};

/// Failure to deliver an envelope to its handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The envelope names a handler this table does not have.
    #[error("unknown handler {0}")]
    UnknownHandler(HandlerId),
    /// The payload is not the argument type the handler was registered with.
    #[error("bad arguments for handler {name} ({id}): {source}")]
    BadArguments {
        id: HandlerId,
        name: &'static str,
        #[source]
        source: EnvelopeError,
    },
    /// The packet could not be split into envelopes.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

type Thunk<S> = Box<dyn Fn(&Comm<S>, &mut S, &[u8]) -> Result<(), EnvelopeError> + Send + Sync>;

struct Entry<S> {
    name: &'static str,
    arg_type: &'static str,
    thunk: Thunk<S>,
}

/// Typed reference to a registered handler taking arguments of type `A`.
pub struct Handler<A> {
    id: HandlerId,
    _args: PhantomData<fn(A)>,
}

impl<A> Handler<A> {
    const fn new(id: HandlerId) -> Self {
        Self {
            id,
            _args: PhantomData,
        }
    }

    #[must_use]
    pub const fn id(&self) -> HandlerId {
        self.id
    }
}

impl<A> Clone for Handler<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for Handler<A> {}

impl<A> fmt::Debug for Handler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.id).finish()
    }
}

impl<A> PartialEq for Handler<A> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<A> Eq for Handler<A> {}

/// Mutable registration phase of the dispatch table.
pub struct Registry<S> {
    entries: Vec<Entry<S>>,
}

impl<S: 'static> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> Registry<S> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers `f` under `name` and returns its typed reference.
    ///
    /// The returned handler's id is its registration index.
    ///
    /// # Panics
    /// If more than `u32::MAX` handlers are registered.
    pub fn register<A, F>(&mut self, name: &'static str, f: F) -> Handler<A>
    where
        A: Wire + 'static,
        F: Fn(&Comm<S>, &mut S, A) + Send + Sync + 'static,
    {
        let id = HandlerId(
            u32::try_from(self.entries.len()).unwrap_or_else(|_| panic!("too many handlers")),
        );
        let thunk: Thunk<S> = Box::new(move |comm: &Comm<S>, state: &mut S, payload: &[u8]| {
            let args = RawEnvelope {
                handler: id,
                payload,
            }
            .decode_args::<A>()?;
            f(comm, state, args);
            Ok(())
        });
        self.entries.push(Entry {
            name,
            arg_type: type_name::<A>(),
            thunk,
        });
        Handler::new(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ends registration.
    #[must_use]
    pub fn freeze(self) -> Arc<HandlerTable<S>> {
        let fingerprint = fingerprint(&self.entries);
        Arc::new(HandlerTable {
            entries: self.entries,
            fingerprint,
        })
    }
}

/// Immutable dispatch table, indexed by [`HandlerId`].
pub struct HandlerTable<S> {
    entries: Vec<Entry<S>>,
    fingerprint: u64,
}

impl<S> HandlerTable<S> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered name of `id`, if it exists.
    #[must_use]
    pub fn name(&self, id: HandlerId) -> Option<&'static str> {
        self.entries.get(id.0 as usize).map(|e| e.name)
    }

    /// Hash of every entry's id, name and argument type.
    ///
    /// Ranks built from the same registration sequence agree on it.
    #[must_use]
    pub const fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Decodes the envelope's arguments and runs its handler.
    ///
    /// # Errors
    /// [`DispatchError::UnknownHandler`] or [`DispatchError::BadArguments`].
    pub fn invoke(
        &self,
        comm: &Comm<S>,
        state: &mut S,
        envelope: RawEnvelope<'_>,
    ) -> Result<(), DispatchError> {
        let entry = self
            .entries
            .get(envelope.handler.0 as usize)
            .ok_or(DispatchError::UnknownHandler(envelope.handler))?;
        (entry.thunk)(comm, state, envelope.payload).map_err(|source| DispatchError::BadArguments {
            id: envelope.handler,
            name: entry.name,
            source,
        })
    }
}

impl<S> fmt::Debug for HandlerTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("handlers", &self.entries.iter().map(|e| e.name).collect::<Vec<_>>())
            .field("fingerprint", &format_args!("{:#018x}", self.fingerprint))
            .finish()
    }
}

fn fingerprint<S>(entries: &[Entry<S>]) -> u64 {
    let mut hasher = Xxh3::new();
    for (id, entry) in entries.iter().enumerate() {
        hasher.update(&(id as u64).to_le_bytes());
        hasher.update(entry.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(entry.arg_type.as_bytes());
        hasher.update(&[0]);
    }
    hasher.digest()
}
