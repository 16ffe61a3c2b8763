//! In-process transport: every rank is a thread.
//!
//! [`LocalWorld::run`] spawns one scoped thread per rank and hands each a
//! [`LocalTransport`]. Packets travel over one unbounded `flume` inbox per
//! rank (so FIFO per source holds and a send never blocks), and the
//! all-gather is a generation-numbered rendezvous behind a `parking_lot`
//! mutex and condvar.
//!
//! If a rank thread panics, its guard poisons the rendezvous: peers blocked in
//! (or later entering) a collective get [`TransportError::PeerFailed`] instead
//! of hanging, and `run` re-raises the panic of the rank that failed first.

use std::any::Any;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use super::{Rank, Transport, TransportError, check_rank};
use crate::trace::{debug, error};

/// A group of `size` ranks living in this process.
#[derive(Debug, Clone)]
pub struct LocalWorld {
    size: usize,
    pin_threads: bool,
}

impl LocalWorld {
    /// Creates a world of `size` ranks.
    ///
    /// # Panics
    /// Panics if `size == 0`.
    #[must_use]
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "a world needs at least one rank");
        Self {
            size,
            pin_threads: false,
        }
    }

    /// Pin rank `n` to core `n % cores` when running.
    #[must_use]
    pub const fn pinned(mut self, pin_threads: bool) -> Self {
        self.pin_threads = pin_threads;
        self
    }

    /// Returns the number of ranks.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Creates the transports without spawning threads.
    ///
    /// Useful when the caller manages its own threads; every transport must be
    /// driven by its own thread for collectives to complete.
    #[must_use]
    pub fn transports(&self) -> Vec<LocalTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..self.size).map(|_| flume::unbounded()).unzip();
        let shared = Arc::new(Shared {
            inboxes: senders,
            rendezvous: Rendezvous::new(self.size),
        });
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                size: self.size,
                shared: Arc::clone(&shared),
                inbox,
                ticket: None,
            })
            .collect()
    }

    /// Runs `f` on every rank concurrently and returns the results by rank.
    ///
    /// # Panics
    /// Re-raises the panic of the first rank that failed.
    pub fn run<R, F>(&self, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(LocalTransport) -> R + Sync,
    {
        let cores = if self.pin_threads {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let transports = self.transports();
        let shared = Arc::clone(&transports[0].shared);
        let f = &f;

        let outcomes: Vec<Result<R, Box<dyn Any + Send>>> = thread::scope(|s| {
            let handles: Vec<_> = transports
                .into_iter()
                .map(|transport| {
                    let rank = transport.rank;
                    let core = (!cores.is_empty()).then(|| cores[rank % cores.len()]);
                    thread::Builder::new()
                        .name(format!("hyades-rank-{rank}"))
                        .spawn_scoped(s, move || {
                            if let Some(core) = core {
                                core_affinity::set_for_current(core);
                            }
                            let _guard = PoisonGuard {
                                shared: Arc::clone(&transport.shared),
                                rank,
                            };
                            f(transport)
                        })
                        .expect("failed to spawn rank thread")
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });

        let first_failed = shared.rendezvous.state.lock().failed;
        let mut results = Vec::with_capacity(self.size);
        let mut panics: Vec<(Rank, Box<dyn Any + Send>)> = Vec::new();
        for (rank, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(value) => results.push(value),
                Err(payload) => panics.push((rank, payload)),
            }
        }
        if !panics.is_empty() {
            let index = panics
                .iter()
                .position(|(rank, _)| Some(*rank) == first_failed)
                .unwrap_or(0);
            let (_, payload) = panics.swap_remove(index);
            std::panic::resume_unwind(payload);
        }
        results
    }
}

struct Shared {
    inboxes: Vec<flume::Sender<(Rank, Vec<u8>)>>,
    rendezvous: Rendezvous,
}

struct PoisonGuard {
    shared: Arc<Shared>,
    rank: Rank,
}

impl Drop for PoisonGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(rank = self.rank, "rank thread panicked, poisoning world");
            self.shared.rendezvous.poison(self.rank);
        }
    }
}

struct Rendezvous {
    state: Mutex<GatherState>,
    completed: Condvar,
}

struct GatherState {
    /// Generation currently collecting contributions.
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    /// Most recent completed generation and its result.
    last: Option<(u64, Arc<Vec<Vec<u8>>>)>,
    /// First rank that failed, if any.
    failed: Option<Rank>,
}

impl Rendezvous {
    fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(GatherState {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                last: None,
                failed: None,
            }),
            completed: Condvar::new(),
        }
    }

    fn contribute(&self, rank: Rank, contribution: Vec<u8>) -> Result<u64, TransportError> {
        let mut state = self.state.lock();
        if let Some(failed) = state.failed {
            return Err(TransportError::PeerFailed(failed));
        }
        let generation = state.generation;
        state.slots[rank] = Some(contribution);
        state.arrived += 1;

        if state.arrived == state.slots.len() {
            let result: Vec<Vec<u8>> = state
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            state.last = Some((generation, Arc::new(result)));
            state.generation += 1;
            state.arrived = 0;
            self.completed.notify_all();
        }
        Ok(generation)
    }

    fn check(state: &GatherState, ticket: u64) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        if let Some((generation, result)) = &state.last
            && *generation == ticket
        {
            return Ok(Some(result.as_ref().clone()));
        }
        if let Some(failed) = state.failed {
            return Err(TransportError::PeerFailed(failed));
        }
        Ok(None)
    }

    fn poll(&self, ticket: u64) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        Self::check(&self.state.lock(), ticket)
    }

    fn wait(&self, ticket: u64) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = Self::check(&state, ticket)? {
                return Ok(result);
            }
            self.completed.wait(&mut state);
        }
    }

    fn poison(&self, rank: Rank) {
        let mut state = self.state.lock();
        state.failed.get_or_insert(rank);
        self.completed.notify_all();
    }
}

/// One rank's endpoint in a [`LocalWorld`].
pub struct LocalTransport {
    rank: Rank,
    size: usize,
    shared: Arc<Shared>,
    inbox: flume::Receiver<(Rank, Vec<u8>)>,
    ticket: Option<u64>,
}

impl LocalTransport {
    fn take_ticket(&mut self) -> Result<u64, TransportError> {
        self.ticket.ok_or(TransportError::NoCollective)
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&mut self, dest: Rank, packet: Vec<u8>) -> Result<(), TransportError> {
        check_rank(dest, self.size)?;
        // Every inbox receiver lives as long as `shared`, which we hold.
        self.shared.inboxes[dest]
            .send((self.rank, packet))
            .map_err(|_| TransportError::Disconnected(dest))
    }

    fn try_recv(&mut self) -> Result<Option<(Rank, Vec<u8>)>, TransportError> {
        match self.inbox.try_recv() {
            Ok(packet) => Ok(Some(packet)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(TransportError::Disconnected(self.rank)),
        }
    }

    fn start_all_gather(&mut self, contribution: Vec<u8>) -> Result<(), TransportError> {
        if self.ticket.is_some() {
            return Err(TransportError::CollectiveInFlight);
        }
        let ticket = self.shared.rendezvous.contribute(self.rank, contribution)?;
        debug!(rank = self.rank, generation = ticket, "all-gather started");
        self.ticket = Some(ticket);
        Ok(())
    }

    fn poll_all_gather(&mut self) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        let ticket = self.take_ticket()?;
        let result = self.shared.rendezvous.poll(ticket)?;
        if result.is_some() {
            self.ticket = None;
        }
        Ok(result)
    }

    fn all_gather(&mut self, contribution: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
        self.start_all_gather(contribution)?;
        let ticket = self.take_ticket()?;
        let result = self.shared.rendezvous.wait(ticket)?;
        self.ticket = None;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::all_reduce;

    #[test]
    fn packets_keep_per_source_order() {
        let world = LocalWorld::new(3);
        let received = world.run(|mut t| {
            if t.rank() != 0 {
                for i in 0..50u8 {
                    t.send(0, vec![t.rank() as u8, i]).unwrap();
                }
            }
            t.all_gather(Vec::new()).unwrap();

            let mut got = Vec::new();
            while let Some((src, packet)) = t.try_recv().unwrap() {
                assert_eq!(packet[0] as usize, src);
                got.push((src, packet[1]));
            }
            got
        });

        for src in 1..3 {
            let seq: Vec<u8> = received[0]
                .iter()
                .filter(|(s, _)| *s == src)
                .map(|(_, i)| *i)
                .collect();
            assert_eq!(seq, (0..50).collect::<Vec<u8>>());
        }
        assert!(received[1].is_empty());
    }

    #[test]
    fn all_gather_is_indexed_by_rank() {
        let world = LocalWorld::new(4);
        let results = world.run(|mut t| {
            let mine = vec![t.rank() as u8; t.rank() + 1];
            t.all_gather(mine).unwrap()
        });
        for result in &results {
            assert_eq!(result.len(), 4);
            for (rank, contribution) in result.iter().enumerate() {
                assert_eq!(contribution, &vec![rank as u8; rank + 1]);
            }
        }
    }

    #[test]
    fn repeated_collectives_do_not_mix_generations() {
        let world = LocalWorld::new(3);
        let sums = world.run(|mut t| {
            (0..100u64)
                .map(|round| {
                    let value = round * 10 + t.rank() as u64;
                    all_reduce(&mut t, &value, |a, b| a + b).unwrap()
                })
                .collect::<Vec<_>>()
        });
        for sums in &sums {
            for (round, sum) in sums.iter().enumerate() {
                assert_eq!(*sum, round as u64 * 30 + 3);
            }
        }
    }

    #[test]
    fn split_collective_polls_until_complete() {
        let world = LocalWorld::new(2);
        world.run(|mut t| {
            assert!(matches!(
                t.poll_all_gather(),
                Err(TransportError::NoCollective)
            ));
            t.start_all_gather(vec![1]).unwrap();
            assert!(matches!(
                t.start_all_gather(vec![2]),
                Err(TransportError::CollectiveInFlight)
            ));
            loop {
                if let Some(all) = t.poll_all_gather().unwrap() {
                    assert_eq!(all, vec![vec![1], vec![1]]);
                    break;
                }
                thread::yield_now();
            }
        });
    }

    #[test]
    fn send_to_unknown_rank_fails() {
        let mut transports = LocalWorld::new(2).transports();
        let result = transports[0].send(2, vec![]);
        assert!(matches!(
            result,
            Err(TransportError::RankOutOfRange { rank: 2, size: 2 })
        ));
    }

    #[test]
    #[should_panic(expected = "rank 1 gave up")]
    fn panicking_rank_releases_peers() {
        LocalWorld::new(3).run(|mut t| {
            if t.rank() == 1 {
                panic!("rank 1 gave up");
            }
            let result = t.all_gather(Vec::new());
            assert!(matches!(result, Err(TransportError::PeerFailed(1))));
        });
    }
}
