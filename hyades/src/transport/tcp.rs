//! TCP mesh transport: every rank is a process.
//!
//! # Bootstrap
//!
//! Every rank knows the full rank table (one [`Endpoint`] per rank) and listens
//! on its own entry. Rank `r` dials every rank below it and accepts every rank
//! above it, so each pair shares exactly one connection. The dialling side
//! opens with a 12-byte hello:
//!
//! ```text
//! [magic:4]["HYAD"][rank:4][size:4]   (little-endian)
//! ```
//!
//! # Frames
//!
//! | Kind | Direction | Payload |
//! |------|-----------|---------|
//! | `DATA` | any -> any | one batch of envelopes |
//! | `GATHER` | rank -> 0 | this rank's collective contribution |
//! | `GATHER_RESULT` | 0 -> rank | postcard `Vec<Vec<u8>>`, one entry per rank |
//!
//! The all-gather is a gather to rank 0 followed by a broadcast of the
//! combined result. Frames queued for a slow peer stay in user space, and every
//! wait loop keeps reading, so two ranks flooding each other cannot deadlock.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use minstant::Instant;
use mio::{Events, Interest, Poll, Token};

use super::{Rank, Transport, TransportError, check_rank};
use crate::net::{Endpoint, FramedStream, parse_rank_table};
use crate::trace::{debug, info, trace, warn};

/// Default time allowed for the whole mesh to come up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const KIND_DATA: u8 = 0;
const KIND_GATHER: u8 = 1;
const KIND_GATHER_RESULT: u8 = 2;

const HELLO_MAGIC: u32 = u32::from_le_bytes(*b"HYAD");
const HELLO_LEN: usize = 12;

const RETRY_DELAY: Duration = Duration::from_millis(20);
const WAIT_SLICE: Duration = Duration::from_millis(1);
const DRAIN_ON_DROP: Duration = Duration::from_secs(1);

const ENV_RANK: &str = "HYADES_RANK";
const ENV_PEERS: &str = "HYADES_PEERS";

/// Configuration for a [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// This process's rank.
    pub rank: Rank,
    /// Listening endpoint of every rank, indexed by rank.
    pub endpoints: Vec<Endpoint>,
    /// Deadline for the mesh bootstrap.
    pub connect_timeout: Duration,
}

impl TcpConfig {
    #[must_use]
    pub const fn new(rank: Rank, endpoints: Vec<Endpoint>) -> Self {
        Self {
            rank,
            endpoints,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Reads `HYADES_RANK` and `HYADES_PEERS` (comma separated rank table).
    ///
    /// # Errors
    /// [`TransportError::Config`] if either is missing or unparsable.
    pub fn from_env() -> Result<Self, TransportError> {
        let rank = std::env::var(ENV_RANK)
            .map_err(|_| TransportError::Config(format!("{ENV_RANK} is not set")))?;
        let rank: Rank = rank
            .trim()
            .parse()
            .map_err(|_| TransportError::Config(format!("{ENV_RANK}={rank:?} is not a rank")))?;
        let peers = std::env::var(ENV_PEERS)
            .map_err(|_| TransportError::Config(format!("{ENV_PEERS} is not set")))?;
        let endpoints = parse_rank_table(&peers)
            .map_err(|e| TransportError::Config(format!("{ENV_PEERS}: {e}")))?;
        Ok(Self::new(rank, endpoints))
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.endpoints.is_empty() {
            return Err(TransportError::Config("empty rank table".into()));
        }
        check_rank(self.rank, self.endpoints.len())
    }
}

/// One rank's endpoint in a TCP mesh.
pub struct TcpTransport {
    rank: Rank,
    size: usize,
    poll: Poll,
    events: Events,
    /// Connection per peer, `None` at our own index.
    peers: Vec<Option<FramedStream>>,
    /// Data packets ready for `try_recv`.
    inbox: VecDeque<(Rank, Vec<u8>)>,
    /// On rank 0: contributions per source. Elsewhere: results at index 0.
    gather_inbox: Vec<VecDeque<Vec<u8>>>,
    /// Our contribution while a collective is outstanding.
    in_flight: Option<Vec<u8>>,
}

impl TcpTransport {
    /// Binds this rank's endpoint and builds the mesh.
    ///
    /// # Errors
    /// Fails on invalid configuration, bind failure, handshake violations or
    /// if peers do not show up before `connect_timeout`.
    pub fn connect(config: &TcpConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let listener = TcpListener::bind(config.endpoints[config.rank].as_socket_addr())?;
        Self::with_listener(listener, config)
    }

    /// Builds the mesh using an already bound listener.
    ///
    /// Lets a launcher bind ephemeral ports first and distribute the resulting
    /// rank table.
    ///
    /// # Errors
    /// Same as [`TcpTransport::connect`].
    pub fn with_listener(listener: TcpListener, config: &TcpConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let rank = config.rank;
        let size = config.endpoints.len();
        let deadline = Instant::now() + config.connect_timeout;
        info!(rank, size, "bootstrapping tcp mesh");

        let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        for (peer, endpoint) in config.endpoints.iter().enumerate().take(rank) {
            let mut stream = dial(peer, *endpoint, deadline)?;
            stream.write_all(&hello(rank, size))?;
            debug!(rank, peer, %endpoint, "dialled peer");
            streams[peer] = Some(stream);
        }
        accept_higher_ranks(&listener, rank, size, deadline, &mut streams)?;

        let poll = Poll::new()?;
        let mut peers = Vec::with_capacity(size);
        for (peer, stream) in streams.into_iter().enumerate() {
            match stream {
                Some(stream) => {
                    let mut framed = FramedStream::from_std(stream)?;
                    poll.registry()
                        .register(&mut framed, Token(peer), Interest::READABLE)?;
                    peers.push(Some(framed));
                }
                None => peers.push(None),
            }
        }
        info!(rank, size, "tcp mesh ready");

        let mut transport = Self {
            rank,
            size,
            poll,
            events: Events::with_capacity(size.max(8)),
            peers,
            inbox: VecDeque::new(),
            gather_inbox: (0..size).map(|_| VecDeque::new()).collect(),
            in_flight: None,
        };
        // Frames that raced the registration.
        let everyone: Vec<Rank> = (0..size).collect();
        transport.read_from(&everyone)?;
        Ok(transport)
    }

    /// Flushes writes, waits up to `timeout` for readability, reads and routes.
    fn pump(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.flush_all()?;
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let ready: Vec<Rank> = self.events.iter().map(|event| event.token().0).collect();
        self.read_from(&ready)
    }

    fn flush_all(&mut self) -> Result<(), TransportError> {
        for stream in self.peers.iter_mut().flatten() {
            if stream.has_pending_writes() && !stream.is_closed() {
                stream.flush_writes()?;
            }
        }
        Ok(())
    }

    fn read_from(&mut self, ready: &[Rank]) -> Result<(), TransportError> {
        for &src in ready {
            let Some(stream) = self.peers.get_mut(src).and_then(Option::as_mut) else {
                continue;
            };
            stream.fill()?;
            let mut frames = Vec::new();
            while let Some(frame) = stream.next_frame() {
                frames.push(frame);
            }
            if stream.is_closed() {
                if stream.leftover() > 0 {
                    return Err(TransportError::MalformedFrame {
                        rank: src,
                        reason: "connection closed mid-frame",
                    });
                }
                debug!(rank = self.rank, peer = src, "peer closed connection");
            }
            for frame in frames {
                self.route(src, frame.kind, frame.payload)?;
            }
        }
        Ok(())
    }

    fn route(&mut self, src: Rank, kind: u8, payload: Vec<u8>) -> Result<(), TransportError> {
        match kind {
            KIND_DATA => self.inbox.push_back((src, payload)),
            KIND_GATHER if self.rank == 0 => self.gather_inbox[src].push_back(payload),
            KIND_GATHER_RESULT if src == 0 && self.rank != 0 => {
                self.gather_inbox[0].push_back(payload);
            }
            KIND_GATHER | KIND_GATHER_RESULT => {
                return Err(TransportError::MalformedFrame {
                    rank: src,
                    reason: "collective frame sent to the wrong rank",
                });
            }
            _ => {
                return Err(TransportError::MalformedFrame {
                    rank: src,
                    reason: "unknown frame kind",
                });
            }
        }
        Ok(())
    }

    fn queue(&mut self, dest: Rank, kind: u8, payload: &[u8]) -> Result<(), TransportError> {
        let stream = self.peers[dest]
            .as_mut()
            .ok_or(TransportError::Disconnected(dest))?;
        if stream.is_closed() {
            return Err(TransportError::Disconnected(dest));
        }
        stream.queue_frame(kind, payload)?;
        stream.flush_writes()?;
        Ok(())
    }

    fn peer_closed(&self, peer: Rank) -> bool {
        self.peers[peer].as_ref().is_some_and(FramedStream::is_closed)
    }

    /// Finishes the outstanding collective if all inputs are present.
    fn try_complete(&mut self) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        if self.in_flight.is_none() {
            return Err(TransportError::NoCollective);
        }
        if self.rank == 0 {
            if let Some(missing) = (1..self.size).find(|&r| self.gather_inbox[r].is_empty()) {
                if self.peer_closed(missing) {
                    return Err(TransportError::Disconnected(missing));
                }
                return Ok(None);
            }
            let mut result = Vec::with_capacity(self.size);
            result.push(self.in_flight.take().unwrap_or_default());
            for r in 1..self.size {
                result.push(self.gather_inbox[r].pop_front().unwrap_or_default());
            }
            let encoded = postcard::to_allocvec(&result)?;
            for peer in 1..self.size {
                self.queue(peer, KIND_GATHER_RESULT, &encoded)?;
            }
            trace!(rank = self.rank, bytes = encoded.len(), "all-gather complete");
            Ok(Some(result))
        } else {
            let Some(encoded) = self.gather_inbox[0].pop_front() else {
                if self.peer_closed(0) {
                    return Err(TransportError::Disconnected(0));
                }
                return Ok(None);
            };
            let result: Vec<Vec<u8>> = postcard::from_bytes(&encoded)?;
            if result.len() != self.size {
                return Err(TransportError::GatherSize {
                    expected: self.size,
                    got: result.len(),
                });
            }
            self.in_flight = None;
            Ok(Some(result))
        }
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&mut self, dest: Rank, packet: Vec<u8>) -> Result<(), TransportError> {
        check_rank(dest, self.size)?;
        if dest == self.rank {
            self.inbox.push_back((dest, packet));
            return Ok(());
        }
        self.queue(dest, KIND_DATA, &packet)
    }

    fn try_recv(&mut self) -> Result<Option<(Rank, Vec<u8>)>, TransportError> {
        if self.inbox.is_empty() {
            self.pump(Duration::ZERO)?;
        }
        Ok(self.inbox.pop_front())
    }

    fn start_all_gather(&mut self, contribution: Vec<u8>) -> Result<(), TransportError> {
        if self.in_flight.is_some() {
            return Err(TransportError::CollectiveInFlight);
        }
        if self.rank != 0 {
            self.queue(0, KIND_GATHER, &contribution)?;
        }
        self.in_flight = Some(contribution);
        Ok(())
    }

    fn poll_all_gather(&mut self) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        if self.in_flight.is_none() {
            return Err(TransportError::NoCollective);
        }
        self.pump(Duration::ZERO)?;
        self.try_complete()
    }

    fn all_gather(&mut self, contribution: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
        self.start_all_gather(contribution)?;
        loop {
            if let Some(result) = self.try_complete()? {
                return Ok(result);
            }
            self.pump(WAIT_SLICE)?;
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let deadline = Instant::now() + DRAIN_ON_DROP;
        while self
            .peers
            .iter()
            .flatten()
            .any(|s| s.has_pending_writes() && !s.is_closed())
        {
            if self.flush_all().is_err() || Instant::now() > deadline {
                warn!(rank = self.rank, "dropping transport with unsent frames");
                break;
            }
            std::thread::sleep(WAIT_SLICE);
        }
    }
}

fn hello(rank: Rank, size: usize) -> [u8; HELLO_LEN] {
    let mut buf = [0u8; HELLO_LEN];
    buf[0..4].copy_from_slice(&HELLO_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&(rank as u32).to_le_bytes());
    buf[8..12].copy_from_slice(&(size as u32).to_le_bytes());
    buf
}

fn dial(peer: Rank, endpoint: Endpoint, deadline: Instant) -> Result<TcpStream, TransportError> {
    loop {
        match TcpStream::connect_timeout(&endpoint.as_socket_addr(), RETRY_DELAY * 50) {
            Ok(stream) => return Ok(stream),
            Err(_err) => {
                if Instant::now() >= deadline {
                    warn!(peer, %endpoint, error = %_err, "giving up on peer");
                    return Err(TransportError::ConnectTimeout {
                        rank: peer,
                        endpoint,
                    });
                }
                std::thread::sleep(RETRY_DELAY);
            }
        }
    }
}

fn accept_higher_ranks(
    listener: &TcpListener,
    rank: Rank,
    size: usize,
    deadline: Instant,
    streams: &mut [Option<TcpStream>],
) -> Result<(), TransportError> {
    listener.set_nonblocking(true)?;
    let mut remaining = size - rank - 1;
    while remaining > 0 {
        match listener.accept() {
            Ok((mut stream, _addr)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(RETRY_DELAY * 50))?;
                let mut buf = [0u8; HELLO_LEN];
                stream.read_exact(&mut buf)?;
                stream.set_read_timeout(None)?;

                let peer = read_hello(&buf, rank, size)?;
                if streams[peer].is_some() {
                    return Err(TransportError::Handshake(format!(
                        "rank {peer} connected twice"
                    )));
                }
                debug!(rank, peer, addr = %_addr, "accepted peer");
                streams[peer] = Some(stream);
                remaining -= 1;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    let missing = (rank + 1..size)
                        .find(|&r| streams[r].is_none())
                        .unwrap_or(rank + 1);
                    let endpoint = listener.local_addr()?.into();
                    return Err(TransportError::ConnectTimeout {
                        rank: missing,
                        endpoint,
                    });
                }
                std::thread::sleep(RETRY_DELAY);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn read_hello(buf: &[u8; HELLO_LEN], rank: Rank, size: usize) -> Result<Rank, TransportError> {
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let peer = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let peer_size = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;

    if magic != HELLO_MAGIC {
        return Err(TransportError::Handshake(format!("bad magic {magic:#010x}")));
    }
    if peer_size != size {
        return Err(TransportError::Handshake(format!(
            "rank {peer} believes the group has {peer_size} ranks, not {size}"
        )));
    }
    if peer <= rank || peer >= size {
        return Err(TransportError::Handshake(format!(
            "rank {peer} should not dial rank {rank}"
        )));
    }
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trip() {
        let buf = hello(3, 5);
        assert_eq!(read_hello(&buf, 1, 5).unwrap(), 3);
    }

    #[test]
    fn hello_rejects_wrong_group() {
        let buf = hello(3, 5);
        assert!(matches!(
            read_hello(&buf, 1, 4),
            Err(TransportError::Handshake(_))
        ));
        // Rank 3 must never dial rank 4.
        assert!(read_hello(&buf, 4, 5).is_err());

        let mut bad = hello(3, 5);
        bad[0] ^= 0xFF;
        assert!(read_hello(&bad, 1, 5).is_err());
    }

    #[test]
    fn config_validation() {
        let config = TcpConfig::new(2, vec![Endpoint::localhost(1), Endpoint::localhost(2)]);
        assert!(matches!(
            config.validate(),
            Err(TransportError::RankOutOfRange { rank: 2, size: 2 })
        ));
        assert!(TcpConfig::new(0, Vec::new()).validate().is_err());
    }

    #[test]
    fn single_rank_mesh_gathers_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        let mut t = TcpTransport::with_listener(listener, &TcpConfig::new(0, vec![endpoint])).unwrap();

        assert_eq!(t.all_gather(vec![4, 2]).unwrap(), vec![vec![4, 2]]);
        t.send(0, vec![1]).unwrap();
        assert_eq!(t.try_recv().unwrap(), Some((0, vec![1])));
        assert_eq!(t.try_recv().unwrap(), None);
    }
}
