//! Active messages with quiescence barriers for a fixed group of ranks.
//!
//! Any rank can run a registered handler on any other rank with
//! [`Comm::async_call`]. Handlers may issue further calls. [`Comm::barrier`]
//! returns on every rank once every call issued before it, and every call those
//! calls caused, has run exactly once.
//!
//! # Layers
//!
//! - [`transport`]: raw packets and an all-gather between ranks, in-process
//!   ([`LocalWorld`]) or over TCP ([`TcpTransport`])
//! - [`wire`]: envelope framing and batching
//! - [`dispatch`]: the handler table
//! - [`comm`]: send buffers, progress engine, barriers, collectives, stats

pub mod comm;
pub mod config;
pub mod dispatch;
pub mod net;
pub mod trace;
pub mod transport;
pub mod wire;

pub use comm::{BarrierPhase, Comm, CommError, RoundTally, Stats};
pub use config::{Config, ConfigError};
pub use dispatch::{DispatchError, Handler, HandlerTable, Registry};
pub use trace::init_tracing;
pub use transport::local::{LocalTransport, LocalWorld};
pub use transport::tcp::{TcpConfig, TcpTransport};
pub use transport::{Rank, Transport, TransportError};
pub use wire::{Row, Value, ValueKind, Wire};

// Re-export serde traits for handler argument types.
pub use serde::{Deserialize, Serialize};
