//! Network primitives for the TCP transport.
//!
//! Provides endpoint/rank-table types and a framed non-blocking TCP stream.
//! Currently mio-based.

pub mod endpoint;
pub mod stream;

pub use endpoint::{Endpoint, parse_rank_table};
pub use stream::{Frame, FramedStream};
