//! Helpers shared by the integration tests.
//!
//! Run any test with trace output:
//! ```bash
//! RUST_LOG=hyades=trace cargo test --features tracing <name> -- --nocapture
//! ```

#![allow(dead_code)]

use std::sync::{Arc, Once};

use hyades::{Comm, Config, HandlerTable, LocalTransport};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        hyades::init_tracing();
    });
}

/// World sizes every multi-rank property is checked at.
pub const SIZES: [usize; 5] = [1, 2, 3, 4, 7];

pub fn comm<S>(transport: LocalTransport, table: &Arc<HandlerTable<S>>, state: S) -> Comm<S> {
    comm_with(transport, table, state, Config::default())
}

pub fn comm_with<S>(
    transport: LocalTransport,
    table: &Arc<HandlerTable<S>>,
    state: S,
    config: Config,
) -> Comm<S> {
    Comm::new(transport, Arc::clone(table), state, config).expect("communicator")
}
