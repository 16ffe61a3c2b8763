//! Protocol violations: detected at construction or fatal at runtime.

mod common;

use std::sync::Arc;

use common::{comm, init_test_tracing};
use hyades::transport::Transport;
use hyades::wire::{self, HandlerId, encode_envelope};
use hyades::{Comm, CommError, Config, LocalWorld, Registry};

#[test]
fn mismatched_handler_tables_are_rejected() {
    init_test_tracing();
    let mut short = Registry::<()>::new();
    short.register("a", |_comm, _state: &mut (), _: u32| {});
    let short = short.freeze();

    let mut long = Registry::<()>::new();
    long.register("a", |_comm, _state: &mut (), _: u32| {});
    long.register("b", |_comm, _state: &mut (), _: u32| {});
    let long = long.freeze();

    let outcomes = LocalWorld::new(3).run(|transport| {
        let table = if transport.rank() == 2 { &long } else { &short };
        Comm::new(transport, Arc::clone(table), (), Config::default()).err()
    });
    for outcome in outcomes {
        assert!(matches!(
            outcome,
            Some(CommError::HandlerTableMismatch { .. })
        ));
    }
}

#[test]
fn zero_batch_size_is_rejected() {
    let table = Registry::<()>::new().freeze();
    let outcome = LocalWorld::new(1).run(|transport| {
        Comm::new(transport, Arc::clone(&table), (), Config::default().with_batch_bytes(0)).err()
    });
    assert!(matches!(
        outcome[0],
        Some(CommError::Config(hyades::ConfigError::ZeroBatch))
    ));
}

/// Rank 1 joins the fingerprint exchange by hand, after slipping `packet` to rank 0.
fn rank0_receives_raw(packet: Vec<u8>) {
    let mut registry = Registry::<()>::new();
    registry.register("typed", |_comm, _state: &mut (), _: (u64, String)| {});
    let table = registry.freeze();

    LocalWorld::new(2).run(|mut transport| {
        if transport.rank() == 1 {
            transport.send(0, packet.clone()).unwrap();
            let fingerprint = wire::to_bytes(&table.fingerprint()).unwrap();
            transport.all_gather(fingerprint).unwrap();
            return;
        }
        let comm = comm(transport, &table, ());
        comm.barrier();
    });
}

#[test]
#[should_panic(expected = "unknown handler #99")]
fn unknown_handler_is_fatal() {
    let mut packet = Vec::new();
    encode_envelope(HandlerId(99), &0u8, &mut packet).unwrap();
    rank0_receives_raw(packet);
}

#[test]
#[should_panic(expected = "bad arguments for handler typed")]
fn wrong_argument_type_is_fatal() {
    let mut packet = Vec::new();
    encode_envelope(HandlerId(0), &true, &mut packet).unwrap();
    rank0_receives_raw(packet);
}

#[test]
#[should_panic(expected = "exceeds remaining")]
fn torn_packet_is_fatal() {
    let mut packet = Vec::new();
    encode_envelope(HandlerId(0), &(7u64, String::from("seven")), &mut packet).unwrap();
    packet.truncate(packet.len() - 2);
    rank0_receives_raw(packet);
}

#[test]
#[should_panic(expected = "barrier called from inside a handler")]
fn barrier_inside_handler_is_fatal() {
    let mut registry = Registry::<()>::new();
    let nested = registry.register("nested", |comm: &Comm<()>, _state: &mut (), _: ()| {
        comm.barrier();
    });
    let table = registry.freeze();

    LocalWorld::new(1).run(|transport| {
        let comm = comm(transport, &table, ());
        comm.async_call(0, nested, &());
        comm.barrier();
    });
}

#[test]
#[should_panic(expected = "rank state is already borrowed")]
fn state_access_inside_handler_is_fatal() {
    let mut registry = Registry::<u32>::new();
    let peek = registry.register("peek", |comm: &Comm<u32>, _state: &mut u32, _: ()| {
        comm.with_state(|n| *n);
    });
    let table = registry.freeze();

    LocalWorld::new(1).run(|transport| {
        let comm = comm(transport, &table, 0u32);
        comm.async_call(0, peek, &());
        comm.barrier();
    });
}

#[test]
#[should_panic(expected = "rank 3 out of range for group of 2")]
fn async_call_to_missing_rank_is_fatal() {
    let mut registry = Registry::<()>::new();
    let noop = registry.register("noop", |_comm, _state: &mut (), _: ()| {});
    let table = registry.freeze();

    LocalWorld::new(2).run(|transport| {
        let comm = comm(transport, &table, ());
        if comm.rank0() {
            comm.async_call(3, noop, &());
        }
        comm.barrier();
    });
}
