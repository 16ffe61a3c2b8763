//! In-process async-call throughput benchmark.
//!
//! Every rank sends `--messages` calls spread round-robin over the other ranks;
//! with `--relay`, each receiving handler forwards the call once more, so the
//! barrier has to drain a second wave of handler-issued work.
//!
//! Usage:
//!     cargo run --release --bin fanout_bench -- --ranks 4 --messages 1000000
//!
//! Batching is tuned through `HYADES_BATCH_BYTES`, `HYADES_FLUSH_INTERVAL_US`
//! and `HYADES_PROGRESS_EVERY`.

use std::process;
use std::sync::Arc;

use minstant::Instant;

use hyades::{Comm, CommError, Config, LocalWorld, Registry, Stats};

const DEFAULT_RANKS: usize = 4;
const DEFAULT_MESSAGES: u64 = 1 << 20;
const DEFAULT_PAYLOAD: usize = 8;

#[derive(Debug)]
struct BenchArgs {
    ranks: usize,
    messages: u64,
    payload: usize,
    relay: bool,
    pin: bool,
}

#[derive(Default)]
struct Sink {
    received: u64,
    checksum: u64,
}

fn main() {
    hyades::init_tracing();
    let args: Vec<String> = std::env::args().collect();
    let bench = match parse_args(&args) {
        Ok(bench) => bench,
        Err(e) => {
            eprintln!("fanout_bench: {e}");
            print_usage();
            process::exit(2);
        }
    };
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fanout_bench: {e}");
            process::exit(2);
        }
    };
    if let Err(e) = run(&bench, &config) {
        eprintln!("fanout_bench: {e}");
        process::exit(1);
    }
}

fn run(bench: &BenchArgs, config: &Config) -> Result<(), CommError> {
    let mut registry = Registry::<Sink>::new();
    let sink = registry.register("sink", |_comm, state: &mut Sink, payload: Vec<u8>| {
        state.received += 1;
        state.checksum = state.checksum.wrapping_add(payload.len() as u64);
    });
    let relay = registry.register("relay", move |comm: &Comm<Sink>, state: &mut Sink, payload: Vec<u8>| {
        state.received += 1;
        let next = (comm.rank() + 1) % comm.size();
        comm.async_call(next, sink, &payload);
    });
    let table = registry.freeze();

    println!(
        "fanout_bench: {} ranks, {} messages/rank, {} byte payload, relay={}, batch={}B",
        bench.ranks, bench.messages, bench.payload, bench.relay, config.batch_bytes
    );

    let world = LocalWorld::new(bench.ranks).pinned(bench.pin);
    let results = world.run(|transport| -> Result<(Stats, f64), CommError> {
        let comm = Comm::new(transport, Arc::clone(&table), Sink::default(), config.clone())?;
        let payload = vec![0xA5u8; bench.payload];
        let handler = if bench.relay { relay } else { sink };
        let peers = comm.size().saturating_sub(1).max(1);

        comm.barrier();
        let start = Instant::now();
        for i in 0..bench.messages {
            let hop = 1 + (i as usize % peers);
            comm.async_call((comm.rank() + hop) % comm.size(), handler, &payload);
        }
        comm.barrier();
        let elapsed = start.elapsed().as_secs_f64();

        let received = comm.with_state(|s| s.received);
        let total = comm.sum(received);
        let expected = bench.messages * comm.size() as u64 * if bench.relay { 2 } else { 1 };
        assert_eq!(total, expected, "lost or duplicated calls");
        Ok((comm.stats(), comm.max(elapsed)))
    });

    let mut total = Stats::default();
    let mut elapsed: f64 = 0.0;
    for result in results {
        let (stats, secs) = result?;
        total = total.merge(&stats);
        elapsed = elapsed.max(secs);
    }
    let calls = total.async_count as f64;
    println!("  {total}");
    println!(
        "  {:.3} s, {:.2} M calls/s, {:.1} envelopes/packet",
        elapsed,
        calls / elapsed / 1e6,
        total.envelopes_per_packet().unwrap_or(0.0)
    );
    Ok(())
}

fn parse_args(args: &[String]) -> Result<BenchArgs, String> {
    let mut bench = BenchArgs {
        ranks: DEFAULT_RANKS,
        messages: DEFAULT_MESSAGES,
        payload: DEFAULT_PAYLOAD,
        relay: false,
        pin: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--ranks" | "-n" => bench.ranks = value(args, &mut i)?,
            "--messages" | "-m" => bench.messages = value(args, &mut i)?,
            "--payload" | "-p" => bench.payload = value(args, &mut i)?,
            "--relay" => bench.relay = true,
            "--pin" => bench.pin = true,
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }
    if bench.ranks == 0 {
        return Err("--ranks must be at least 1".into());
    }
    Ok(bench)
}

fn value<T: std::str::FromStr>(args: &[String], i: &mut usize) -> Result<T, String> {
    let flag = &args[*i];
    *i += 1;
    let raw = args
        .get(*i)
        .ok_or_else(|| format!("missing value for {flag}"))?;
    raw.parse()
        .map_err(|_| format!("invalid value {raw:?} for {flag}"))
}

fn print_usage() {
    eprintln!(
        r#"fanout_bench - hyades in-process async-call benchmark

USAGE:
    fanout_bench [OPTIONS]

OPTIONS:
    -n, --ranks <N>       Ranks (threads) in the world (default: 4)
    -m, --messages <N>    Calls issued per rank (default: 1048576)
    -p, --payload <B>     Payload bytes per call (default: 8)
        --relay           Each handler forwards its call once more
        --pin             Pin rank threads to cores
    -h, --help            Print this help message

ENVIRONMENT:
    HYADES_BATCH_BYTES, HYADES_FLUSH_INTERVAL_US, HYADES_PROGRESS_EVERY
"#
    );
}
