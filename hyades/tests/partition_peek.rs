//! Static row-group partitioning checked with async calls.
//!
//! Each rank takes the row groups `g` with `g % size == rank` without talking
//! to anyone, peeks the first row of its share, and reports it to rank 0.
//! After a barrier rank 0 must hold one distinct row per rank that owns data.

mod common;

use std::collections::HashSet;

use common::{SIZES, comm, init_test_tracing};
use hyades::{Comm, LocalWorld, Rank, Registry, Row, Value};

const ROW_GROUPS: usize = 5;
const ROWS_PER_GROUP: i64 = 3;

fn row_group(group: usize) -> Vec<Row> {
    (0..ROWS_PER_GROUP)
        .map(|i| {
            let id = group as i64 * ROWS_PER_GROUP + i;
            vec![
                Value::Int64(id),
                Value::Text(format!("group-{group}")),
                if i % 2 == 0 { Value::Float64(id as f64 / 2.0) } else { Value::Absent },
                Value::Bool(group % 2 == 0),
            ]
        })
        .collect()
}

#[derive(Default)]
struct Peeks {
    rows: Vec<(Rank, Row)>,
}

#[test]
fn peeked_rows_are_disjoint() {
    init_test_tracing();
    let mut registry = Registry::<Peeks>::new();
    let report = registry.register("report", |_comm: &Comm<Peeks>, peeks: &mut Peeks, (from, row): (Rank, Row)| {
        peeks.rows.push((from, row));
    });
    let table = registry.freeze();

    for size in SIZES {
        let results = LocalWorld::new(size).run(|transport| {
            let comm = comm(transport, &table, Peeks::default());
            let mine: Vec<usize> = (0..ROW_GROUPS).filter(|g| g % comm.size() == comm.rank()).collect();
            comm.barrier();

            if let Some(&first) = mine.first() {
                let row = row_group(first).swap_remove(0);
                comm.async_call(0, report, &(comm.rank(), row));
            }
            comm.barrier();

            let owners = comm.sum(u64::from(!mine.is_empty()));
            (owners, comm.into_state().rows)
        });

        let (owners, rows) = &results[0];
        assert_eq!(rows.len() as u64, *owners, "size {size}");
        let reporters: HashSet<Rank> = rows.iter().map(|(from, _)| *from).collect();
        assert_eq!(reporters.len(), rows.len());

        let ids: HashSet<i64> = rows
            .iter()
            .map(|(_, row)| row[0].as_i64().expect("id column"))
            .collect();
        assert_eq!(ids.len(), rows.len(), "two ranks peeked the same row");
        for (from, row) in rows {
            // Rank r owns row group r first, and its first row id is r * ROWS_PER_GROUP.
            assert_eq!(row[0], Value::Int64(*from as i64 * ROWS_PER_GROUP));
            assert_eq!(row[1].as_text(), Some(format!("group-{from}").as_str()));
            assert!(row[2].as_f64().is_some());
        }
        assert!(results[1..].iter().all(|(_, rows)| rows.is_empty()));
    }
}

#[test]
fn absent_values_survive_the_wire() {
    let mut registry = Registry::<Vec<Row>>::new();
    let keep = registry.register("keep", |_comm, kept: &mut Vec<Row>, row: Row| kept.push(row));
    let table = registry.freeze();

    let kept = LocalWorld::new(2).run(|transport| {
        let comm = comm(transport, &table, Vec::new());
        if comm.rank0() {
            for row in row_group(1) {
                comm.async_call(1, keep, &row);
            }
        }
        comm.barrier();
        comm.into_state()
    });
    assert!(kept[0].is_empty());
    assert_eq!(kept[1], row_group(1));
    assert!(kept[1][1][2].is_absent());
}
