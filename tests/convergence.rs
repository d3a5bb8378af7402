//! Integration tests verifying replica convergence.
//!
//! Replicas that have seen the same operations must hold the same state,
//! whatever the order or multiplicity of delivery.

use std::cell::Cell;

use observed_remove::prelude::*;
use observed_remove::{Blake3Hasher, TimeId, TimeIdGenerator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type Map = ObservedRemoveMap<String, i32>;

fn map() -> Map {
    ObservedRemoveMap::with_options(Options::default().with_buffer_publishing(0))
}

fn key(k: &str) -> String {
    k.to_string()
}

#[test]
fn causally_later_write_wins_and_delete_propagates() {
    let mut a = map();
    let mut b = map();

    a.set(key("a"), 1).unwrap();
    b.merge(&a).unwrap();
    b.set(key("a"), 2).unwrap();

    a.merge(&b).unwrap();
    assert_eq!(a.get(&key("a")), Some(&2));

    // A's tombstone targets B's winning identifier
    assert!(a.delete(&key("a")));
    b.merge(&a).unwrap();
    assert!(!b.has(&key("a")));
    assert!(!a.has(&key("a")));
}

#[test]
fn three_way_convergence() {
    let mut a = map();
    let mut b = map();
    let mut c = map();

    a.set(key("x"), 1).unwrap();
    b.set(key("x"), 2).unwrap();
    c.set(key("y"), 3).unwrap();
    b.delete(&key("x"));

    // Merge in different orders
    let mut order1 = map();
    order1.merge(&a).unwrap();
    order1.merge(&b).unwrap();
    order1.merge(&c).unwrap();

    let mut order2 = map();
    order2.merge(&c).unwrap();
    order2.merge(&b).unwrap();
    order2.merge(&a).unwrap();

    let mut order3 = map();
    order3.merge(&b).unwrap();
    order3.merge(&c).unwrap();
    order3.merge(&a).unwrap();

    assert_eq!(order1.dump(), order2.dump());
    assert_eq!(order2.dump(), order3.dump());
}

#[test]
fn merge_is_idempotent() {
    let mut a = map();
    a.set(key("x"), 1).unwrap();
    a.set(key("y"), 2).unwrap();
    a.delete(&key("y"));

    let mut b = map();
    b.merge(&a).unwrap();
    let once = b.dump();
    b.merge(&a).unwrap();
    b.merge(&a).unwrap();
    assert_eq!(b.dump(), once);
    assert_eq!(b.dump(), a.dump());
}

#[test]
fn merge_is_commutative() {
    let mut a = map();
    let mut b = map();
    a.set(key("k"), 10).unwrap();
    b.set(key("k"), 20).unwrap();

    let mut ab = map();
    ab.merge(&a).unwrap();
    ab.merge(&b).unwrap();

    let mut ba = map();
    ba.merge(&b).unwrap();
    ba.merge(&a).unwrap();

    assert_eq!(ab.get(&key("k")), ba.get(&key("k")));
    assert_eq!(ab.dump(), ba.dump());
}

#[test]
fn concurrent_insert_survives_remove() {
    // The classic observed-remove scenario: a removal only covers what the
    // remover had seen.
    let mut alice = map();
    alice.set(key("item"), 1).unwrap();

    let mut bob = map();
    bob.merge(&alice).unwrap();

    alice.delete(&key("item"));
    bob.set(key("item"), 2).unwrap();

    alice.merge(&bob).unwrap();
    bob.merge(&alice).unwrap();

    assert_eq!(alice.get(&key("item")), Some(&2));
    assert_eq!(bob.get(&key("item")), Some(&2));
}

#[test]
fn set_convergence_with_concurrent_ops() {
    let options = Options::default().with_buffer_publishing(0);
    let mut a: ObservedRemoveSet<String> = ObservedRemoveSet::with_options(options);
    let mut b: ObservedRemoveSet<String> = ObservedRemoveSet::with_options(options);

    a.add(key("apple")).unwrap();
    a.add(key("banana")).unwrap();
    b.merge(&a).unwrap();

    a.delete(&key("apple")).unwrap();
    b.add(key("cherry")).unwrap();

    a.merge(&b).unwrap();
    b.merge(&a).unwrap();

    for s in [&a, &b] {
        assert!(!s.has(&key("apple")).unwrap());
        assert!(s.has(&key("banana")).unwrap());
        assert!(s.has(&key("cherry")).unwrap());
    }
    assert_eq!(a.dump(), b.dump());
}

#[test]
fn published_batches_replicate() {
    let mut a = map();
    let mut b = map();
    let mut rx = a.subscribe_publish();

    a.set(key("x"), 1).unwrap();
    a.set(key("y"), 2).unwrap();
    a.delete(&key("x"));

    while let Ok(delta) = rx.try_recv() {
        b.process(delta).unwrap();
    }
    assert_eq!(b.dump(), a.dump());
}

#[test]
fn hundred_replicas_gossip_with_random_delay() {
    const REPLICAS: usize = 100;
    let mut rng = StdRng::seed_from_u64(7);
    let mut replicas: Vec<Map> = (0..REPLICAS).map(|_| map()).collect();
    for (i, replica) in replicas.iter_mut().enumerate() {
        replica.set(format!("key-{i}"), i as i32).unwrap();
    }
    let expected: Vec<String> = {
        let mut keys: Vec<String> = (0..REPLICAS).map(|i| format!("key-{i}")).collect();
        keys.sort();
        keys
    };

    // (deliver_at, target, batch)
    let mut in_flight: Vec<(u64, usize, Delta<String, i32, u64>)> = Vec::new();
    let mut converged = false;
    for tick in 0..1_000u64 {
        for from in 0..REPLICAS {
            let to = rng.gen_range(0..REPLICAS);
            if to != from {
                let delay = rng.gen_range(0..5);
                in_flight.push((tick + delay, to, replicas[from].dump()));
            }
        }

        let (due, later): (Vec<_>, Vec<_>) =
            in_flight.into_iter().partition(|(at, _, _)| *at <= tick);
        in_flight = later;
        for (_, to, delta) in due {
            replicas[to].process(delta).unwrap();
        }

        converged = replicas
            .iter()
            .all(|r| r.keys().cloned().collect::<Vec<_>>() == expected);
        if converged {
            break;
        }
    }
    assert!(converged, "replicas did not converge");
}

thread_local! {
    static WALL_CLOCK: Cell<u64> = const { Cell::new(1_700_000_000_000) };
}

fn wall_clock() -> u64 {
    WALL_CLOCK.with(Cell::get)
}

fn advance_clock(ms: u64) {
    WALL_CLOCK.with(|t| t.set(t.get() + ms));
}

type TimeMap = ObservedRemoveMap<String, i32, TimeIdGenerator>;

fn time_map() -> TimeMap {
    ObservedRemoveMap::with_parts(
        Options::default().with_buffer_publishing(0),
        TimeIdGenerator::with_time_source(wall_clock),
        Blake3Hasher,
    )
}

#[test]
fn time_ids_order_writes_across_replicas() {
    let mut a = time_map();
    let mut b = time_map();

    a.set(key("x"), 1).unwrap();
    b.merge(&a).unwrap();
    advance_clock(5);
    b.set(key("x"), 2).unwrap();

    a.merge(&b).unwrap();
    assert_eq!(a.get(&key("x")), Some(&2));
    assert_eq!(a.winning_id(&key("x")), b.winning_id(&key("x")));

    assert!(a.delete(&key("x")));
    b.merge(&a).unwrap();
    assert!(!b.has(&key("x")));
    assert_eq!(a.dump(), b.dump());
}

#[test]
fn time_ids_travel_as_json_strings() {
    let mut a = time_map();
    a.set(key("x"), 1).unwrap();
    advance_clock(1);
    a.set(key("y"), 2).unwrap();
    a.delete(&key("y"));

    let id = a.winning_id(&key("x")).cloned().unwrap();
    let wire = serde_json::to_string(&a.dump()).unwrap();
    assert!(wire.contains(&format!("\"{}\"", id.as_str())));

    let delta: Delta<String, i32, TimeId> = serde_json::from_str(&wire).unwrap();
    let mut c = time_map();
    c.process(delta).unwrap();
    assert_eq!(c.dump(), a.dump());
    assert_eq!(c.get(&key("x")), Some(&1));
    assert!(!c.has(&key("y")));
}
