use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use core::cmp::Ordering;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace};

use crate::crdt::Crdt;
use crate::delta::Delta;
use crate::error::Result;
use crate::events::{Event, Subscribers};
use crate::hash::{Blake3Hasher, ValueHasher};
use crate::id::{system_time_ms, IdGenerator, LamportClock};
use crate::options::Options;
use crate::publish::Publisher;

/// An observed-remove map (OR-Map).
///
/// Every key holds at most one winning `(id, value)` pair. A later
/// identifier replaces an earlier one; two insertions sharing an identifier
/// are resolved by comparing value digests. A deletion leaves a tombstone
/// for the identifier it observed, which out-votes any insertion carrying
/// that identifier (or an older one) for the same key, in whatever order
/// the operations arrive.
///
/// Tombstones are kept for [`Options::max_age`] milliseconds and then
/// flushed.
///
/// # Example
///
/// ```
/// use observed_remove::prelude::*;
///
/// let options = Options::default().with_buffer_publishing(0);
/// let mut alice: ObservedRemoveMap<String, i32> = ObservedRemoveMap::with_options(options);
/// let mut bob: ObservedRemoveMap<String, i32> = ObservedRemoveMap::with_options(options);
///
/// alice.set("a".into(), 1).unwrap();
/// bob.merge(&alice).unwrap();
/// bob.set("a".into(), 2).unwrap(); // causally later
///
/// alice.merge(&bob).unwrap();
/// assert_eq!(alice.get(&"a".to_string()), Some(&2));
///
/// alice.delete(&"a".to_string());
/// bob.merge(&alice).unwrap();
/// assert!(!bob.has(&"a".to_string()));
/// ```
pub struct ObservedRemoveMap<K, V, G: IdGenerator = LamportClock, H = Blake3Hasher> {
    pairs: BTreeMap<K, (G::Id, V)>,
    /// key -> tombstoned identifiers -> time recorded (ms)
    tombstones: BTreeMap<K, BTreeMap<G::Id, u64>>,
    ids: G,
    hasher: H,
    max_age: u64,
    time_fn: fn() -> u64,
    events: Subscribers<Event<K, V>>,
    publisher: Publisher<Delta<K, V, G::Id>>,
}

impl<K, V, G, H> ObservedRemoveMap<K, V, G, H>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + PartialEq + Serialize + Send + 'static,
    G: IdGenerator,
    G::Id: Send + 'static,
    H: ValueHasher,
{
    /// Create an empty map with default options.
    #[must_use]
    pub fn new() -> Self
    where
        G: Default,
        H: Default,
    {
        Self::with_options(Options::default())
    }

    /// Create an empty map.
    #[must_use]
    pub fn with_options(options: Options) -> Self
    where
        G: Default,
        H: Default,
    {
        Self::with_parts(options, G::default(), H::default())
    }

    /// Create an empty map with an explicit identifier generator and hasher.
    pub fn with_parts(options: Options, ids: G, hasher: H) -> Self {
        Self {
            pairs: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            ids,
            hasher,
            max_age: options.max_age,
            time_fn: system_time_ms,
            events: Subscribers::default(),
            publisher: Publisher::new(options.buffer_interval()),
        }
    }

    /// Replace the millisecond clock used to age tombstones.
    #[must_use]
    pub fn with_time_source(mut self, time_fn: fn() -> u64) -> Self {
        self.time_fn = time_fn;
        self
    }

    /// Create a map seeded with entries, each applied as a local `set`.
    pub fn from_entries<I>(entries: I, options: Options) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        G: Default,
        H: Default,
    {
        let mut map = Self::with_options(options);
        for (key, value) in entries {
            map.set(key, value)?;
        }
        Ok(map)
    }

    /// Receive every subsequent [`Event`].
    pub fn subscribe(&mut self) -> UnboundedReceiver<Event<K, V>> {
        self.events.subscribe()
    }

    /// Receive every batch this replica publishes.
    pub fn subscribe_publish(&self) -> UnboundedReceiver<Delta<K, V, G::Id>> {
        self.publisher.subscribe()
    }

    /// Set `key` to `value` under a fresh identifier and queue it for publication.
    ///
    /// Fails if the value cannot be encoded when a tie-break needs its digest,
    /// or if the identifier generator is exhausted.
    pub fn set(&mut self, key: K, value: V) -> Result<()> {
        let id = self.ids.next_id()?;
        self.set_with_id(key, value, id)
    }

    /// Set `key` to `value` under a caller-chosen identifier.
    pub fn set_with_id(&mut self, key: K, value: V, id: G::Id) -> Result<()> {
        self.insert(key.clone(), value.clone(), id.clone())?;
        let mut delta = Delta::new();
        delta.insertions.push((key, (id, value)));
        self.publisher.enqueue(delta);
        Ok(())
    }

    /// Delete the winning insertion for `key` and queue the tombstone.
    ///
    /// Returns `false` if the key was absent.
    pub fn delete(&mut self, key: &K) -> bool {
        let Some(id) = self.winning_id(key).cloned() else {
            return false;
        };
        self.delete_id(id.clone(), key.clone());
        let mut delta = Delta::new();
        delta.deletions.push((id, key.clone()));
        self.publisher.enqueue(delta);
        true
    }

    /// Delete every visible key, publishing the tombstones as one batch.
    pub fn clear(&mut self) {
        let winners: Vec<_> = self
            .pairs
            .iter()
            .map(|(key, (id, _))| (id.clone(), key.clone()))
            .collect();
        if winners.is_empty() {
            return;
        }
        for (id, key) in &winners {
            self.delete_id(id.clone(), key.clone());
        }
        let mut delta = Delta::new();
        delta.deletions = winners;
        self.publisher.enqueue(delta);
    }

    /// Merge one insertion without publishing it.
    ///
    /// See the type documentation for the resolution rules.
    pub fn insert(&mut self, key: K, value: V, id: G::Id) -> Result<()> {
        self.ids.observe(&id);

        let suppressed = self
            .tombstones
            .get(&key)
            .and_then(|ids| ids.keys().next_back())
            .is_some_and(|newest| *newest >= id);
        if suppressed {
            trace!(?id, "insertion out-voted by tombstone");
            return Ok(());
        }

        match self.pairs.entry(key) {
            Entry::Vacant(slot) => {
                if !self.events.is_empty() {
                    self.events.emit(Event::Set {
                        key: slot.key().clone(),
                        value: value.clone(),
                        previous: None,
                    });
                }
                slot.insert((id, value));
            }
            Entry::Occupied(mut slot) => {
                let (current_id, current) = slot.get();
                let adopt = match id.cmp(current_id) {
                    Ordering::Less => {
                        trace!(?id, "stale insertion");
                        false
                    }
                    Ordering::Greater => true,
                    Ordering::Equal if *current == value => {
                        if !self.events.is_empty() {
                            self.events.emit(Event::Affirm {
                                key: slot.key().clone(),
                                value,
                            });
                        }
                        return Ok(());
                    }
                    Ordering::Equal => self.hasher.hash(&value)? > self.hasher.hash(current)?,
                };
                if !adopt {
                    return Ok(());
                }
                let (_, previous) = slot.insert((id, value));
                if !self.events.is_empty() {
                    let (_, value) = slot.get();
                    if *value != previous {
                        self.events.emit(Event::Set {
                            key: slot.key().clone(),
                            value: value.clone(),
                            previous: Some(previous),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Merge one deletion without publishing it.
    ///
    /// Records the tombstone `(id, key)`. The winning pair is removed if its
    /// identifier is not newer than `id`; a newer pair is a concurrent
    /// insertion the deleter never observed, and it survives.
    pub fn delete_id(&mut self, id: G::Id, key: K) {
        self.ids.observe(&id);

        let observed = self
            .pairs
            .get(&key)
            .is_some_and(|(current_id, _)| *current_id <= id);
        if observed {
            if let Some((_, value)) = self.pairs.remove(&key) {
                if !self.events.is_empty() {
                    self.events.emit(Event::Delete {
                        key: key.clone(),
                        value,
                    });
                }
            }
        }

        let now = (self.time_fn)();
        self.tombstones.entry(key).or_default().entry(id).or_insert(now);
    }

    /// Drop tombstones older than the retention window.
    ///
    /// Returns how many were dropped.
    pub fn flush(&mut self) -> usize {
        let now = (self.time_fn)();
        let max_age = self.max_age;
        let mut dropped = 0;
        self.tombstones.retain(|_, ids| {
            let before = ids.len();
            ids.retain(|_, recorded| now.saturating_sub(*recorded) <= max_age);
            dropped += before - ids.len();
            !ids.is_empty()
        });
        if dropped > 0 {
            debug!(dropped, "flushed expired tombstones");
        }
        dropped
    }

    /// Every live pair and every live tombstone.
    #[must_use]
    pub fn dump(&self) -> Delta<K, V, G::Id> {
        Delta {
            insertions: self
                .pairs
                .iter()
                .map(|(key, (id, value))| (key.clone(), (id.clone(), value.clone())))
                .collect(),
            deletions: self
                .tombstones
                .iter()
                .flat_map(|(key, ids)| ids.keys().map(move |id| (id.clone(), key.clone())))
                .collect(),
        }
    }

    /// Merge an inbound batch, then flush expired tombstones.
    pub fn process(&mut self, delta: Delta<K, V, G::Id>) -> Result<()> {
        self.process_without_flush(delta)?;
        self.flush();
        Ok(())
    }

    /// Merge an inbound batch without flushing.
    ///
    /// Deletions are recorded before insertions, so an insertion and its
    /// tombstone arriving together cancel out without a `Set` event.
    pub fn process_without_flush(&mut self, delta: Delta<K, V, G::Id>) -> Result<()> {
        trace!(
            insertions = delta.insertions.len(),
            deletions = delta.deletions.len(),
            "processing delta"
        );
        for (id, key) in delta.deletions {
            self.delete_id(id, key);
        }
        for (key, (id, value)) in delta.insertions {
            self.insert(key, value, id)?;
        }
        Ok(())
    }

    /// Publish the full state immediately, together with anything pending.
    pub fn sync(&self) {
        self.sync_with(self.dump());
    }

    /// Publish `delta` immediately, together with anything pending.
    pub fn sync_with(&self, delta: Delta<K, V, G::Id>) {
        debug!("explicit sync");
        self.publisher.publish_now(delta);
    }

    /// Operations queued but not yet published.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.publisher.pending_len()
    }

    pub(crate) fn next_id(&mut self) -> Result<G::Id> {
        self.ids.next_id()
    }
}

impl<K: Ord, V, G: IdGenerator, H> ObservedRemoveMap<K, V, G, H> {
    /// The winning value for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.pairs.get(key).map(|(_, value)| value)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn has(&self, key: &K) -> bool {
        self.pairs.contains_key(key)
    }

    /// The identifier of the winning insertion for `key`.
    #[must_use]
    pub fn winning_id(&self, key: &K) -> Option<&G::Id> {
        self.pairs.get(key).map(|(id, _)| id)
    }

    /// Whether a tombstone for `(id, key)` is held.
    #[must_use]
    pub fn is_tombstoned(&self, id: &G::Id, key: &K) -> bool {
        self.tombstones
            .get(key)
            .is_some_and(|ids| ids.contains_key(id))
    }

    /// Number of tombstones held.
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.values().map(BTreeMap::len).sum()
    }

    /// Number of present keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no key is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterate over present entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.pairs.iter().map(|(key, (_, value))| (key, value))
    }

    /// Iterate over present keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.pairs.keys()
    }

    /// Iterate over present values in key order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.pairs.values().map(|(_, value)| value)
    }

    /// The value hasher.
    pub fn hasher(&self) -> &H {
        &self.hasher
    }
}

impl<K, V, G, H> Default for ObservedRemoveMap<K, V, G, H>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + PartialEq + Serialize + Send + 'static,
    G: IdGenerator + Default,
    G::Id: Send + 'static,
    H: ValueHasher + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, G, H> Crdt for ObservedRemoveMap<K, V, G, H>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + PartialEq + Serialize + Send + 'static,
    G: IdGenerator,
    G::Id: Send + 'static,
    H: ValueHasher,
{
    type Delta = Delta<K, V, G::Id>;

    fn state_delta(&self) -> Result<Self::Delta> {
        Ok(self.dump())
    }

    fn apply_delta(&mut self, delta: Self::Delta) -> Result<()> {
        self.process(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static MOCK_TIME: Cell<u64> = const { Cell::new(1_000) };
    }

    fn mock_time() -> u64 {
        MOCK_TIME.with(Cell::get)
    }

    fn set_mock_time(ms: u64) {
        MOCK_TIME.with(|t| t.set(ms));
    }

    type Map = ObservedRemoveMap<&'static str, i32>;

    fn map() -> Map {
        Map::with_options(Options::default().with_buffer_publishing(0)).with_time_source(mock_time)
    }

    fn insertion(key: &'static str, id: u64, value: i32) -> Delta<&'static str, i32, u64> {
        let mut d = Delta::new();
        d.insertions.push((key, (id, value)));
        d
    }

    fn deletion(key: &'static str, id: u64) -> Delta<&'static str, i32, u64> {
        let mut d = Delta::new();
        d.deletions.push((id, key));
        d
    }

    #[test]
    fn new_map_is_empty() {
        let m = map();
        assert!(m.is_empty());
        assert_eq!(m.len(), 0);
        assert_eq!(m.get(&"a"), None);
    }

    #[test]
    fn set_get_delete() {
        let mut m = map();
        m.set("a", 1).unwrap();
        m.set("b", 2).unwrap();
        assert_eq!(m.get(&"a"), Some(&1));
        assert!(m.has(&"b"));
        assert_eq!(m.len(), 2);

        assert!(m.delete(&"b"));
        assert!(!m.has(&"b"));
        assert!(!m.delete(&"b"));
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![(&"a", &1)]);
    }

    #[test]
    fn later_set_supersedes() {
        let mut m = map();
        m.set("a", 1).unwrap();
        m.set("a", 2).unwrap();
        assert_eq!(m.get(&"a"), Some(&2));
        assert_eq!(m.winning_id(&"a"), Some(&2));
    }

    #[test]
    fn stale_insertion_is_ignored() {
        let mut m = map();
        m.process(insertion("a", 5, 50)).unwrap();
        m.process(insertion("a", 3, 30)).unwrap();
        assert_eq!(m.get(&"a"), Some(&50));
    }

    #[test]
    fn equal_id_conflict_is_broken_by_digest() {
        let hasher = Blake3Hasher;
        let (low, high) = if hasher.hash(&1).unwrap() < hasher.hash(&2).unwrap() {
            (1, 2)
        } else {
            (2, 1)
        };

        let mut a = map();
        a.process(insertion("k", 7, low)).unwrap();
        a.process(insertion("k", 7, high)).unwrap();

        let mut b = map();
        b.process(insertion("k", 7, high)).unwrap();
        b.process(insertion("k", 7, low)).unwrap();

        assert_eq!(a.get(&"k"), Some(&high));
        assert_eq!(b.get(&"k"), Some(&high));
    }

    #[test]
    fn tombstone_outvotes_late_insertion() {
        let mut m = map();
        m.process(deletion("a", 4)).unwrap();
        m.process(insertion("a", 4, 1)).unwrap();
        assert!(!m.has(&"a"));

        // older identifiers were superseded by the deleted insertion
        m.process(insertion("a", 3, 1)).unwrap();
        assert!(!m.has(&"a"));

        // a concurrent newer insertion survives
        m.process(insertion("a", 5, 2)).unwrap();
        assert_eq!(m.get(&"a"), Some(&2));
    }

    #[test]
    fn deleting_unobserved_id_keeps_newer_pair() {
        let mut m = map();
        m.process(insertion("a", 9, 1)).unwrap();
        m.process(deletion("a", 4)).unwrap();
        assert_eq!(m.get(&"a"), Some(&1));
        assert!(m.is_tombstoned(&4, &"a"));
    }

    #[test]
    fn insert_and_delete_in_one_batch_cancel_out() {
        let mut m = map();
        let mut rx = m.subscribe();
        let mut delta = insertion("a", 1, 1);
        delta.deletions.push((1, "a"));
        m.process(delta).unwrap();
        assert!(!m.has(&"a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn events_are_emitted() {
        let mut m = map();
        let mut rx = m.subscribe();
        m.set("a", 1).unwrap();
        m.set("a", 2).unwrap();
        m.set("a", 2).unwrap();
        m.delete(&"a");

        assert_eq!(
            rx.try_recv().unwrap(),
            Event::Set { key: "a", value: 1, previous: None }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::Set { key: "a", value: 2, previous: Some(1) }
        );
        // same value under a newer id: state changes, nothing visible does
        assert_eq!(rx.try_recv().unwrap(), Event::Delete { key: "a", value: 2 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn redelivery_affirms() {
        let mut m = map();
        m.process(insertion("a", 1, 1)).unwrap();
        let mut rx = m.subscribe();
        m.process(insertion("a", 1, 1)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Event::Affirm { key: "a", value: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tombstones_expire_after_max_age() {
        set_mock_time(10_000);
        let mut m = Map::with_options(Options::default().with_max_age(100).with_buffer_publishing(0))
            .with_time_source(mock_time);
        m.set("a", 1).unwrap();
        m.delete(&"a");

        set_mock_time(10_099);
        assert_eq!(m.flush(), 0);
        m.process(insertion("a", 1, 1)).unwrap();
        assert!(!m.has(&"a"));

        set_mock_time(10_101);
        assert_eq!(m.flush(), 1);
        assert_eq!(m.tombstone_count(), 0);
    }

    #[test]
    fn dump_contains_pairs_and_tombstones() {
        let mut m = map();
        m.set("a", 1).unwrap();
        m.set("b", 2).unwrap();
        m.delete(&"a");
        let dump = m.dump();
        assert_eq!(dump.insertions, vec![("b", (2, 2))]);
        assert_eq!(dump.deletions, vec![(1, "a")]);
    }

    #[test]
    fn clear_deletes_everything() {
        let mut m = map();
        let mut published = m.subscribe_publish();
        m.set("a", 1).unwrap();
        m.set("b", 2).unwrap();
        m.clear();
        assert!(m.is_empty());
        let _ = published.try_recv();
        let _ = published.try_recv();
        let batch = published.try_recv().unwrap();
        assert_eq!(batch.deletions, vec![(1, "a"), (2, "b")]);
    }

    #[test]
    fn processing_advances_the_clock() {
        let mut m = map();
        m.process(insertion("x", 41, 0)).unwrap();
        m.set("y", 1).unwrap();
        assert_eq!(m.winning_id(&"y"), Some(&42));
    }

    #[test]
    fn remote_max_id_does_not_break_local_writes() {
        let mut m = map();
        m.process(insertion("remote", u64::MAX, 1)).unwrap();
        assert!(matches!(m.set("local", 2), Err(crate::Error::IdsExhausted)));
        assert!(!m.has(&"local"));
        assert_eq!(m.get(&"remote"), Some(&1));

        // deletion reuses the observed id and still works
        assert!(m.delete(&"remote"));
        assert!(!m.has(&"remote"));
    }

    #[test]
    fn seeded_map() {
        let m = Map::from_entries(
            [("a", 1), ("b", 2)],
            Options::default().with_buffer_publishing(0),
        )
        .unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.values().copied().collect::<Vec<_>>(), vec![1, 2]);
    }
}
