use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::crdt::Crdt;
use crate::delta::Delta;
use crate::error::Result;
use crate::events::Event;
use crate::hash::{Blake3Hasher, Digest, ValueHasher};
use crate::id::{IdGenerator, LamportClock};
use crate::map::ObservedRemoveMap;
use crate::options::Options;

/// An observed-remove set (OR-Set).
///
/// Stored as an [`ObservedRemoveMap`] from the content [`Digest`] of each
/// element to the element itself, so merge, tombstone and flush behavior is
/// exactly the map's. Two values with the same digest are the same element.
///
/// Events carry the digest as their key.
///
/// # Example
///
/// ```
/// use observed_remove::prelude::*;
///
/// let options = Options::default().with_buffer_publishing(0);
/// let mut s1: ObservedRemoveSet<String> = ObservedRemoveSet::with_options(options);
/// s1.add("apple".into()).unwrap();
/// s1.add("banana".into()).unwrap();
/// s1.delete(&"banana".into()).unwrap();
///
/// let mut s2: ObservedRemoveSet<String> = ObservedRemoveSet::with_options(options);
/// s2.merge(&s1).unwrap();
/// assert!(s2.has(&"apple".into()).unwrap());
/// assert!(!s2.has(&"banana".into()).unwrap());
/// ```
pub struct ObservedRemoveSet<V, G: IdGenerator = LamportClock, H = Blake3Hasher> {
    map: ObservedRemoveMap<Digest, V, G, H>,
}

impl<V, G, H> ObservedRemoveSet<V, G, H>
where
    V: Clone + PartialEq + Serialize + Send + 'static,
    G: IdGenerator,
    G::Id: Send + 'static,
    H: ValueHasher,
{
    /// Create an empty set with default options.
    #[must_use]
    pub fn new() -> Self
    where
        G: Default,
        H: Default,
    {
        Self::with_options(Options::default())
    }

    /// Create an empty set.
    #[must_use]
    pub fn with_options(options: Options) -> Self
    where
        G: Default,
        H: Default,
    {
        Self {
            map: ObservedRemoveMap::with_options(options),
        }
    }

    /// Create an empty set with an explicit identifier generator and hasher.
    pub fn with_parts(options: Options, ids: G, hasher: H) -> Self {
        Self {
            map: ObservedRemoveMap::with_parts(options, ids, hasher),
        }
    }

    /// Replace the millisecond clock used to age tombstones.
    #[must_use]
    pub fn with_time_source(self, time_fn: fn() -> u64) -> Self {
        Self {
            map: self.map.with_time_source(time_fn),
        }
    }

    /// Create a set seeded with values, each applied as a local `add`.
    pub fn from_values<I>(values: I, options: Options) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        G: Default,
        H: Default,
    {
        let mut set = Self::with_options(options);
        for value in values {
            set.add(value)?;
        }
        Ok(set)
    }

    /// The digest under which `value` is stored.
    pub fn digest(&self, value: &V) -> Result<Digest> {
        self.map.hasher().hash(value)
    }

    /// Add a value.
    pub fn add(&mut self, value: V) -> Result<()> {
        let digest = self.digest(&value)?;
        self.map.set(digest, value)
    }

    /// Delete a value. Returns `false` if it was absent.
    pub fn delete(&mut self, value: &V) -> Result<bool> {
        let digest = self.digest(value)?;
        Ok(self.map.delete(&digest))
    }

    /// Whether `value` is present.
    pub fn has(&self, value: &V) -> Result<bool> {
        Ok(self.map.has(&self.digest(value)?))
    }

    /// Delete every present value.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Receive every subsequent [`Event`], keyed by digest.
    pub fn subscribe(&mut self) -> UnboundedReceiver<Event<Digest, V>> {
        self.map.subscribe()
    }

    /// Receive every batch this replica publishes.
    pub fn subscribe_publish(&self) -> UnboundedReceiver<Delta<Digest, V, G::Id>> {
        self.map.subscribe_publish()
    }

    /// Every live element and tombstone.
    #[must_use]
    pub fn dump(&self) -> Delta<Digest, V, G::Id> {
        self.map.dump()
    }

    /// Merge an inbound batch, then flush expired tombstones.
    pub fn process(&mut self, delta: Delta<Digest, V, G::Id>) -> Result<()> {
        self.map.process(delta)
    }

    /// Drop expired tombstones. Returns how many were dropped.
    pub fn flush(&mut self) -> usize {
        self.map.flush()
    }

    /// Publish the full state immediately.
    pub fn sync(&self) {
        self.map.sync();
    }

    /// Publish `delta` immediately, together with anything pending.
    pub fn sync_with(&self, delta: Delta<Digest, V, G::Id>) {
        self.map.sync_with(delta);
    }

    /// Operations queued but not yet published.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.map.pending()
    }
}

impl<V, G: IdGenerator, H> ObservedRemoveSet<V, G, H> {
    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the set has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over the elements in digest order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map.values()
    }

    /// Iterate over `(digest, element)` pairs in digest order.
    pub fn iter(&self) -> impl Iterator<Item = (&Digest, &V)> {
        self.map.iter()
    }

    /// The underlying map.
    #[must_use]
    pub fn as_map(&self) -> &ObservedRemoveMap<Digest, V, G, H> {
        &self.map
    }
}

impl<V, G, H> Default for ObservedRemoveSet<V, G, H>
where
    V: Clone + PartialEq + Serialize + Send + 'static,
    G: IdGenerator + Default,
    G::Id: Send + 'static,
    H: ValueHasher + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, G, H> Crdt for ObservedRemoveSet<V, G, H>
where
    V: Clone + PartialEq + Serialize + Send + 'static,
    G: IdGenerator,
    G::Id: Send + 'static,
    H: ValueHasher,
{
    type Delta = Delta<Digest, V, G::Id>;

    fn state_delta(&self) -> Result<Self::Delta> {
        Ok(self.dump())
    }

    fn apply_delta(&mut self, delta: Self::Delta) -> Result<()> {
        self.process(delta)
    }
}
