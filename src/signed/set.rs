use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use super::key::{Signature, Verifier};
use super::map::SignedObservedRemoveMap;
use super::SignedDelta;
use crate::crdt::Crdt;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::hash::{Blake3Hasher, Digest, ValueHasher};
use crate::id::{IdGenerator, LamportClock};
use crate::options::SignedOptions;

/// An observed-remove set whose every operation carries a signature.
///
/// Elements are stored under their content [`Digest`] in a
/// [`SignedObservedRemoveMap`]. Inbound insertions must declare the digest
/// of their value; a mismatch is rejected with [`Error::DigestMismatch`].
pub struct SignedObservedRemoveSet<V, G: IdGenerator = LamportClock, H = Blake3Hasher> {
    map: SignedObservedRemoveMap<Digest, V, G, H>,
}

impl<V, G, H> SignedObservedRemoveSet<V, G, H>
where
    V: Clone + PartialEq + Serialize + Send + 'static,
    G: IdGenerator,
    G::Id: Serialize + Send + 'static,
    H: ValueHasher,
{
    /// Create an empty set that accepts operations signed for `verifier`.
    pub fn new(verifier: impl Verifier + Send + Sync + 'static, options: SignedOptions) -> Self
    where
        G: Default,
        H: Default,
    {
        Self {
            map: SignedObservedRemoveMap::new(verifier, options),
        }
    }

    /// Create an empty set with an explicit identifier generator and hasher.
    pub fn with_parts(
        verifier: impl Verifier + Send + Sync + 'static,
        options: SignedOptions,
        ids: G,
        hasher: H,
    ) -> Self {
        Self {
            map: SignedObservedRemoveMap::with_parts(verifier, options, ids, hasher),
        }
    }

    /// Replace the millisecond clock used to age tombstones.
    #[must_use]
    pub fn with_time_source(self, time_fn: fn() -> u64) -> Self {
        Self {
            map: self.map.with_time_source(time_fn),
        }
    }

    /// Create a set seeded with signed `(value, id, signature)` additions.
    pub fn from_values<I>(
        values: I,
        verifier: impl Verifier + Send + Sync + 'static,
        options: SignedOptions,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (V, G::Id, Signature)>,
        G: Default,
        H: Default,
    {
        let mut set = Self::new(verifier, options);
        for (value, id, signature) in values {
            set.add_signed(value, id, signature)?;
        }
        Ok(set)
    }

    /// Allocate an identifier for an operation the caller is about to sign.
    pub fn generate_id(&mut self) -> Result<G::Id> {
        self.map.generate_id()
    }

    /// The digest under which `value` is stored.
    pub fn digest(&self, value: &V) -> Result<Digest> {
        self.map.as_map().hasher().hash(value)
    }

    /// Add a value under a signature over `(digest, value, id)`.
    pub fn add_signed(&mut self, value: V, id: G::Id, signature: Signature) -> Result<()> {
        let digest = self.digest(&value)?;
        self.map.set_signed(digest, value, id, signature)
    }

    /// Delete a value under a signature over `(digest, id)`.
    pub fn delete_signed(&mut self, value: &V, id: G::Id, signature: Signature) -> Result<()> {
        let digest = self.digest(value)?;
        self.map.delete_signed(digest, id, signature)
    }

    /// Disabled: an unsigned addition has no signature to relay.
    pub fn add(&mut self, _value: V) -> Result<()> {
        Err(Error::UnsupportedOperation("add"))
    }

    /// Disabled: an unsigned deletion has no signature to relay.
    pub fn delete(&mut self, _value: &V) -> Result<bool> {
        Err(Error::UnsupportedOperation("delete"))
    }

    /// Disabled: clearing would need a fresh signature for every element.
    pub fn clear(&mut self) -> Result<()> {
        Err(Error::UnsupportedOperation("clear"))
    }

    /// Whether `value` is present.
    pub fn has(&self, value: &V) -> Result<bool> {
        Ok(self.map.has(&self.digest(value)?))
    }

    /// Receive every subsequent [`Event`], keyed by digest.
    pub fn subscribe(&mut self) -> UnboundedReceiver<Event<Digest, V>> {
        self.map.subscribe()
    }

    /// Receive every batch this replica publishes.
    pub fn subscribe_publish(&self) -> UnboundedReceiver<SignedDelta<Digest, V, G::Id>> {
        self.map.subscribe_publish()
    }

    /// Verify and merge a signed batch, then flush expired tombstones.
    ///
    /// Each insertion's declared digest is checked just before its signature,
    /// so the error names the first failing operation. A digest mismatch is
    /// handled under the configured [`BatchPolicy`](crate::BatchPolicy)
    /// exactly like an invalid signature.
    pub fn process(&mut self, delta: SignedDelta<Digest, V, G::Id>) -> Result<()> {
        self.map.process_checked(delta, check_digest::<V, H>)
    }

    /// Every live element and tombstone with its original signature.
    pub fn dump(&self) -> Result<SignedDelta<Digest, V, G::Id>> {
        self.map.dump()
    }

    /// Drop expired tombstones and their signatures.
    pub fn flush(&mut self) -> usize {
        self.map.flush()
    }

    /// Publish the full signed state immediately.
    pub fn sync(&self) -> Result<()> {
        self.map.sync()
    }

    /// Publish `delta` immediately, together with anything pending.
    pub fn sync_with(&self, delta: SignedDelta<Digest, V, G::Id>) {
        self.map.sync_with(delta);
    }

    /// Operations queued but not yet published.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.map.pending()
    }
}

fn check_digest<V: Serialize, H: ValueHasher>(
    hasher: &H,
    index: usize,
    digest: &Digest,
    value: &V,
) -> Result<()> {
    if hasher.hash(value)? == *digest {
        Ok(())
    } else {
        Err(Error::DigestMismatch { index })
    }
}

impl<V, G: IdGenerator, H> SignedObservedRemoveSet<V, G, H> {
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

    /// The signed map underneath.
    #[must_use]
    pub fn as_map(&self) -> &SignedObservedRemoveMap<Digest, V, G, H> {
        &self.map
    }
}

impl<V, G, H> Crdt for SignedObservedRemoveSet<V, G, H>
where
    V: Clone + PartialEq + Serialize + Send + 'static,
    G: IdGenerator,
    G::Id: Serialize + Send + 'static,
    H: ValueHasher,
{
    type Delta = SignedDelta<Digest, V, G::Id>;

    fn state_delta(&self) -> Result<Self::Delta> {
        self.dump()
    }

    fn apply_delta(&mut self, delta: Self::Delta) -> Result<()> {
        self.process(delta)
    }
}
