use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use super::key::{deletion_payload, insertion_payload, Signature, Verifier};
use super::SignedDelta;
use crate::crdt::Crdt;
use crate::delta::Delta;
use crate::error::{Error, OperationKind, Result};
use crate::events::Event;
use crate::hash::{Blake3Hasher, ValueHasher};
use crate::id::{IdGenerator, LamportClock};
use crate::map::ObservedRemoveMap;
use crate::options::{BatchPolicy, SignedOptions};
use crate::publish::Publisher;

/// An observed-remove map whose every operation carries a signature.
///
/// Operations are verified before they reach the underlying
/// [`ObservedRemoveMap`]; an operation that fails verification is never
/// merged and its signature is never recorded. Accepted signatures are kept
/// for as long as their operation is live, so [`dump`](Self::dump) can relay
/// another replica's operations with the original signer's proof.
///
/// Unsigned mutation is disabled: [`set`](Self::set), [`delete`](Self::delete)
/// and [`clear`](Self::clear) return [`Error::UnsupportedOperation`].
///
/// # Example
///
/// ```
/// use ed25519_dalek::SigningKey;
/// use observed_remove::prelude::*;
/// use observed_remove::signed::OperationSigner;
///
/// let key = SigningKey::from_bytes(&[9; 32]);
/// let options = SignedOptions::default().with_options(Options::default().with_buffer_publishing(0));
/// let mut map: SignedObservedRemoveMap<String, i32> =
///     SignedObservedRemoveMap::new(key.verifying_key(), options);
/// let signer = OperationSigner::new(key);
///
/// let k = "a".to_string();
/// let id = map.generate_id().unwrap();
/// let signature = signer.sign_insertion(&k, &1, &id).unwrap();
/// map.set_signed(k.clone(), 1, id, signature).unwrap();
/// assert_eq!(map.get(&k), Some(&1));
///
/// // A forged signature is rejected and nothing changes.
/// let id = map.generate_id().unwrap();
/// let forged = Signature(vec![0; 64]);
/// assert!(map.set_signed(k.clone(), 2, id, forged).is_err());
/// assert_eq!(map.get(&k), Some(&1));
/// ```
pub struct SignedObservedRemoveMap<K, V, G: IdGenerator = LamportClock, H = Blake3Hasher> {
    map: ObservedRemoveMap<K, V, G, H>,
    verifier: Box<dyn Verifier + Send + Sync>,
    batch_policy: BatchPolicy,
    /// key -> (winning id, its signature)
    insertion_signatures: BTreeMap<K, (G::Id, Signature)>,
    /// (key, tombstoned id) -> signature
    deletion_signatures: BTreeMap<(K, G::Id), Signature>,
    publisher: Publisher<SignedDelta<K, V, G::Id>>,
}

/// Extra per-insertion check run before signature verification.
pub(crate) type Precheck<K, V, H> = fn(&H, usize, &K, &V) -> Result<()>;

/// Operations of a batch that passed verification.
struct Verified<K, V, I> {
    insertions: Vec<(Signature, I, K, V)>,
    deletions: Vec<(Signature, I, K)>,
}

impl<K, V, G, H> SignedObservedRemoveMap<K, V, G, H>
where
    K: Ord + Clone + Serialize + Send + 'static,
    V: Clone + PartialEq + Serialize + Send + 'static,
    G: IdGenerator,
    G::Id: Serialize + Send + 'static,
    H: ValueHasher,
{
    /// Create an empty map that accepts operations signed for `verifier`.
    pub fn new(verifier: impl Verifier + Send + Sync + 'static, options: SignedOptions) -> Self
    where
        G: Default,
        H: Default,
    {
        Self::with_parts(verifier, options, G::default(), H::default())
    }

    /// Create an empty map with an explicit identifier generator and hasher.
    pub fn with_parts(
        verifier: impl Verifier + Send + Sync + 'static,
        options: SignedOptions,
        ids: G,
        hasher: H,
    ) -> Self {
        Self {
            map: ObservedRemoveMap::with_parts(options.base, ids, hasher),
            verifier: Box::new(verifier),
            batch_policy: options.batch_policy,
            insertion_signatures: BTreeMap::new(),
            deletion_signatures: BTreeMap::new(),
            publisher: Publisher::new(options.base.buffer_interval()),
        }
    }

    /// Replace the millisecond clock used to age tombstones.
    #[must_use]
    pub fn with_time_source(mut self, time_fn: fn() -> u64) -> Self {
        self.map = self.map.with_time_source(time_fn);
        self
    }

    /// Create a map seeded with signed `(key, value, id, signature)` entries.
    ///
    /// Every entry is verified; the first invalid one aborts construction.
    pub fn from_entries<I>(
        entries: I,
        verifier: impl Verifier + Send + Sync + 'static,
        options: SignedOptions,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V, G::Id, Signature)>,
        G: Default,
        H: Default,
    {
        let mut map = Self::new(verifier, options);
        for (key, value, id, signature) in entries {
            map.set_signed(key, value, id, signature)?;
        }
        Ok(map)
    }

    /// Allocate an identifier for an operation the caller is about to sign.
    pub fn generate_id(&mut self) -> Result<G::Id> {
        self.map.next_id()
    }

    /// Receive every subsequent [`Event`].
    pub fn subscribe(&mut self) -> UnboundedReceiver<Event<K, V>> {
        self.map.subscribe()
    }

    /// Receive every batch this replica publishes.
    pub fn subscribe_publish(&self) -> UnboundedReceiver<SignedDelta<K, V, G::Id>> {
        self.publisher.subscribe()
    }

    /// Apply a signed insertion locally and queue it for publication.
    pub fn set_signed(&mut self, key: K, value: V, id: G::Id, signature: Signature) -> Result<()> {
        let mut delta = SignedDelta::new();
        delta.insertions.push((signature, id, key, value));
        self.process_without_flush(delta.clone())?;
        self.publisher.enqueue(delta);
        Ok(())
    }

    /// Apply a signed deletion locally and queue it for publication.
    pub fn delete_signed(&mut self, key: K, id: G::Id, signature: Signature) -> Result<()> {
        let mut delta = SignedDelta::new();
        delta.deletions.push((signature, id, key));
        self.process_without_flush(delta.clone())?;
        self.publisher.enqueue(delta);
        Ok(())
    }

    /// Disabled: an unsigned insertion has no signature to relay.
    pub fn set(&mut self, _key: K, _value: V) -> Result<()> {
        Err(Error::UnsupportedOperation("set"))
    }

    /// Disabled: an unsigned deletion has no signature to relay.
    pub fn delete(&mut self, _key: &K) -> Result<bool> {
        Err(Error::UnsupportedOperation("delete"))
    }

    /// Disabled: clearing would need a fresh signature for every key.
    pub fn clear(&mut self) -> Result<()> {
        Err(Error::UnsupportedOperation("clear"))
    }

    /// Merge a signed batch, then flush expired tombstones.
    ///
    /// On an invalid signature, returns [`Error::InvalidSignature`] after
    /// merging nothing ([`BatchPolicy::Atomic`]) or the operations preceding
    /// the failure ([`BatchPolicy::Prefix`]).
    pub fn process(&mut self, delta: SignedDelta<K, V, G::Id>) -> Result<()> {
        let result = self.merge_checked(delta, None);
        self.flush();
        result
    }

    /// Merge a signed batch without flushing.
    pub fn process_without_flush(&mut self, delta: SignedDelta<K, V, G::Id>) -> Result<()> {
        self.merge_checked(delta, None)
    }

    /// Like [`process`](Self::process), running `precheck` on every insertion
    /// in the same ordered pass as signature verification.
    pub(crate) fn process_checked(
        &mut self,
        delta: SignedDelta<K, V, G::Id>,
        precheck: Precheck<K, V, H>,
    ) -> Result<()> {
        let result = self.merge_checked(delta, Some(precheck));
        self.flush();
        result
    }

    fn merge_checked(
        &mut self,
        delta: SignedDelta<K, V, G::Id>,
        precheck: Option<Precheck<K, V, H>>,
    ) -> Result<()> {
        let (verified, failure) = self.verify(delta, precheck);
        if let Some(err) = failure {
            warn!(%err, "rejecting signed operation");
            if self.batch_policy == BatchPolicy::Atomic {
                return Err(err);
            }
            self.merge_verified(verified)?;
            return Err(err);
        }
        self.merge_verified(verified)
    }

    /// Verify operations in order, stopping at the first failure.
    fn verify(
        &self,
        delta: SignedDelta<K, V, G::Id>,
        precheck: Option<Precheck<K, V, H>>,
    ) -> (Verified<K, V, G::Id>, Option<Error>) {
        let mut verified = Verified {
            insertions: Vec::with_capacity(delta.insertions.len()),
            deletions: Vec::with_capacity(delta.deletions.len()),
        };

        for (index, (signature, id, key, value)) in delta.insertions.into_iter().enumerate() {
            if let Some(check) = precheck {
                if let Err(err) = check(self.map.hasher(), index, &key, &value) {
                    return (verified, Some(err));
                }
            }
            let valid = insertion_payload(&key, &value, &id)
                .map(|payload| self.verifier.verify(&signature, &payload));
            match valid {
                Ok(true) => verified.insertions.push((signature, id, key, value)),
                Ok(false) => {
                    let err = Error::InvalidSignature {
                        operation: OperationKind::Insertion,
                        index,
                        id: format!("{id:?}"),
                    };
                    return (verified, Some(err));
                }
                Err(err) => return (verified, Some(err)),
            }
        }

        for (index, (signature, id, key)) in delta.deletions.into_iter().enumerate() {
            let valid = deletion_payload(&key, &id)
                .map(|payload| self.verifier.verify(&signature, &payload));
            match valid {
                Ok(true) => verified.deletions.push((signature, id, key)),
                Ok(false) => {
                    let err = Error::InvalidSignature {
                        operation: OperationKind::Deletion,
                        index,
                        id: format!("{id:?}"),
                    };
                    return (verified, Some(err));
                }
                Err(err) => return (verified, Some(err)),
            }
        }

        (verified, None)
    }

    fn merge_verified(&mut self, verified: Verified<K, V, G::Id>) -> Result<()> {
        let mut delta = Delta::new();
        let mut inserted = Vec::with_capacity(verified.insertions.len());
        for (signature, id, key, value) in verified.insertions {
            inserted.push((key.clone(), id.clone(), value.clone(), signature));
            delta.insertions.push((key, (id, value)));
        }
        let mut touched: Vec<K> = Vec::with_capacity(verified.deletions.len());
        for (signature, id, key) in verified.deletions {
            touched.push(key.clone());
            self.deletion_signatures
                .insert((key.clone(), id.clone()), signature);
            delta.deletions.push((id, key));
        }

        let merged = self.map.process_without_flush(delta);

        // Keep an insertion's signature only while it is the winning pair.
        for (key, id, value, signature) in inserted {
            let wins = self.map.winning_id(&key) == Some(&id) && self.map.get(&key) == Some(&value);
            if wins {
                self.insertion_signatures.insert(key, (id, signature));
            } else {
                touched.push(key);
            }
        }
        for key in touched {
            let stale = match (self.map.winning_id(&key), self.insertion_signatures.get(&key)) {
                (Some(winner), Some((signed, _))) => winner != signed,
                (None, Some(_)) => true,
                (_, None) => false,
            };
            if stale {
                self.insertion_signatures.remove(&key);
            }
        }
        merged
    }

    /// Drop expired tombstones and their signatures.
    pub fn flush(&mut self) -> usize {
        let dropped = self.map.flush();
        if dropped > 0 {
            let map = &self.map;
            self.deletion_signatures
                .retain(|(key, id), _| map.is_tombstoned(id, key));
        }
        dropped
    }

    /// Every live operation with its original signature.
    ///
    /// Returns [`Error::MissingSignature`] if a live operation has no
    /// recorded signature, which indicates a bookkeeping bug.
    pub fn dump(&self) -> Result<SignedDelta<K, V, G::Id>> {
        let state = self.map.dump();
        let mut delta = SignedDelta::new();
        for (key, (id, value)) in state.insertions {
            let signature = match self.insertion_signatures.get(&key) {
                Some((signed, signature)) if *signed == id => signature.clone(),
                _ => {
                    return Err(Error::MissingSignature {
                        operation: OperationKind::Insertion,
                        id: format!("{id:?}"),
                    })
                }
            };
            delta.insertions.push((signature, id, key, value));
        }
        for (id, key) in state.deletions {
            let Some(signature) = self.deletion_signatures.get(&(key.clone(), id.clone())) else {
                return Err(Error::MissingSignature {
                    operation: OperationKind::Deletion,
                    id: format!("{id:?}"),
                });
            };
            delta.deletions.push((signature.clone(), id, key));
        }
        Ok(delta)
    }

    /// Publish the full signed state immediately, together with anything pending.
    pub fn sync(&self) -> Result<()> {
        let delta = self.dump()?;
        self.sync_with(delta);
        Ok(())
    }

    /// Publish `delta` immediately, together with anything pending.
    pub fn sync_with(&self, delta: SignedDelta<K, V, G::Id>) {
        debug!("explicit signed sync");
        self.publisher.publish_now(delta);
    }

    /// Operations queued but not yet published.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.publisher.pending_len()
    }

    /// The configured batch policy.
    #[must_use]
    pub fn batch_policy(&self) -> BatchPolicy {
        self.batch_policy
    }
}

impl<K: Ord, V, G: IdGenerator, H> SignedObservedRemoveMap<K, V, G, H> {
    /// The winning value for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn has(&self, key: &K) -> bool {
        self.map.has(key)
    }

    /// Number of present keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no key is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over present entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    /// Iterate over present keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    /// Iterate over present values in key order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map.values()
    }

    /// The unsigned map underneath.
    #[must_use]
    pub fn as_map(&self) -> &ObservedRemoveMap<K, V, G, H> {
        &self.map
    }

    /// Number of signatures held for insertions and deletions.
    #[must_use]
    pub fn signature_count(&self) -> (usize, usize) {
        (self.insertion_signatures.len(), self.deletion_signatures.len())
    }
}

impl<K, V, G, H> Crdt for SignedObservedRemoveMap<K, V, G, H>
where
    K: Ord + Clone + Serialize + Send + 'static,
    V: Clone + PartialEq + Serialize + Send + 'static,
    G: IdGenerator,
    G::Id: Serialize + Send + 'static,
    H: ValueHasher,
{
    type Delta = SignedDelta<K, V, G::Id>;

    fn state_delta(&self) -> Result<Self::Delta> {
        self.dump()
    }

    fn apply_delta(&mut self, delta: Self::Delta) -> Result<()> {
        self.process(delta)
    }
}
