//! Signed replicas.
//!
//! Every insertion and deletion carries a signature by the holder of a
//! private key, and replicas only admit operations that verify against the
//! matching public key. Replicas never re-sign: relayed operations keep the
//! original signature.
//!
//! ```text
//! insertion on the wire: [signature, id, key, value]
//! deletion on the wire:  [signature, id, key]
//! ```

mod key;
mod map;
mod set;

use serde::{Deserialize, Serialize};

use crate::delta::Batch;

pub use key::{
    deletion_payload, insertion_payload, verifying_key_from, KeyFormat, OperationSigner, Signature,
    Signer, Verifier,
};
pub use map::SignedObservedRemoveMap;
pub use set::SignedObservedRemoveSet;

/// A signed insertion on the wire.
pub type SignedInsertion<K, V, I> = (Signature, I, K, V);

/// A signed deletion on the wire.
pub type SignedDeletion<K, I> = (Signature, I, K);

/// A batch of signed insertions and deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDelta<K, V, I> {
    /// Signed insertions, in emission order.
    pub insertions: Vec<SignedInsertion<K, V, I>>,
    /// Signed deletions, in emission order.
    pub deletions: Vec<SignedDeletion<K, I>>,
}

impl<K, V, I> SignedDelta<K, V, I> {
    /// An empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            insertions: Vec::new(),
            deletions: Vec::new(),
        }
    }
}

impl<K, V, I> Default for SignedDelta<K, V, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, I> Batch for SignedDelta<K, V, I> {
    fn append(&mut self, mut other: Self) {
        self.insertions.append(&mut other.insertions);
        self.deletions.append(&mut other.deletions);
    }

    fn len(&self) -> usize {
        self.insertions.len() + self.deletions.len()
    }
}
