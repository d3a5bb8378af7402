//! # observed-remove
//!
//! Observed-remove map and set CRDTs with delta synchronization and an
//! optional signed-operation layer.
//!
//! Replicas are updated independently and exchange batches of insertions
//! and deletions. Merging is commutative, associative and idempotent, so
//! replicas that have seen the same operations hold the same state no matter
//! the order or multiplicity of delivery.
//!
//! ## Quick Start
//!
//! ```
//! use observed_remove::prelude::*;
//!
//! let options = Options::default().with_buffer_publishing(0);
//! let mut alice: ObservedRemoveMap<String, String> = ObservedRemoveMap::with_options(options);
//! let mut bob: ObservedRemoveMap<String, String> = ObservedRemoveMap::with_options(options);
//!
//! alice.set("greeting".into(), "hello".into()).unwrap();
//! bob.merge(&alice).unwrap();
//! assert_eq!(bob.get(&"greeting".to_string()), Some(&"hello".to_string()));
//! ```
//!
//! ## Available replicas
//!
//! - [`ObservedRemoveMap`] - one winning value per key; deletions remove
//!   only what they observed
//! - [`ObservedRemoveSet`] - elements keyed by content [`Digest`]
//! - [`SignedObservedRemoveMap`] and [`SignedObservedRemoveSet`] - every
//!   operation carries a signature that is verified before merging
//!
//! ## Synchronization
//!
//! Local mutations are batched into a [`Delta`] and delivered to
//! [`ObservedRemoveMap::subscribe_publish`] receivers, either immediately or
//! after [`Options::buffer_publishing`] milliseconds on a tokio runtime.
//! Inbound batches are merged with `process`. Transport is left to the
//! caller.
//!
//! ## Identifiers
//!
//! Operations are ordered by identifiers from an [`IdGenerator`]. The
//! default is a [`LamportClock`]; [`TimeIdGenerator`] produces sortable
//! time-based string identifiers instead.

#![warn(missing_docs)]

mod crdt;
mod delta;
mod error;
mod events;
mod hash;
pub mod id;
mod map;
mod options;
mod publish;
mod set;
pub mod signed;

pub mod prelude;

pub use crdt::Crdt;
pub use delta::{Batch, Deletion, Delta, Insertion};
pub use error::{Error, OperationKind, Result};
pub use events::Event;
pub use hash::{canonical_bytes, Blake3Hasher, Digest, ValueHasher};
pub use id::{IdGenerator, LamportClock, TimeId, TimeIdGenerator};
pub use map::ObservedRemoveMap;
pub use options::{BatchPolicy, Options, SignedOptions};
pub use set::ObservedRemoveSet;
pub use signed::{SignedDelta, SignedObservedRemoveMap, SignedObservedRemoveSet};
