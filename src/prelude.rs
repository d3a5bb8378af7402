//! Convenient re-exports for common usage.
//!
//! ```
//! use observed_remove::prelude::*;
//! ```

pub use crate::signed::Signature;
pub use crate::BatchPolicy;
pub use crate::Crdt;
pub use crate::Delta;
pub use crate::Event;
pub use crate::ObservedRemoveMap;
pub use crate::ObservedRemoveSet;
pub use crate::Options;
pub use crate::SignedDelta;
pub use crate::SignedObservedRemoveMap;
pub use crate::SignedObservedRemoveSet;
pub use crate::SignedOptions;
