//! Replica configuration.
//!
//! Options deserialize with defaults for any missing field, so a host can
//! load them from its own configuration file:
//!
//! ```
//! use observed_remove::{BatchPolicy, Options, SignedOptions};
//!
//! let options: Options = serde_json::from_str(r#"{"max_age": 60000}"#).unwrap();
//! assert_eq!(options.max_age, 60_000);
//! assert_eq!(options.buffer_publishing, 30);
//!
//! let signed: SignedOptions =
//!     serde_json::from_str(r#"{"buffer_publishing": 0, "batch_policy": "prefix"}"#).unwrap();
//! assert_eq!(signed.base.buffer_publishing, 0);
//! assert_eq!(signed.batch_policy, BatchPolicy::Prefix);
//! ```

use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Default tombstone retention in milliseconds.
pub const DEFAULT_MAX_AGE: u64 = 5_000;

/// Default publish coalescing window in milliseconds.
pub const DEFAULT_BUFFER_PUBLISHING: u64 = 30;

/// Options shared by every replica type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Tombstone retention in milliseconds.
    ///
    /// Must exceed the longest expected delivery delay between replicas:
    /// once a tombstone is flushed, a late insertion carrying its identifier
    /// is no longer suppressed.
    pub max_age: u64,
    /// Window in milliseconds over which local mutations are coalesced into
    /// one published batch. `0` publishes every mutation synchronously.
    pub buffer_publishing: u64,
}

impl Options {
    /// Set the tombstone retention.
    #[must_use]
    pub fn with_max_age(mut self, max_age: u64) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the publish coalescing window.
    #[must_use]
    pub fn with_buffer_publishing(mut self, buffer_publishing: u64) -> Self {
        self.buffer_publishing = buffer_publishing;
        self
    }

    pub(crate) fn buffer_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_publishing)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            buffer_publishing: DEFAULT_BUFFER_PUBLISHING,
        }
    }
}

/// What a signed replica does with a batch containing an invalid operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPolicy {
    /// Verify the whole batch first and merge nothing if any operation fails.
    #[default]
    Atomic,
    /// Merge the operations preceding the first failure, then report it.
    ///
    /// Insertions precede deletions.
    Prefix,
}

/// Options for signed replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignedOptions {
    /// Retention and buffering.
    #[serde(flatten)]
    pub base: Options,
    /// Handling of batches with an invalid operation.
    pub batch_policy: BatchPolicy,
}

impl SignedOptions {
    /// Set the retention and buffering options.
    #[must_use]
    pub fn with_options(mut self, base: Options) -> Self {
        self.base = base;
        self
    }

    /// Set the batch policy.
    #[must_use]
    pub fn with_batch_policy(mut self, batch_policy: BatchPolicy) -> Self {
        self.batch_policy = batch_policy;
        self
    }
}
