//! Operation identifiers.
//!
//! Every insertion and deletion carries an identifier drawn from an
//! [`IdGenerator`]. Within one key's history a strictly greater identifier
//! wins, so the generator fixes the total order of concurrent operations.
//!
//! Two schemes are provided:
//!
//! - [`LamportClock`] (the default): a logical clock. Exact and
//!   causality-respecting, advanced past every identifier seen in a merged
//!   batch.
//! - [`TimeIdGenerator`]: 16-character base-36 strings that start with the
//!   wall-clock time. Sorting them approximates chronological order across
//!   replicas with loosely synchronized clocks.
//!
//! # Example
//!
//! ```
//! use observed_remove::id::{IdGenerator, LamportClock};
//!
//! let mut clock = LamportClock::new();
//! let a = clock.next_id().unwrap();
//! let b = clock.next_id().unwrap();
//! assert!(b > a);
//!
//! // A remote batch carried identifier 40.
//! clock.observe(&40);
//! assert_eq!(clock.next_id().unwrap(), 41);
//! ```

use core::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Source of totally ordered operation identifiers.
pub trait IdGenerator {
    /// The identifier type.
    type Id: Ord + Clone + fmt::Debug;

    /// Allocate an identifier for a local operation.
    ///
    /// Fails with [`Error::IdsExhausted`] when no identifier greater than
    /// every one seen so far can be produced.
    fn next_id(&mut self) -> Result<Self::Id>;

    /// Account for an identifier received from another replica.
    ///
    /// Called for every operation of a merged batch. Schemes without
    /// logical time may ignore it.
    fn observe(&mut self, id: &Self::Id);
}

/// Lamport-style logical clock producing `u64` identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LamportClock {
    counter: u64,
}

impl LamportClock {
    /// Create a clock starting at zero. The first identifier is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Create a clock resuming from a previously persisted value.
    #[must_use]
    pub fn starting_at(counter: u64) -> Self {
        Self { counter }
    }

    /// The last identifier handed out or observed.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.counter
    }
}

impl IdGenerator for LamportClock {
    type Id = u64;

    fn next_id(&mut self) -> Result<u64> {
        self.counter = self.counter.checked_add(1).ok_or(Error::IdsExhausted)?;
        Ok(self.counter)
    }

    fn observe(&mut self, id: &u64) {
        self.counter = self.counter.max(*id);
    }
}

/// Width of the base-36 timestamp prefix.
const TIMESTAMP_WIDTH: usize = 9;
/// Width of the base-36 counter segment.
const COUNTER_WIDTH: usize = 4;
/// Largest counter value representable in [`COUNTER_WIDTH`] base-36 digits.
const COUNTER_MAX: u32 = 1_679_615;
/// Total identifier length.
const ID_LEN: usize = 16;

/// A time-based identifier: timestamp, counter, random suffix, all base 36.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeId(String);

impl TimeId {
    /// Wrap an identifier received from elsewhere.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Milliseconds encoded in the timestamp prefix, if it parses.
    #[must_use]
    pub fn timestamp_ms(&self) -> Option<u64> {
        let prefix = self.0.get(..TIMESTAMP_WIDTH)?;
        u64::from_str_radix(prefix, 36).ok()
    }
}

impl fmt::Display for TimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generator for [`TimeId`]s.
///
/// The counter wraps to zero after 1,679,615 identifiers. Generating more
/// than that within one millisecond can repeat an identifier; prefer
/// [`LamportClock`] under sustained high throughput.
#[derive(Debug, Clone)]
pub struct TimeIdGenerator {
    counter: u32,
    time_fn: fn() -> u64,
}

impl TimeIdGenerator {
    /// Create a generator reading `SystemTime`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_time_source(system_time_ms)
    }

    /// Create a generator with a custom millisecond time source.
    #[must_use]
    pub fn with_time_source(time_fn: fn() -> u64) -> Self {
        Self {
            counter: 0,
            time_fn,
        }
    }
}

impl Default for TimeIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for TimeIdGenerator {
    type Id = TimeId;

    fn next_id(&mut self) -> Result<TimeId> {
        let timestamp = padded_base36((self.time_fn)(), TIMESTAMP_WIDTH);
        let counter = padded_base36(u64::from(self.counter), COUNTER_WIDTH);
        let suffix = to_base36(rand::thread_rng().gen_range(1u64 << 52..1u64 << 53));

        self.counter = if self.counter >= COUNTER_MAX {
            0
        } else {
            self.counter + 1
        };

        let mut id = format!("{timestamp}{counter}{suffix}");
        id.truncate(ID_LEN);
        Ok(TimeId(id))
    }

    fn observe(&mut self, _id: &TimeId) {}
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

fn padded_base36(n: u64, width: usize) -> String {
    format!("{:0>width$}", to_base36(n))
}

/// Milliseconds since the Unix epoch.
pub(crate) fn system_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
