//! Content hashing of values.
//!
//! A single [`ValueHasher`] serves two purposes: set membership (a set
//! element is stored under the digest of its content) and the tie-break
//! between two insertions that share an identifier but carry different
//! values (the greater digest wins).
//!
//! Digests must agree across processes for equal logical values, so values
//! are hashed over a canonical JSON encoding in which object keys are sorted.
//! Two values whose digests collide are treated as equal.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A 32-byte content digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// The raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Deterministic content hash.
pub trait ValueHasher {
    /// Hash a value. Fails only if the value cannot be encoded.
    fn hash<T: Serialize + ?Sized>(&self, value: &T) -> Result<Digest>;
}

/// BLAKE3 over the canonical JSON encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl ValueHasher for Blake3Hasher {
    fn hash<T: Serialize + ?Sized>(&self, value: &T) -> Result<Digest> {
        let bytes = canonical_bytes(value)?;
        Ok(Digest(*blake3::hash(&bytes).as_bytes()))
    }
}

/// Encode a value as JSON with object keys sorted at every depth.
///
/// Used for hashing and as the signed payload of operations. Keys are sorted
/// explicitly rather than relying on `serde_json::Value`'s map order, which
/// keeps insertion order once any crate in the build enables serde_json's
/// `preserve_order` feature.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(item, out)?;
            }
            out.push(b'}');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}
