//! Wire batches exchanged between replicas.

use serde::{Deserialize, Serialize};

/// An insertion on the wire: `[key, [id, value]]`.
pub type Insertion<K, V, I> = (K, (I, V));

/// A deletion on the wire: `[id, key]`.
pub type Deletion<K, I> = (I, K);

/// A batch of insertions and deletions.
///
/// Produced by local mutations (see `subscribe_publish`) and by `dump()`,
/// consumed by `process()`. Serialized with serde it reads
/// `{"insertions": [[key, [id, value]], ...], "deletions": [[id, key], ...]}`.
///
/// # Example
///
/// ```
/// use observed_remove::prelude::*;
///
/// let mut a: ObservedRemoveMap<String, i32> =
///     ObservedRemoveMap::with_options(Options::default().with_buffer_publishing(0));
/// a.set("x".into(), 1).unwrap();
///
/// let json = serde_json::to_string(&a.dump()).unwrap();
/// assert_eq!(json, r#"{"insertions":[["x",[1,1]]],"deletions":[]}"#);
///
/// let mut b = ObservedRemoveMap::<String, i32>::new();
/// b.process(serde_json::from_str(&json).unwrap()).unwrap();
/// assert_eq!(b.get(&"x".to_string()), Some(&1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta<K, V, I> {
    /// Insertions, in emission order.
    pub insertions: Vec<Insertion<K, V, I>>,
    /// Deletions, in emission order.
    pub deletions: Vec<Deletion<K, I>>,
}

impl<K, V, I> Delta<K, V, I> {
    /// An empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            insertions: Vec::new(),
            deletions: Vec::new(),
        }
    }
}

impl<K, V, I> Default for Delta<K, V, I> {
    fn default() -> Self {
        Self::new()
    }
}

/// A batch that can be accumulated in an outbox.
pub trait Batch: Default {
    /// Move every operation of `other` onto the end of `self`.
    fn append(&mut self, other: Self);

    /// Number of operations.
    fn len(&self) -> usize;

    /// Whether the batch holds no operations.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V, I> Batch for Delta<K, V, I> {
    fn append(&mut self, mut other: Self) {
        self.insertions.append(&mut other.insertions);
        self.deletions.append(&mut other.deletions);
    }

    fn len(&self) -> usize {
        self.insertions.len() + self.deletions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_keeps_order() {
        let mut a: Delta<&str, i32, u64> = Delta::new();
        a.insertions.push(("x", (1, 10)));
        let mut b = Delta::new();
        b.insertions.push(("y", (2, 20)));
        b.deletions.push((1, "x"));
        a.append(b);
        assert_eq!(a.insertions, vec![("x", (1, 10)), ("y", (2, 20))]);
        assert_eq!(a.deletions, vec![(1, "x")]);
        assert_eq!(a.len(), 3);
        assert!(!a.is_empty());
    }
}
