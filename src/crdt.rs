use crate::error::Result;

/// Core trait that all replicas implement.
///
/// Replicas synchronize by exchanging deltas. A full-state delta merged into
/// another replica brings it up to date with the sender.
///
/// # Properties
///
/// All implementations must satisfy:
/// - **Commutativity:** applying deltas in either order gives the same state
/// - **Associativity:** grouping of merges does not matter
/// - **Idempotency:** applying the same delta twice changes nothing
pub trait Crdt {
    /// The delta type exchanged between replicas.
    type Delta;

    /// Every live operation of this replica as one delta.
    fn state_delta(&self) -> Result<Self::Delta>;

    /// Merge a delta received from another replica.
    fn apply_delta(&mut self, delta: Self::Delta) -> Result<()>;

    /// Merge another replica's state into this one.
    fn merge(&mut self, other: &Self) -> Result<()> {
        let delta = other.state_delta()?;
        self.apply_delta(delta)
    }
}
