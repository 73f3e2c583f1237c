//! Concurrent set of subscribed points.

use crate::point::PointId;
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Points that currently have at least one consumer wanting live values.
///
/// Mutated by point-level consumers outside the controller's lock, so every
/// operation is individually atomic. Iteration goes through
/// [`SubscriptionSet::snapshot`], which copies: a tick never observes a live
/// view of the set.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    points: RwLock<BTreeSet<PointId>>,
}

impl SubscriptionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a point. Returns `false` if it was already present.
    pub fn insert(&self, point: PointId) -> bool {
        self.points.write().insert(point)
    }

    /// Remove a point. Returns `true` if it was present.
    pub fn remove(&self, point: &PointId) -> bool {
        self.points.write().remove(point)
    }

    /// Whether a point is subscribed.
    #[must_use]
    pub fn contains(&self, point: &PointId) -> bool {
        self.points.read().contains(point)
    }

    /// Number of subscribed points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    /// Whether no point is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }

    /// Point-in-time copy of the subscribed points, in identifier order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PointId> {
        self.points.read().iter().copied().collect()
    }
}
