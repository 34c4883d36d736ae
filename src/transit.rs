//! Boxes in flight between processes, ordered by descending load.

use std::collections::BTreeSet;

use crate::error::BalanceError;
use crate::geometry::{BoxId, MeshBox};

/// Scalar work load carried by a box.
pub type LoadType = f64;

/// A box being passed along the tree edges.
///
/// Slicing a `BoxInTransit` produces pieces that all inherit the same
/// originating box, so the final destination of every piece can be
/// reported back to the origin's owner after balancing.
#[derive(Copy, Clone, Debug)]
pub struct BoxInTransit {
    /// The current box.
    pub mesh_box: MeshBox,
    /// Identity of the current box.
    pub id: BoxId,
    /// The pre-balance ancestor of this box.
    pub origin: MeshBox,
    /// Identity of the originating box.
    pub origin_id: BoxId,
    /// Work load carried.
    pub load: LoadType,
}

impl BoxInTransit {
    /// Start a box on its journey. The box is its own origin and its
    /// uniform load equals its cell count.
    pub fn from_origin(mesh_box: MeshBox, id: BoxId) -> Self {
        Self {
            mesh_box,
            id,
            origin: mesh_box,
            origin_id: id,
            load: mesh_box.num_cells() as LoadType,
        }
    }

    /// A new box continuing the history of an existing one.
    ///
    /// Used when a box is sliced: each piece keeps the origin of `other`
    /// and gets a fresh identity.
    pub fn with_new_box(other: &BoxInTransit, mesh_box: MeshBox, owner: i32, local_id: i64) -> Self {
        Self {
            mesh_box,
            id: BoxId::new(owner, local_id),
            origin: other.origin,
            origin_id: other.origin_id,
            load: mesh_box.num_cells() as LoadType,
        }
    }

    /// Take local ownership of a received box, keeping its history.
    ///
    /// Every box arriving from another process is re-identified at the
    /// receiver so box ids in a level always belong to the holding rank.
    pub fn reowned(&self, owner: i32, local_id: i64) -> Self {
        Self {
            id: BoxId::new(owner, local_id),
            ..*self
        }
    }

    /// Probe value for ordered searches at a given load.
    ///
    /// With `low_id` the probe sorts before every member of equal load,
    /// otherwise after.
    pub fn probe(load: LoadType, low_id: bool) -> Self {
        let id = if low_id {
            BoxId::min_id()
        } else {
            BoxId::max_id()
        };
        let mesh_box = MeshBox::new([0; 3], [0; 3], 0);
        Self {
            mesh_box,
            id,
            origin: mesh_box,
            origin_id: id,
            load,
        }
    }
}

// The ordering key is (load descending, id ascending). Equality follows
// the same key; within one TransitSet the id alone identifies a box.

impl PartialEq for BoxInTransit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for BoxInTransit {}

impl PartialOrd for BoxInTransit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BoxInTransit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .load
            .total_cmp(&self.load)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl std::fmt::Display for BoxInTransit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} (origin {}@{}, load {})",
            self.mesh_box, self.id, self.origin, self.origin_id, self.load
        )
    }
}

/// An ordered multiset of [BoxInTransit] with a cached load sum.
///
/// Members are kept from highest to lowest load. The cached sum equals
/// the sum of member loads at entry and exit of every operation.
#[derive(Clone, Debug, Default)]
pub struct TransitSet {
    set: BTreeSet<BoxInTransit>,
    sum_load: LoadType,
}

impl TransitSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a box. Returns false if an equal box was already present.
    pub fn insert(&mut self, item: BoxInTransit) -> bool {
        let inserted = self.set.insert(item);
        if inserted {
            self.sum_load += item.load;
        }
        inserted
    }

    /// Insert a sequence of boxes, failing fast on the first duplicate.
    ///
    /// The caller must pre-uniquify; a duplicate leaves the set with all
    /// items inserted so far.
    pub fn insert_all<I: IntoIterator<Item = BoxInTransit>>(
        &mut self,
        items: I,
    ) -> Result<(), BalanceError> {
        for item in items {
            if !self.insert(item) {
                return Err(BalanceError::DuplicateTransitBox(item.id));
            }
        }
        Ok(())
    }

    /// Remove a box. Returns true if it was present.
    pub fn remove(&mut self, item: &BoxInTransit) -> bool {
        let removed = self.set.remove(item);
        if removed {
            self.sum_load -= item.load;
        }
        removed
    }

    /// Remove and return the box with the highest load.
    pub fn pop_first(&mut self) -> Option<BoxInTransit> {
        let first = self.set.pop_first();
        if let Some(item) = first {
            self.sum_load -= item.load;
        }
        first
    }

    /// Number of boxes held.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Remove all boxes.
    pub fn clear(&mut self) {
        self.set.clear();
        self.sum_load = 0.0;
    }

    /// Exchange contents with another set in O(1).
    pub fn swap(&mut self, other: &mut TransitSet) {
        std::mem::swap(self, other);
    }

    /// Cached sum of member loads.
    pub fn sum_load(&self) -> LoadType {
        self.sum_load
    }

    /// Iterate from highest to lowest load.
    pub fn iter(&self) -> impl Iterator<Item = &BoxInTransit> {
        self.set.iter()
    }

    /// The member with the highest load.
    pub fn first(&self) -> Option<&BoxInTransit> {
        self.set.first()
    }

    /// The member with the highest load not exceeding `load`, if any.
    pub fn largest_not_above(&self, load: LoadType) -> Option<&BoxInTransit> {
        self.set
            .range(BoxInTransit::probe(load, true)..)
            .next()
    }

    /// The member with the lowest load strictly above `load`, if any.
    pub fn smallest_above(&self, load: LoadType) -> Option<&BoxInTransit> {
        self.set
            .range(..BoxInTransit::probe(load, true))
            .next_back()
    }

    /// The member whose load is closest to `target`, subject to the load
    /// not exceeding `cap`.
    pub fn closest_to(&self, target: LoadType, cap: LoadType) -> Option<BoxInTransit> {
        let below = self.largest_not_above(target.min(cap)).copied();
        let above = self
            .smallest_above(target)
            .filter(|b| b.load <= cap)
            .copied();
        match (below, above) {
            (Some(b), Some(a)) => {
                if (a.load - target).abs() < (target - b.load).abs() {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    /// Recompute the load sum from scratch. For validation only.
    pub fn computed_sum_load(&self) -> LoadType {
        self.set.iter().map(|b| b.load).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn transit(owner: i32, local_id: i64, extent: i32) -> BoxInTransit {
        let mesh_box = MeshBox::new([0, 0, 0], [extent, 1, 1], 0);
        BoxInTransit::from_origin(mesh_box, BoxId::new(owner, local_id))
    }

    #[test]
    fn test_order_is_descending_load() {
        let mut set = TransitSet::new();
        set.insert(transit(0, 0, 5));
        set.insert(transit(0, 1, 20));
        set.insert(transit(0, 2, 10));

        let loads: Vec<f64> = set.iter().map(|b| b.load).collect();
        assert_eq!(loads, vec![20.0, 10.0, 5.0]);
    }

    #[test]
    fn test_equal_load_ties_break_on_id() {
        let mut set = TransitSet::new();
        set.insert(transit(1, 0, 8));
        set.insert(transit(0, 3, 8));

        let ids: Vec<BoxId> = set.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![BoxId::new(0, 3), BoxId::new(1, 0)]);
    }

    #[test]
    fn test_sum_load_tracks_membership() {
        let mut set = TransitSet::new();
        let a = transit(0, 0, 5);
        let b = transit(0, 1, 7);
        set.insert(a);
        set.insert(b);
        assert_eq!(set.sum_load(), 12.0);
        assert_eq!(set.sum_load(), set.computed_sum_load());

        set.remove(&a);
        assert_eq!(set.sum_load(), 7.0);

        set.pop_first();
        assert_eq!(set.sum_load(), 0.0);
        assert!(set.is_empty());
    }

    #[test]
    fn test_insert_all_rejects_duplicates() {
        let mut set = TransitSet::new();
        let a = transit(0, 0, 5);
        let result = set.insert_all([a, transit(0, 1, 6), a]);
        assert!(matches!(
            result,
            Err(BalanceError::DuplicateTransitBox(id)) if id == BoxId::new(0, 0)
        ));
    }

    #[test]
    fn test_swap_is_total() {
        let mut a = TransitSet::new();
        let mut b = TransitSet::new();
        a.insert(transit(0, 0, 5));
        b.insert(transit(0, 1, 7));
        b.insert(transit(0, 2, 9));

        a.swap(&mut b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.sum_load(), 16.0);
        assert_eq!(b.len(), 1);
        assert_eq!(b.sum_load(), 5.0);
    }

    #[test]
    fn test_sum_load_under_random_churn() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut set = TransitSet::new();
        let mut live = Vec::new();
        for i in 0..200 {
            let item = transit(0, i, rng.gen_range(1..50));
            set.insert(item);
            live.push(item);
        }

        for _ in 0..100 {
            let index = rng.gen_range(0..live.len());
            let item = live.swap_remove(index);
            assert!(set.remove(&item));
            assert_eq!(set.sum_load(), set.computed_sum_load());
        }
        assert_eq!(set.len(), 100);
    }

    #[test]
    fn test_closest_to() {
        let mut set = TransitSet::new();
        set.insert(transit(0, 0, 4));
        set.insert(transit(0, 1, 10));
        set.insert(transit(0, 2, 25));

        // Nearest to 8 with no cap constraint is the 10-cell box.
        let best = set.closest_to(8.0, f64::MAX).unwrap();
        assert_eq!(best.load, 10.0);

        // A cap below 10 forces the 4-cell box.
        let best = set.closest_to(8.0, 9.0).unwrap();
        assert_eq!(best.load, 4.0);

        // Nothing fits under a tiny cap.
        assert!(set.closest_to(8.0, 3.0).is_none());
    }
}
