//! The per-process view of a distributed collection of boxes.

use std::collections::BTreeMap;

use crate::geometry::{BoxId, MeshBox};
use crate::transit::LoadType;

/// The boxes a process holds, keyed by their ids.
///
/// A `BoxLevel` is the balancer's input and output: the balance call
/// replaces its contents in place. The level records the size of the
/// communicator it is distributed over, so the balancer can refuse a
/// level that does not match its private communicator. Ids of locally
/// created boxes are assigned from a monotone counter so that a box id
/// is never reused within one process.
#[derive(Clone, Debug, Default)]
pub struct BoxLevel {
    rank: i32,
    comm_size: i32,
    boxes: BTreeMap<BoxId, MeshBox>,
    next_local_id: i64,
}

impl BoxLevel {
    /// Create an empty box level owned by the given rank of a
    /// communicator with `comm_size` processes.
    pub fn new(rank: i32, comm_size: i32) -> Self {
        Self {
            rank,
            comm_size,
            boxes: BTreeMap::new(),
            next_local_id: 0,
        }
    }

    /// Rank owning this view.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Size of the communicator the level is distributed over.
    pub fn comm_size(&self) -> i32 {
        self.comm_size
    }

    /// Add a box, assigning it a fresh local id. Returns the id.
    pub fn add_box(&mut self, mesh_box: MeshBox) -> BoxId {
        let id = BoxId::new(self.rank, self.next_local_id);
        self.next_local_id += 1;
        self.boxes.insert(id, mesh_box);
        id
    }

    /// Insert a box under a caller-provided id.
    ///
    /// The local id counter is advanced past the inserted id if needed so
    /// subsequent [add_box](Self::add_box) calls stay unique.
    pub fn insert_with_id(&mut self, id: BoxId, mesh_box: MeshBox) {
        if id.owner == self.rank && id.local_id >= self.next_local_id {
            self.next_local_id = id.local_id + 1;
        }
        self.boxes.insert(id, mesh_box);
    }

    /// Remove a box by id. Returns the box if it was present.
    pub fn remove(&mut self, id: &BoxId) -> Option<MeshBox> {
        self.boxes.remove(id)
    }

    /// Drop all boxes, keeping the id counter.
    pub fn clear(&mut self) {
        self.boxes.clear();
    }

    /// Number of boxes held.
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Whether the level holds no boxes.
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Iterate over the held boxes in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&BoxId, &MeshBox)> {
        self.boxes.iter()
    }

    /// Look up a box by id.
    pub fn get(&self, id: &BoxId) -> Option<&MeshBox> {
        self.boxes.get(id)
    }

    /// Reserve a fresh local id without inserting a box.
    pub fn reserve_local_id(&mut self) -> i64 {
        let id = self.next_local_id;
        self.next_local_id += 1;
        id
    }

    /// Total uniform load held: one unit per cell.
    pub fn local_load(&self) -> LoadType {
        self.boxes
            .values()
            .map(|b| b.num_cells() as LoadType)
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_and_remove() {
        let mut level = BoxLevel::new(2, 4);
        let a = level.add_box(MeshBox::new([0, 0, 0], [10, 10, 10], 0));
        let b = level.add_box(MeshBox::new([10, 0, 0], [20, 10, 10], 0));

        assert_eq!(a, BoxId::new(2, 0));
        assert_eq!(b, BoxId::new(2, 1));
        assert_eq!(level.len(), 2);
        assert_eq!(level.local_load(), 2000.0);

        level.remove(&a);
        assert_eq!(level.len(), 1);
        assert_eq!(level.local_load(), 1000.0);
    }

    #[test]
    fn test_insert_with_id_advances_counter() {
        let mut level = BoxLevel::new(0, 1);
        level.insert_with_id(BoxId::new(0, 7), MeshBox::new([0, 0, 0], [2, 2, 2], 0));
        let next = level.add_box(MeshBox::new([2, 0, 0], [4, 2, 2], 0));
        assert_eq!(next, BoxId::new(0, 8));

        // Foreign ids do not advance the local counter.
        level.insert_with_id(BoxId::new(5, 100), MeshBox::new([4, 0, 0], [6, 2, 2], 0));
        let next = level.add_box(MeshBox::new([6, 0, 0], [8, 2, 2], 0));
        assert_eq!(next, BoxId::new(0, 9));
    }
}
