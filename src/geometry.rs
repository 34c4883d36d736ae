//! Integer-lattice boxes and their identities.

use crate::constants::NDIM;
use mpi::traits::Equivalence;

/// Identity of a box: owning rank and a local id unique within that owner.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Equivalence)]
pub struct BoxId {
    /// Rank of the owning process.
    pub owner: i32,
    /// Id unique within the owning process.
    pub local_id: i64,
}

impl BoxId {
    /// Create a new box id.
    pub fn new(owner: i32, local_id: i64) -> Self {
        Self { owner, local_id }
    }

    /// Smallest possible id. Used as a probe bound in ordered searches.
    pub fn min_id() -> Self {
        Self {
            owner: i32::MIN,
            local_id: i64::MIN,
        }
    }

    /// Largest possible id. Used as a probe bound in ordered searches.
    pub fn max_id() -> Self {
        Self {
            owner: i32::MAX,
            local_id: i64::MAX,
        }
    }
}

impl std::fmt::Display for BoxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.owner, self.local_id)
    }
}

/// A half-open axis-aligned integer interval in [NDIM] dimensions.
///
/// The box covers the lattice cells with indices `lo[d] <= i < hi[d]`
/// along each axis `d`. Boxes are immutable once constructed; operations
/// that "modify" a box produce new boxes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Equivalence)]
pub struct MeshBox {
    lo: [i32; NDIM],
    hi: [i32; NDIM],
    block: i32,
}

impl MeshBox {
    /// Create a new box from its lower and upper corners.
    pub fn new(lo: [i32; NDIM], hi: [i32; NDIM], block: i32) -> Self {
        Self { lo, hi, block }
    }

    /// Lower corner.
    pub fn lo(&self) -> [i32; NDIM] {
        self.lo
    }

    /// Upper corner (exclusive).
    pub fn hi(&self) -> [i32; NDIM] {
        self.hi
    }

    /// Index of the domain block this box lives in.
    pub fn block(&self) -> i32 {
        self.block
    }

    /// Extent of the box along one axis.
    pub fn size(&self, axis: usize) -> i32 {
        self.hi[axis] - self.lo[axis]
    }

    /// Extents along all axes.
    pub fn sizes(&self) -> [i32; NDIM] {
        let mut result = [0; NDIM];
        for (axis, s) in result.iter_mut().enumerate() {
            *s = self.size(axis);
        }
        result
    }

    /// Whether the box covers no cells.
    pub fn is_empty(&self) -> bool {
        (0..NDIM).any(|axis| self.hi[axis] <= self.lo[axis])
    }

    /// Number of cells covered by the box.
    pub fn num_cells(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        (0..NDIM).map(|axis| self.size(axis) as i64).product()
    }

    /// Intersection with another box. Empty if the blocks differ.
    pub fn intersection(&self, other: &MeshBox) -> MeshBox {
        let mut lo = [0; NDIM];
        let mut hi = [0; NDIM];
        for axis in 0..NDIM {
            lo[axis] = self.lo[axis].max(other.lo[axis]);
            hi[axis] = self.hi[axis].min(other.hi[axis]).max(lo[axis]);
        }
        if self.block != other.block {
            hi = lo;
        }
        MeshBox::new(lo, hi, self.block)
    }

    /// Whether this box contains every cell of `other`.
    pub fn contains(&self, other: &MeshBox) -> bool {
        self.block == other.block
            && (0..NDIM)
                .all(|axis| self.lo[axis] <= other.lo[axis] && other.hi[axis] <= self.hi[axis])
    }

    /// Whether the two boxes share at least one cell.
    pub fn intersects(&self, other: &MeshBox) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Total surface area of the box, in faces of unit cells.
    pub fn surface_area(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        let mut area = 0;
        for axis in 0..NDIM {
            let mut face = 1_i64;
            for other in 0..NDIM {
                if other != axis {
                    face *= self.size(other) as i64;
                }
            }
            area += 2 * face;
        }
        area
    }

    /// Ratio of the longest edge to the shortest edge.
    pub fn aspect_ratio(&self) -> f64 {
        let sizes = self.sizes();
        let longest = sizes.iter().copied().max().unwrap();
        let shortest = sizes.iter().copied().min().unwrap();
        if shortest <= 0 {
            return f64::INFINITY;
        }
        longest as f64 / shortest as f64
    }

    /// Split the box at an absolute plane index along one axis.
    ///
    /// Returns the lower part `[lo, plane)` and the upper part
    /// `[plane, hi)`. The plane must lie strictly inside the box.
    pub fn slice_at(&self, axis: usize, plane: i32) -> (MeshBox, MeshBox) {
        debug_assert!(self.lo[axis] < plane && plane < self.hi[axis]);
        let mut lower_hi = self.hi;
        lower_hi[axis] = plane;
        let mut upper_lo = self.lo;
        upper_lo[axis] = plane;
        (
            MeshBox::new(self.lo, lower_hi, self.block),
            MeshBox::new(upper_lo, self.hi, self.block),
        )
    }
}

impl std::fmt::Display for MeshBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[({},{},{})-({},{},{})/b{}]",
            self.lo[0], self.lo[1], self.lo[2], self.hi[0], self.hi[1], self.hi[2], self.block
        )
    }
}

impl std::fmt::Debug for MeshBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cell_count_and_sizes() {
        let b = MeshBox::new([0, 0, 0], [4, 3, 2], 0);
        assert_eq!(b.sizes(), [4, 3, 2]);
        assert_eq!(b.num_cells(), 24);
        assert!(!b.is_empty());

        let empty = MeshBox::new([1, 0, 0], [1, 5, 5], 0);
        assert!(empty.is_empty());
        assert_eq!(empty.num_cells(), 0);
    }

    #[test]
    fn test_intersection() {
        let a = MeshBox::new([0, 0, 0], [10, 10, 10], 0);
        let b = MeshBox::new([5, 5, 5], [15, 15, 15], 0);
        let c = a.intersection(&b);
        assert_eq!(c.lo(), [5, 5, 5]);
        assert_eq!(c.hi(), [10, 10, 10]);
        assert_eq!(c.num_cells(), 125);

        // Disjoint boxes intersect in an empty box.
        let d = MeshBox::new([20, 20, 20], [30, 30, 30], 0);
        assert!(a.intersection(&d).is_empty());

        // Different blocks never intersect.
        let e = MeshBox::new([0, 0, 0], [10, 10, 10], 1);
        assert!(a.intersection(&e).is_empty());
    }

    #[test]
    fn test_surface_area() {
        let b = MeshBox::new([0, 0, 0], [2, 3, 4], 0);
        // 2 * (3*4 + 2*4 + 2*3) = 52
        assert_eq!(b.surface_area(), 52);
    }

    #[test]
    fn test_slice_at() {
        let b = MeshBox::new([0, 0, 0], [10, 4, 4], 0);
        let (lower, upper) = b.slice_at(0, 3);
        assert_eq!(lower.hi(), [3, 4, 4]);
        assert_eq!(upper.lo(), [3, 0, 0]);
        assert_eq!(lower.num_cells() + upper.num_cells(), b.num_cells());
    }

    #[test]
    fn test_aspect_ratio() {
        let cube = MeshBox::new([0, 0, 0], [4, 4, 4], 0);
        assert_eq!(cube.aspect_ratio(), 1.0);

        let slab = MeshBox::new([0, 0, 0], [8, 2, 4], 0);
        assert_eq!(slab.aspect_ratio(), 4.0);
    }

    #[test]
    fn test_box_id_ordering() {
        let a = BoxId::new(0, 5);
        let b = BoxId::new(0, 6);
        let c = BoxId::new(1, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(BoxId::min_id() < a && c < BoxId::max_id());
    }
}
