//! Geometry-aware slicing of boxes to match target loads.

use crate::constants::NDIM;
use crate::geometry::MeshBox;
use crate::params::PartitioningParams;
use crate::transit::LoadType;

/// Outcome of a successful break.
#[derive(Clone, Debug)]
pub struct BreakResult {
    /// Boxes broken off (usually just one).
    pub breakoff: Vec<MeshBox>,
    /// Remainder of the box after the breakoff is gone.
    pub leftover: Vec<MeshBox>,
    /// Load carried by the breakoff.
    pub load: LoadType,
}

/// Breaks boxes during partitioning.
///
/// Two cutting strategies are tried, a single planar cut and a multi-axis
/// corner cut, and the best result wins by lowest combined penalty. The
/// uncut box is a third alternative; it competes with its penalty scaled
/// by the pre-cut weight, so weights above one force more aggressive
/// cutting.
pub struct BalanceBoxBreaker<'a> {
    params: &'a PartitioningParams,
}

impl<'a> BalanceBoxBreaker<'a> {
    /// Create a breaker for the given parameters.
    pub fn new(params: &'a PartitioningParams) -> Self {
        Self { params }
    }

    /// Break off a given load from a box.
    ///
    /// Attempts to break off `ideal` load, or at least a load inside
    /// `[low, high]`. Returns `None` if no admissible cut exists or if
    /// keeping the box whole beats every cut.
    pub fn break_off_load(
        &self,
        mesh_box: &MeshBox,
        ideal: LoadType,
        low: LoadType,
        high: LoadType,
    ) -> Option<BreakResult> {
        debug_assert!(ideal > 0.0);

        let bad_cuts = self.find_bad_cuts(mesh_box);

        let planar = self.break_off_load_planar(mesh_box, ideal, low, high, &bad_cuts);
        let cubic = self.break_off_load_cubic(mesh_box, ideal, low, high, &bad_cuts);

        let best = match (planar, cubic) {
            (Some(p), Some(c)) => {
                // Ties go to the planar cut, which was enumerated first.
                if self.result_penalty(&c, ideal, mesh_box)
                    < self.result_penalty(&p, ideal, mesh_box)
                {
                    Some(c)
                } else {
                    Some(p)
                }
            }
            (p, c) => p.or(c),
        }?;

        // The uncut alternative is legal only when the whole load already
        // sits inside the window.
        let whole_load = mesh_box.num_cells() as LoadType;
        if low <= whole_load && whole_load <= high {
            let no_cut_penalty = self.params.precut_penalty_wt
                * self.combined_penalty(
                    (whole_load - ideal).abs(),
                    0.0,
                    self.slender_penalty(std::slice::from_ref(mesh_box)),
                );
            if no_cut_penalty <= self.result_penalty(&best, ideal, mesh_box) {
                log::debug!("break of {} rejected: uncut box wins", mesh_box);
                return None;
            }
        }

        Some(best)
    }

    /// Break the smallest admissible piece off a box that violates the
    /// maximum size along `axis`, ignoring load.
    ///
    /// Used to constrain box shapes before any load-based cutting. The
    /// cut lands on the largest admissible plane not beyond `max_size`.
    pub fn break_off_max_size(&self, mesh_box: &MeshBox, axis: usize) -> Option<(MeshBox, MeshBox)> {
        let bad_cuts = self.find_bad_cuts(mesh_box);
        let size = mesh_box.size(axis);
        let max = self.params.max_size[axis];
        let min = self.params.min_size[axis];
        debug_assert!(size > max);

        let highest = (size - min).min(max);
        let lowest = min;
        (lowest..=highest)
            .rev()
            .find(|&p| !bad_cuts[axis][p as usize])
            .map(|p| mesh_box.slice_at(axis, mesh_box.lo()[axis] + p))
    }

    /// Mark the inadmissible cut planes of a box.
    ///
    /// `result[axis][p]` is true when the relative plane `p` may not be
    /// cut: its absolute index is not a multiple of the cut factor, or it
    /// lies within the bad interval of a domain face.
    fn find_bad_cuts(&self, mesh_box: &MeshBox) -> [Vec<bool>; NDIM] {
        let mut bad: [Vec<bool>; NDIM] = Default::default();
        for axis in 0..NDIM {
            let size = mesh_box.size(axis) as usize;
            let lo = mesh_box.lo()[axis];
            let factor = self.params.cut_factor[axis];
            let interval = self.params.bad_interval[axis];

            let mut axis_bad = vec![false; size + 1];
            for (p, flag) in axis_bad.iter_mut().enumerate() {
                let abs = lo + p as i32;
                if factor > 1 && abs.rem_euclid(factor) != 0 {
                    *flag = true;
                }
            }
            if interval > 0 {
                for domain in self.params.domain_boxes_for_block(mesh_box.block()) {
                    for face in [domain.lo()[axis], domain.hi()[axis]] {
                        for (p, flag) in axis_bad.iter_mut().enumerate() {
                            let abs = lo + p as i32;
                            let dist = (abs - face).abs();
                            if dist > 0 && dist < interval {
                                *flag = true;
                            }
                        }
                    }
                }
            }
            bad[axis] = axis_bad;
        }
        bad
    }

    /// Best single-plane cut: one breakoff box and one leftover box.
    fn break_off_load_planar(
        &self,
        mesh_box: &MeshBox,
        ideal: LoadType,
        low: LoadType,
        high: LoadType,
        bad_cuts: &[Vec<bool>; NDIM],
    ) -> Option<BreakResult> {
        let whole_load = mesh_box.num_cells() as LoadType;
        let mut best: Option<(usize, i32, LoadType)> = None;

        for axis in 0..NDIM {
            let size = mesh_box.size(axis);
            let min = self.params.min_size[axis];
            if size < 2 * min {
                continue;
            }
            let slab_load = whole_load / size as LoadType;

            for p in min..=size - min {
                if bad_cuts[axis][p as usize] {
                    continue;
                }
                let brk_load = p as LoadType * slab_load;
                if brk_load < low || brk_load > high {
                    continue;
                }
                let miss = (brk_load - ideal).abs();
                // Strict improvement keeps the lowest axis, then the
                // lowest plane.
                if best.map_or(true, |(_, _, b)| miss < (b - ideal).abs()) {
                    best = Some((axis, p, brk_load));
                }
            }
        }

        best.map(|(axis, p, brk_load)| {
            let (breakoff, leftover) = mesh_box.slice_at(axis, mesh_box.lo()[axis] + p);
            BreakResult {
                breakoff: vec![breakoff],
                leftover: vec![leftover],
                load: brk_load,
            }
        })
    }

    /// Best multi-axis corner cut: a sub-box anchored at the lower corner
    /// with up to [NDIM] leftover pieces.
    ///
    /// Used when a planar cut would leave a slender sliver. Each axis is
    /// either left whole or cut at the admissible plane closest to the
    /// target edge length; the most extended axis is then refined to match
    /// the target volume.
    fn break_off_load_cubic(
        &self,
        mesh_box: &MeshBox,
        ideal: LoadType,
        low: LoadType,
        high: LoadType,
        bad_cuts: &[Vec<bool>; NDIM],
    ) -> Option<BreakResult> {
        let target_edge = ideal.cbrt();

        let mut lens = mesh_box.sizes();
        for axis in 0..NDIM {
            lens[axis] = self.choose_cut_length(mesh_box, axis, target_edge, bad_cuts)?;
        }

        // Refine the most extended axis to best match the target volume
        // given the other two lengths.
        let refine_axis = (0..NDIM).max_by_key(|&a| mesh_box.size(a)).unwrap();
        let others: i64 = (0..NDIM)
            .filter(|&a| a != refine_axis)
            .map(|a| lens[a] as i64)
            .product();
        if others > 0 {
            let target_len = ideal / others as LoadType;
            lens[refine_axis] =
                self.choose_cut_length(mesh_box, refine_axis, target_len, bad_cuts)?;
        }

        if lens == mesh_box.sizes() {
            // No axis got cut; this is the uncut alternative, not a break.
            return None;
        }

        let lo = mesh_box.lo();
        let mut hi = lo;
        for axis in 0..NDIM {
            hi[axis] = lo[axis] + lens[axis];
        }
        let breakoff = MeshBox::new(lo, hi, mesh_box.block());
        let brk_load = breakoff.num_cells() as LoadType;
        if brk_load < low || brk_load > high {
            return None;
        }

        let leftover = burst_box(mesh_box, &breakoff);
        Some(BreakResult {
            breakoff: vec![breakoff],
            leftover,
            load: brk_load,
        })
    }

    /// Pick the admissible extent along one axis closest to `target`.
    ///
    /// The whole extent (no cut on this axis) is always admissible. A cut
    /// extent must leave both pieces at least `min_size` and land on an
    /// admissible plane. Returns `None` when the axis is degenerate.
    fn choose_cut_length(
        &self,
        mesh_box: &MeshBox,
        axis: usize,
        target: f64,
        bad_cuts: &[Vec<bool>; NDIM],
    ) -> Option<i32> {
        let size = mesh_box.size(axis);
        if size <= 0 {
            return None;
        }
        let min = self.params.min_size[axis];

        let mut best = size;
        let mut best_dist = (size as f64 - target).abs();
        if size >= 2 * min {
            for p in min..=size - min {
                if bad_cuts[axis][p as usize] {
                    continue;
                }
                let dist = (p as f64 - target).abs();
                if dist < best_dist {
                    best = p;
                    best_dist = dist;
                }
            }
        }
        Some(best)
    }

    /// Combined penalty of a break result.
    fn result_penalty(&self, result: &BreakResult, ideal: LoadType, original: &MeshBox) -> f64 {
        let mut pieces = result.breakoff.clone();
        pieces.extend_from_slice(&result.leftover);
        self.combined_penalty(
            (result.load - ideal).abs(),
            self.surface_penalty(&pieces, original),
            self.slender_penalty(&pieces),
        )
    }

    /// New interior surface exposed by cutting `original` into `pieces`.
    fn surface_penalty(&self, pieces: &[MeshBox], original: &MeshBox) -> f64 {
        let pieces_area: i64 = pieces.iter().map(|b| b.surface_area()).sum();
        (pieces_area - original.surface_area()) as f64 / 2.0
    }

    /// Worst slenderness excess over all pieces.
    fn slender_penalty(&self, pieces: &[MeshBox]) -> f64 {
        pieces
            .iter()
            .map(|b| (b.aspect_ratio() - self.params.slender_penalty_threshold).max(0.0))
            .fold(0.0, f64::max)
    }

    fn combined_penalty(&self, balance: f64, surface: f64, slender: f64) -> f64 {
        self.params.balance_penalty_wt * balance * balance
            + self.params.surface_penalty_wt * surface * surface
            + self.params.slender_penalty_wt * slender * slender
    }
}

/// Cover `bursty` minus `solid` with the minimal set of boxes.
///
/// Slices along axes from highest to lowest, shrinking the bursty box
/// toward the solid footprint. `solid` must be contained in `bursty`.
pub fn burst_box(bursty: &MeshBox, solid: &MeshBox) -> Vec<MeshBox> {
    debug_assert!(bursty.contains(solid));

    let mut pieces = Vec::new();
    let mut remainder = *bursty;
    for axis in (0..NDIM).rev() {
        if solid.hi()[axis] < remainder.hi()[axis] {
            let (lower, upper) = remainder.slice_at(axis, solid.hi()[axis]);
            pieces.push(upper);
            remainder = lower;
        }
        if solid.lo()[axis] > remainder.lo()[axis] {
            let (lower, upper) = remainder.slice_at(axis, solid.lo()[axis]);
            pieces.push(lower);
            remainder = upper;
        }
    }
    debug_assert_eq!(remainder, *solid);
    pieces
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::BalancerConfig;

    fn params_with(
        min_size: [i32; NDIM],
        cut_factor: [i32; NDIM],
        bad_interval: [i32; NDIM],
        domain: Vec<MeshBox>,
    ) -> PartitioningParams {
        PartitioningParams::new(
            &BalancerConfig::default(),
            min_size,
            [i32::MAX; NDIM],
            cut_factor,
            bad_interval,
            domain,
        )
    }

    fn cells(boxes: &[MeshBox]) -> i64 {
        boxes.iter().map(|b| b.num_cells()).sum()
    }

    #[test]
    fn test_planar_cut_hits_ideal() {
        let params = params_with([4, 4, 4], [1, 1, 1], [0, 0, 0], vec![]);
        let breaker = BalanceBoxBreaker::new(&params);
        let b = MeshBox::new([0, 0, 0], [100, 100, 100], 0);

        let result = breaker
            .break_off_load(&b, 400_000.0, 300_000.0, 500_000.0)
            .unwrap();
        assert_eq!(result.load, 400_000.0);
        assert_eq!(result.breakoff.len(), 1);
        assert_eq!(cells(&result.breakoff), 400_000);
        assert_eq!(
            cells(&result.breakoff) + cells(&result.leftover),
            b.num_cells()
        );
    }

    #[test]
    fn test_cut_factor_restricts_planes() {
        let params = params_with([4, 4, 4], [8, 8, 8], [0, 0, 0], vec![]);
        let breaker = BalanceBoxBreaker::new(&params);
        let b = MeshBox::new([0, 0, 0], [100, 100, 100], 0);

        let result = breaker
            .break_off_load(&b, 420_000.0, 300_000.0, 500_000.0)
            .unwrap();
        // Every face of every piece must land on a multiple of 8 or on
        // the original box boundary.
        for piece in result.breakoff.iter().chain(result.leftover.iter()) {
            for axis in 0..NDIM {
                for face in [piece.lo()[axis], piece.hi()[axis]] {
                    assert!(
                        face % 8 == 0 || face == 0 || face == 100,
                        "face {} not on cut factor",
                        face
                    );
                }
            }
        }
    }

    #[test]
    fn test_bad_interval_skips_near_boundary_planes() {
        let domain = MeshBox::new([0, 0, 0], [100, 6, 6], 0);
        let params = params_with([4, 4, 4], [1, 1, 1], [5, 0, 0], vec![domain]);
        let breaker = BalanceBoxBreaker::new(&params);
        // Only the x axis is long enough to cut.
        let b = MeshBox::new([0, 0, 0], [100, 6, 6], 0);

        // The exact ideal sits at x=4, inside the bad interval.
        let slab = 36.0;
        let result = breaker
            .break_off_load(&b, 4.0 * slab, 2.0 * slab, 12.0 * slab)
            .unwrap();
        // x=1..4 are forbidden; x=5 is the nearest admissible plane.
        assert_eq!(result.load, 5.0 * slab);
        for piece in result.breakoff.iter().chain(result.leftover.iter()) {
            let face = interior_face_x(piece);
            assert!(!(1..5).contains(&face), "cut at forbidden plane {}", face);
        }
    }

    // Interior face of a piece from a single x cut of [0,100).
    fn interior_face_x(piece: &MeshBox) -> i32 {
        if piece.lo()[0] == 0 {
            piece.hi()[0]
        } else {
            piece.lo()[0]
        }
    }

    #[test]
    fn test_min_size_is_respected() {
        let params = params_with([10, 10, 10], [1, 1, 1], [0, 0, 0], vec![]);
        let breaker = BalanceBoxBreaker::new(&params);
        let b = MeshBox::new([0, 0, 0], [16, 16, 16], 0);

        // Any cut would leave a piece under 10 cells on the cut axis.
        assert!(breaker
            .break_off_load(&b, 1000.0, 500.0, 1500.0)
            .is_none());
    }

    #[test]
    fn test_no_cut_wins_when_load_in_window() {
        let params = params_with([4, 4, 4], [1, 1, 1], [0, 0, 0], vec![]);
        let breaker = BalanceBoxBreaker::new(&params);
        let b = MeshBox::new([0, 0, 0], [20, 20, 20], 0);

        // The whole box already matches the ideal; nothing to gain by
        // cutting.
        assert!(breaker
            .break_off_load(&b, 8000.0, 7000.0, 9000.0)
            .is_none());
    }

    #[test]
    fn test_zero_weight_removes_term() {
        let config = BalancerConfig {
            slender_penalty_wt: 0.0,
            ..BalancerConfig::default()
        };
        let params = PartitioningParams::new(
            &config,
            [1, 1, 1],
            [i32::MAX; NDIM],
            [1, 1, 1],
            [0, 0, 0],
            vec![],
        );
        let breaker = BalanceBoxBreaker::new(&params);

        // With the slender term switched off, penalties of candidates
        // differing only in slenderness collapse to the same value.
        let thin = MeshBox::new([0, 0, 0], [100, 1, 1], 0);
        let cube = MeshBox::new([0, 0, 0], [10, 10, 1], 0);
        let p_thin = breaker.combined_penalty(5.0, 3.0, breaker.slender_penalty(&[thin]));
        let p_cube = breaker.combined_penalty(5.0, 3.0, breaker.slender_penalty(&[cube]));
        assert_eq!(p_thin, p_cube);
    }

    #[test]
    fn test_burst_covers_exactly() {
        let bursty = MeshBox::new([0, 0, 0], [10, 10, 10], 0);
        let solid = MeshBox::new([0, 0, 0], [4, 5, 10], 0);
        let pieces = burst_box(&bursty, &solid);

        assert!(pieces.len() <= NDIM);
        assert_eq!(
            cells(&pieces) + solid.num_cells(),
            bursty.num_cells()
        );
        // Pieces are pairwise disjoint and disjoint from the solid.
        for (i, a) in pieces.iter().enumerate() {
            assert!(!a.intersects(&solid));
            for b in pieces.iter().skip(i + 1) {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn test_cubic_cut_for_slender_breakoffs() {
        let params = params_with([2, 2, 2], [1, 1, 1], [0, 0, 0], vec![]);
        let breaker = BalanceBoxBreaker::new(&params);
        let b = MeshBox::new([0, 0, 0], [32, 32, 32], 0);

        // A small target load relative to the box: a planar cut would
        // shave a thin slab, the corner cut keeps pieces chunky.
        let result = breaker
            .break_off_load(&b, 1000.0, 800.0, 1400.0)
            .unwrap();
        assert!(result.load >= 800.0 && result.load <= 1400.0);
        assert_eq!(
            cells(&result.breakoff) + cells(&result.leftover),
            b.num_cells()
        );
        let worst_aspect = result
            .breakoff
            .iter()
            .map(|p| p.aspect_ratio())
            .fold(0.0, f64::max);
        assert!(worst_aspect <= 4.0, "breakoff too slender: {}", worst_aspect);
    }
}
