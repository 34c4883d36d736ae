//! Per-subtree surplus and deficit bookkeeping.

use crate::transit::{LoadType, TransitSet};

/// Aggregate load data for one subtree of the rank tree.
///
/// Each process holds one `SubtreeData` for the subtree rooted at itself
/// and one per child. Besides the plain totals, a secondary "effective"
/// triple excludes descendants that already reached their target and
/// stopped asking for work, so surplus is only routed to subtrees that
/// can still absorb it.
#[derive(Clone, Debug, Default)]
pub struct SubtreeData {
    /// Rank of the subtree root.
    pub rank: i32,
    /// Number of processes in the subtree.
    pub num_procs: i32,
    /// Work currently held across the subtree, including local
    /// unassigned work.
    pub load_current: LoadType,
    /// Ideal amount of work for the subtree.
    pub load_ideal: LoadType,
    /// Work the subtree is willing to hold, based on the flex tolerance.
    pub load_upperlimit: LoadType,
    /// Processes remaining after pruning independent descendants.
    pub eff_num_procs: i32,
    /// Current work of the pruned subtree.
    pub eff_load_current: LoadType,
    /// Ideal work of the pruned subtree.
    pub eff_load_ideal: LoadType,
    /// Upper limit of the pruned subtree.
    pub eff_load_upperlimit: LoadType,
    /// Work traded (or to be traded) with the parent.
    pub work_traded: TransitSet,
    /// Whether any descendant still expects work from above.
    pub wants_work_from_parent: bool,
}

impl SubtreeData {
    /// Data for a single process before any children are merged in.
    ///
    /// The ideal share is the group average; the upper limit stretches it
    /// by the flex tolerance.
    pub fn for_single_process(
        rank: i32,
        local_load: LoadType,
        group_avg_load: LoadType,
        flex_tolerance: f64,
    ) -> Self {
        let upperlimit = group_avg_load * (1.0 + flex_tolerance);
        Self {
            rank,
            num_procs: 1,
            load_current: local_load,
            load_ideal: group_avg_load,
            load_upperlimit: upperlimit,
            eff_num_procs: 1,
            eff_load_current: local_load,
            eff_load_ideal: group_avg_load,
            eff_load_upperlimit: upperlimit,
            work_traded: TransitSet::new(),
            wants_work_from_parent: local_load < group_avg_load,
        }
    }

    /// Current load beyond the ideal.
    pub fn surplus(&self) -> LoadType {
        self.load_current - self.load_ideal
    }

    /// Ideal load not yet held.
    pub fn deficit(&self) -> LoadType {
        self.load_ideal - self.load_current
    }

    /// Surplus of the pruned subtree.
    pub fn eff_surplus(&self) -> LoadType {
        self.eff_load_current - self.eff_load_ideal
    }

    /// Deficit of the pruned subtree.
    pub fn eff_deficit(&self) -> LoadType {
        self.eff_load_ideal - self.eff_load_current
    }

    /// Current load beyond the upper limit.
    pub fn excess(&self) -> LoadType {
        self.load_current - self.load_upperlimit
    }

    /// Room left under the upper limit.
    pub fn margin(&self) -> LoadType {
        self.load_upperlimit - self.load_current
    }

    /// Excess of the pruned subtree.
    pub fn eff_excess(&self) -> LoadType {
        self.eff_load_current - self.eff_load_upperlimit
    }

    /// Margin of the pruned subtree.
    pub fn eff_margin(&self) -> LoadType {
        self.eff_load_upperlimit - self.eff_load_current
    }

    /// Whether the subtree has reached its target and stopped asking for
    /// work. Independent subtrees are pruned from the effective figures.
    pub fn is_independent(&self) -> bool {
        self.load_current <= self.load_upperlimit && !self.wants_work_from_parent
    }

    /// Incorporate a child subtree's data.
    ///
    /// Totals are additive. The effective figures only absorb dependent
    /// children; an independent child contributes nothing to them.
    pub fn add_child(&mut self, child: &SubtreeData) {
        self.num_procs += child.num_procs;
        self.load_current += child.load_current;
        self.load_ideal += child.load_ideal;
        self.load_upperlimit += child.load_upperlimit;

        if !child.is_independent() {
            self.eff_num_procs += child.eff_num_procs;
            self.eff_load_current += child.eff_load_current;
            self.eff_load_ideal += child.eff_load_ideal;
            self.eff_load_upperlimit += child.eff_load_upperlimit;
        }

        self.wants_work_from_parent =
            self.wants_work_from_parent || child.wants_work_from_parent;
    }
}

/// Surplus available per process of the descendants still waiting for
/// work from their parents.
///
/// The local process keeps its own ideal share out of the unassigned
/// work first; the remainder is spread over the effective process counts
/// of the children from `first_child` on that still want work.
pub fn compute_surplus_per_effective_descendent(
    unassigned_load: LoadType,
    group_avg_load: LoadType,
    child_subtrees: &[SubtreeData],
    first_child: usize,
) -> LoadType {
    let surplus = unassigned_load - group_avg_load;
    if surplus <= 0.0 {
        return 0.0;
    }
    let eff_procs: i32 = child_subtrees[first_child..]
        .iter()
        .filter(|c| c.wants_work_from_parent)
        .map(|c| c.eff_num_procs)
        .sum();
    if eff_procs == 0 {
        return 0.0;
    }
    surplus / eff_procs as LoadType
}

#[cfg(test)]
mod test {
    use super::*;

    fn child(rank: i32, procs: i32, current: f64, avg: f64, wants: bool) -> SubtreeData {
        let mut data = SubtreeData::for_single_process(rank, current, avg * procs as f64, 0.05);
        data.num_procs = procs;
        data.eff_num_procs = procs;
        data.wants_work_from_parent = wants;
        data
    }

    #[test]
    fn test_single_process_accessors() {
        let data = SubtreeData::for_single_process(3, 80.0, 100.0, 0.05);
        assert_eq!(data.surplus(), -20.0);
        assert_eq!(data.deficit(), 20.0);
        assert_eq!(data.margin(), 25.0);
        assert_eq!(data.excess(), -25.0);
        assert!(data.wants_work_from_parent);
    }

    #[test]
    fn test_add_child_sums_totals() {
        let mut root = SubtreeData::for_single_process(0, 100.0, 100.0, 0.0);
        root.add_child(&child(1, 2, 150.0, 100.0, true));
        root.add_child(&child(3, 1, 120.0, 100.0, false));

        assert_eq!(root.num_procs, 4);
        assert_eq!(root.load_current, 370.0);
        assert_eq!(root.load_ideal, 400.0);
        assert!(root.wants_work_from_parent);
    }

    #[test]
    fn test_independent_child_is_pruned_from_effective() {
        let mut root = SubtreeData::for_single_process(0, 100.0, 100.0, 0.0);
        // Satisfied child: at its ideal, not asking for more.
        let satisfied = child(1, 2, 200.0, 100.0, false);
        assert!(satisfied.is_independent());
        // Needy child.
        let needy = child(3, 1, 20.0, 100.0, true);
        assert!(!needy.is_independent());

        root.add_child(&satisfied);
        root.add_child(&needy);

        assert_eq!(root.num_procs, 4);
        assert_eq!(root.eff_num_procs, 2);
        assert_eq!(root.eff_load_current, 120.0);
        // Invariant: effective counts never exceed totals.
        assert!(root.eff_num_procs <= root.num_procs);
        assert!(root.eff_load_current <= root.load_current);
    }

    #[test]
    fn test_surplus_per_effective_descendent() {
        let children = vec![
            child(1, 2, 50.0, 100.0, true),
            child(3, 1, 100.0, 100.0, false),
            child(4, 1, 30.0, 100.0, true),
        ];

        // 400 unassigned, 100 kept locally, 3 effective procs wanting.
        let share = compute_surplus_per_effective_descendent(400.0, 100.0, &children, 0);
        assert_eq!(share, 100.0);

        // Serving starts after the first child: 1 wanting proc remains.
        let share = compute_surplus_per_effective_descendent(400.0, 100.0, &children, 1);
        assert_eq!(share, 300.0);

        // No surplus, no share.
        assert_eq!(
            compute_surplus_per_effective_descendent(80.0, 100.0, &children, 0),
            0.0
        );
    }
}
