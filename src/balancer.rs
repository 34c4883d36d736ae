//! The tree-based load balancer.
//!
//! Processes are arranged in a tree per cycle. Each subtree reports its
//! load upward and ships surplus boxes toward the root; the root and
//! every interior node then push work back down to the subtrees that
//! still want it, cutting boxes to match target loads on the way.

use std::io::Write;

use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::{Communicator, CommunicatorCollectives};

use crate::adjust::LoadAdjuster;
use crate::box_level::BoxLevel;
use crate::breaker::BalanceBoxBreaker;
use crate::connector::{construct_semilocal_unbalanced_to_balanced, MappingConnector};
use crate::constants::{
    LOAD_TAG_0, LOAD_TAG_1, MIN_NPROC_FOR_AUTOMATIC_MULTICYCLE, NDIM, PREBALANCE_TAG_0,
    PREBALANCE_TAG_1,
};
use crate::comm::TreeComm;
use crate::error::BalanceError;
use crate::geometry::{BoxId, MeshBox};
use crate::messages::{
    pack_boxes_down, pack_records, pack_subtree_up, unpack_boxes_down, unpack_records,
    unpack_subtree_up, Phase, WireTransit,
};
use crate::params::{BalancerConfig, PartitioningParams};
use crate::rank_tree::{CenteredRankTree, RankGroup, RankTreeStrategy};
use crate::report::{gather_and_report_load_balance, CommGraphWriter};
use crate::subtree::{compute_surplus_per_effective_descendent, SubtreeData};
use crate::tools::{exchange_payloads, gather_to_root, global_sum_load};
use crate::transit::{BoxInTransit, LoadType, TransitSet};

/// Distributes the boxes of a box level so every process holds
/// approximately the same load.
///
/// The balancer owns a private duplicate of the caller's communicator so
/// its traffic cannot interact with other communication. One instance
/// may balance many levels; each call is collective over the
/// communicator and runs to completion.
pub struct TreeLoadBalancer {
    name: String,
    config: BalancerConfig,
    comm: Option<SimpleCommunicator>,
    rank_tree: Box<dyn RankTreeStrategy>,
    workload_data_ids: Vec<i32>,
    master_workload_data_id: i32,
    comm_graph_writer: Option<Box<dyn CommGraphWriter>>,
    load_stat: Vec<LoadType>,
    box_count_stat: Vec<usize>,
}

impl TreeLoadBalancer {
    /// Create a balancer with the given configuration and the default
    /// centered rank tree.
    pub fn new(name: impl Into<String>, config: BalancerConfig) -> Self {
        Self::with_rank_tree(name, config, Box::new(CenteredRankTree))
    }

    /// Create a balancer with an injected rank tree strategy.
    pub fn with_rank_tree(
        name: impl Into<String>,
        config: BalancerConfig,
        rank_tree: Box<dyn RankTreeStrategy>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            comm: None,
            rank_tree,
            workload_data_ids: Vec::new(),
            master_workload_data_id: -1,
            comm_graph_writer: None,
            load_stat: Vec::new(),
            box_count_stat: Vec::new(),
        }
    }

    /// Name of this balancer, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Duplicate the given communicator for private use.
    ///
    /// This is a collective call. Subsequent balance calls only accept
    /// box levels congruent with the duplicate.
    pub fn set_mpi<C: Communicator>(&mut self, comm: &C) {
        self.comm = Some(comm.duplicate());
    }

    /// Release the private communicator, if one was set.
    ///
    /// Also done by dropping the balancer.
    pub fn free_mpi_communicator(&mut self) {
        self.comm = None;
    }

    /// Record the patch data id holding per-cell workloads.
    ///
    /// Reserved for non-uniform balancing; with no id set the load of a
    /// box is its cell count. Without a level number the id becomes the
    /// fallback for all levels.
    pub fn set_workload_patch_data_index(&mut self, data_id: i32, level_number: Option<usize>) {
        match level_number {
            Some(level) => {
                if self.workload_data_ids.len() <= level {
                    self.workload_data_ids
                        .resize(level + 1, self.master_workload_data_id);
                }
                self.workload_data_ids[level] = data_id;
            }
            None => self.master_workload_data_id = data_id,
        }
    }

    /// Whether balancing the given level reads patch data.
    pub fn get_load_balance_depends_on_patch_data(&self, level_number: usize) -> bool {
        self.workload_data_id(level_number) >= 0
    }

    /// Attach a sink recording per-edge communication volumes. Pass
    /// `None` to disable.
    pub fn set_comm_graph_writer(&mut self, writer: Option<Box<dyn CommGraphWriter>>) {
        self.comm_graph_writer = writer;
    }

    fn workload_data_id(&self, level_number: usize) -> i32 {
        self.workload_data_ids
            .get(level_number)
            .copied()
            .unwrap_or(self.master_workload_data_id)
    }

    /// Balance the boxes of `level` across the communicator.
    ///
    /// The level is mutated in place. When a connector is given, the
    /// unbalanced-to-balanced mapping and its transpose are recorded in
    /// it. Restricting `rank_group` first migrates all boxes off the
    /// excluded ranks; all processes of the communicator still enter the
    /// call collectively.
    #[allow(clippy::too_many_arguments)]
    pub fn load_balance_box_level(
        &mut self,
        level: &mut BoxLevel,
        mut connector: Option<&mut MappingConnector>,
        level_number: usize,
        min_size: [i32; NDIM],
        max_size: [i32; NDIM],
        domain: &[MeshBox],
        bad_interval: [i32; NDIM],
        cut_factor: [i32; NDIM],
        rank_group: Option<RankGroup>,
    ) -> Result<(), BalanceError> {
        if self.get_load_balance_depends_on_patch_data(level_number) {
            log::warn!(
                "{}: non-uniform workloads are not supported yet; using cell counts",
                self.name
            );
        }
        let comm = self.comm.as_ref().ok_or(BalanceError::NoCommunicator)?;
        let size = comm.size();
        let rank = comm.rank();

        // The original phrased this precondition as a size/rank
        // comparison; it is a size-equality check between the private
        // communicator and the level's communicator.
        if level.comm_size() != size {
            return Err(BalanceError::IncongruentCommunicator {
                dupe: size as usize,
                level: level.comm_size() as usize,
            });
        }
        if let Some(ref c) = connector {
            if !c.has_transpose() {
                return Err(BalanceError::MissingTranspose);
            }
        }

        let rank_group = rank_group.unwrap_or_else(|| RankGroup::all(size));
        let params = PartitioningParams::new(
            &self.config,
            min_size,
            max_size,
            cut_factor,
            bad_interval,
            domain.to_vec(),
        );

        let origin_snapshot: Vec<(BoxId, MeshBox)> =
            level.iter().map(|(id, b)| (*id, *b)).collect();

        let mut next_id = level.reserve_local_id();
        let mut unassigned = TransitSet::new();
        for (id, mesh_box) in level.iter() {
            unassigned.insert(BoxInTransit::from_origin(*mesh_box, *id));
        }

        if rank_group.len() < size as usize {
            prebalance_box_level(comm, &mut unassigned, &mut next_id, &rank_group)?;
        }

        constrain_max_box_sizes(&params, &mut unassigned, &mut next_id, rank);

        let in_group = rank_group.contains(rank);
        let cycles = number_of_cycles(self.config.max_cycle_spread_ratio, rank_group.len());
        for cycle in 0..cycles {
            let color = if in_group {
                let index = rank_group.index_of(rank).unwrap();
                let group_size = cycle_group_size(
                    self.config.max_cycle_spread_ratio,
                    rank_group.len(),
                    cycle,
                    cycles,
                );
                Color::with_value((index / group_size) as i32)
            } else {
                Color::undefined()
            };
            if let Some(subcomm) = comm.split_by_color(color) {
                distribute_load_across_group(
                    &subcomm,
                    &params,
                    &*self.rank_tree,
                    &mut self.comm_graph_writer,
                    cycle,
                    rank,
                    &mut unassigned,
                    &mut next_id,
                )?;
            }
        }

        level.clear();
        for item in unassigned.iter() {
            level.insert_with_id(item.id, item.mesh_box);
        }

        if let Some(connector) = connector.as_deref_mut() {
            construct_semilocal_unbalanced_to_balanced(
                connector,
                &unassigned,
                &origin_snapshot,
                comm,
            )?;
            if self.config.summarize_map {
                connector.summarize();
            }
        }

        self.load_stat.push(unassigned.sum_load());
        self.box_count_stat.push(unassigned.len());
        if self.config.report_load_balance {
            log::info!(
                "{}: rank {} holds {} boxes, load {}",
                self.name,
                rank,
                unassigned.len(),
                unassigned.sum_load()
            );
        }
        Ok(())
    }

    /// Write a summary of the most recent balance to a stream.
    ///
    /// Collective over the private communicator; only root writes.
    pub fn print_statistics<W: Write>(&self, out: &mut W) -> Result<(), BalanceError> {
        let comm = self.comm.as_ref().ok_or(BalanceError::NoCommunicator)?;
        let last = self.load_stat.last().copied().unwrap_or(0.0);
        gather_and_report_load_balance(last, comm, out)?;

        let boxes = self.box_count_stat.last().copied().unwrap_or(0) as u64;
        if let Some(counts) = gather_to_root(&[boxes], comm) {
            let total: u64 = counts.iter().sum();
            let max = counts.iter().max().copied().unwrap_or(0);
            writeln!(out, "  boxes total {}  max per process {}", total, max)?;
        }
        Ok(())
    }
}

/// Number of fan-out cycles for a group of the given size.
///
/// Small groups collapse to a single pass; larger groups widen by at
/// most the spread ratio per cycle.
fn number_of_cycles(max_cycle_spread_ratio: usize, group_len: usize) -> usize {
    if group_len < MIN_NPROC_FOR_AUTOMATIC_MULTICYCLE || max_cycle_spread_ratio < 2 {
        return 1;
    }
    let mut cycles = 1;
    let mut reach = max_cycle_spread_ratio;
    while reach < group_len {
        reach = reach.saturating_mul(max_cycle_spread_ratio);
        cycles += 1;
    }
    cycles
}

/// Size of the contiguous groups in a given cycle.
///
/// Group sizes grow by the spread ratio per cycle; the final cycle
/// spans the whole rank group.
fn cycle_group_size(
    max_cycle_spread_ratio: usize,
    group_len: usize,
    cycle: usize,
    cycles: usize,
) -> usize {
    if cycle + 1 >= cycles {
        return group_len;
    }
    let mut size = 1_usize;
    for _ in 0..=cycle {
        size = size.saturating_mul(max_cycle_spread_ratio);
    }
    size.min(group_len)
}

/// The group member every excluded rank ships its boxes to.
fn nearest_member(group: &RankGroup, rank: i32) -> i32 {
    let mut best = None;
    for &member in group.iter() {
        if member <= rank {
            best = Some(member);
        } else {
            break;
        }
    }
    best.unwrap_or_else(|| group.rank_at(0))
}

/// Migrate all boxes on ranks outside the group to nearby group members.
///
/// Works on the transit pool so originating boxes survive the move;
/// received boxes are re-identified at their new holder.
fn prebalance_box_level<C: Communicator + CommunicatorCollectives>(
    comm: &C,
    unassigned: &mut TransitSet,
    next_id: &mut i64,
    rank_group: &RankGroup,
) -> Result<(), BalanceError> {
    let rank = comm.rank();

    let mut outgoing = Vec::new();
    if !rank_group.contains(rank) && !unassigned.is_empty() {
        let target = nearest_member(rank_group, rank);
        let records: Vec<WireTransit> = unassigned.iter().map(WireTransit::pack).collect();
        unassigned.clear();
        outgoing.push((
            target,
            pack_records(Phase::Prebalance, rank, &records).into_bytes(),
        ));
    }

    for (_from, payload) in
        exchange_payloads(comm, &outgoing, PREBALANCE_TAG_0, PREBALANCE_TAG_1)?
    {
        for record in unpack_records::<WireTransit>(Phase::Prebalance, payload)? {
            let item = record.unpack().reowned(rank, *next_id);
            *next_id += 1;
            unassigned.insert(item);
        }
    }
    Ok(())
}

/// Split every box exceeding the maximum size, ignoring load.
///
/// Runs before any load-based cutting so the shape bounds hold for all
/// boxes the cycles move around.
fn constrain_max_box_sizes(
    params: &PartitioningParams,
    unassigned: &mut TransitSet,
    next_id: &mut i64,
    rank: i32,
) {
    let breaker = BalanceBoxBreaker::new(params);

    let oversized: Vec<BoxInTransit> = unassigned
        .iter()
        .filter(|item| (0..NDIM).any(|a| item.mesh_box.size(a) > params.max_size[a]))
        .copied()
        .collect();

    for item in oversized {
        unassigned.remove(&item);
        let mut work = vec![item];
        while let Some(current) = work.pop() {
            let violating = (0..NDIM).find(|&a| current.mesh_box.size(a) > params.max_size[a]);
            match violating {
                Some(axis) => match breaker.break_off_max_size(&current.mesh_box, axis) {
                    Some((lower, upper)) => {
                        for piece in [lower, upper] {
                            work.push(BoxInTransit::with_new_box(&current, piece, rank, *next_id));
                            *next_id += 1;
                        }
                    }
                    None => {
                        log::warn!(
                            "box {} exceeds max size on axis {} but admits no cut",
                            current.mesh_box,
                            axis
                        );
                        unassigned.insert(current);
                    }
                },
                None => {
                    unassigned.insert(current);
                }
            }
        }
    }
}

/// Run one balancing cycle over one rank group.
///
/// The group communicator defines the tree positions. One upward pass
/// aggregates subtree loads and ships surplus boxes toward the root; one
/// downward pass grants work to the subtrees that still want it.
#[allow(clippy::too_many_arguments)]
fn distribute_load_across_group<C: Communicator + CommunicatorCollectives>(
    subcomm: &C,
    params: &PartitioningParams,
    rank_tree: &dyn RankTreeStrategy,
    comm_graph_writer: &mut Option<Box<dyn CommGraphWriter>>,
    cycle: usize,
    world_rank: i32,
    unassigned: &mut TransitSet,
    next_id: &mut i64,
) -> Result<(), BalanceError> {
    let group_size = subcomm.size();
    if group_size <= 1 {
        return Ok(());
    }
    let group_rank = subcomm.rank();
    let flex = params.flexible_load_tolerance;

    let group_sum = global_sum_load(unassigned.sum_load(), subcomm);
    let group_avg = group_sum / group_size as LoadType;

    let index = group_rank as usize;
    let n = group_size as usize;
    let parent = rank_tree.parent(index, n).map(|p| p as i32);
    let children: Vec<i32> = rank_tree
        .children(index, n)
        .into_iter()
        .map(|c| c as i32)
        .collect();
    let tree_comm = TreeComm::new(subcomm, parent, children);

    // Upward pass: absorb the children's shipped boxes and combine their
    // subtree data.
    let mut child_subtrees = Vec::new();
    for payload in tree_comm.recv_from_children(LOAD_TAG_0, LOAD_TAG_1)? {
        let mut child = unpack_subtree_up(payload)?;
        let mut shipped = TransitSet::new();
        child.work_traded.swap(&mut shipped);
        while let Some(item) = shipped.pop_first() {
            unassigned.insert(item.reowned(world_rank, *next_id));
            *next_id += 1;
        }
        child_subtrees.push(child);
    }

    let mut my_subtree =
        SubtreeData::for_single_process(group_rank, unassigned.sum_load(), group_avg, flex);
    for child in &child_subtrees {
        my_subtree.add_child(child);
    }

    // Ship subtree surplus toward the root.
    if let Some(parent) = tree_comm.parent() {
        let surplus = my_subtree.surplus();
        if surplus > 0.0 {
            let mut traded = TransitSet::new();
            let adjuster = LoadAdjuster::new(params, world_rank);
            adjuster.adjust_load(
                &mut traded,
                unassigned,
                next_id,
                surplus,
                my_subtree.excess().max(0.0),
                surplus + flex * group_avg,
            );
            my_subtree.load_current -= traded.sum_load();
            my_subtree.eff_load_current -= traded.sum_load();
            if let Some(writer) = comm_graph_writer {
                writer.record_edge(cycle, group_rank, parent, traded.sum_load());
            }
            my_subtree.work_traded = traded;
        }
        my_subtree.wants_work_from_parent =
            my_subtree.wants_work_from_parent || my_subtree.deficit() > 0.0;

        let payload = pack_subtree_up(group_rank, &my_subtree).into_bytes();
        tree_comm.send_to_parent(LOAD_TAG_0, LOAD_TAG_1, &payload)?;
    }

    // Downward pass: receive our grant, then serve the children.
    if let Some(payload) = tree_comm.recv_from_parent(LOAD_TAG_0, LOAD_TAG_1)? {
        let mut received = 0.0;
        for item in unpack_boxes_down(payload)? {
            received += item.load;
            unassigned.insert(item.reowned(world_rank, *next_id));
            *next_id += 1;
        }
        my_subtree.load_current += received;
    }

    let adjuster = LoadAdjuster::new(params, world_rank);
    let mut payloads = Vec::with_capacity(child_subtrees.len());
    for child_index in 0..child_subtrees.len() {
        let (ideal, low, high) = {
            let child = &child_subtrees[child_index];
            if child.wants_work_from_parent {
                let per_proc = compute_surplus_per_effective_descendent(
                    unassigned.sum_load(),
                    group_avg,
                    &child_subtrees,
                    child_index,
                );
                let share = per_proc * child.eff_num_procs as LoadType;
                let margin = child.eff_margin().max(0.0);
                let ideal = child.eff_deficit().max(0.0).min(share).min(margin);
                let slack = flex * group_avg;
                (
                    ideal,
                    (ideal - slack).max(0.0),
                    (ideal + slack).min(margin.max(ideal)),
                )
            } else {
                (0.0, 0.0, 0.0)
            }
        };

        let mut grant = TransitSet::new();
        if ideal > 0.0 {
            adjuster.adjust_load(&mut grant, unassigned, next_id, ideal, low, high);
        }
        child_subtrees[child_index].load_current += grant.sum_load();
        child_subtrees[child_index].eff_load_current += grant.sum_load();
        if grant.sum_load() > 0.0 {
            if let Some(writer) = comm_graph_writer {
                writer.record_edge(
                    cycle,
                    group_rank,
                    child_subtrees[child_index].rank,
                    grant.sum_load(),
                );
            }
        }
        payloads.push(pack_boxes_down(group_rank, &grant).into_bytes());
    }
    tree_comm.send_to_children(LOAD_TAG_0, LOAD_TAG_1, &payloads)?;

    if my_subtree.excess() > 0.0 {
        log::debug!(
            "cycle {}: subtree at {} ends {} above its upper limit",
            cycle,
            group_rank,
            my_subtree.excess()
        );
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_small_groups_use_one_cycle() {
        assert_eq!(number_of_cycles(1_000_000, 4), 1);
        assert_eq!(number_of_cycles(1_000_000, 64), 1);
        // Above the threshold but still within one spread.
        assert_eq!(number_of_cycles(1_000_000, 1024), 1);
    }

    #[test]
    fn test_spread_ratio_forces_multiple_cycles() {
        assert_eq!(number_of_cycles(4, 1024), 5);
        assert_eq!(number_of_cycles(2, 1024), 10);
        assert_eq!(number_of_cycles(32, 1024), 2);
    }

    #[test]
    fn test_cycle_groups_widen_to_full_size() {
        let cycles = number_of_cycles(4, 1024);
        let sizes: Vec<usize> = (0..cycles)
            .map(|c| cycle_group_size(4, 1024, c, cycles))
            .collect();
        assert_eq!(sizes, vec![4, 16, 64, 256, 1024]);

        for window in sizes.windows(2) {
            assert!(window[0] <= window[1]);
        }
        assert_eq!(*sizes.last().unwrap(), 1024);
    }

    #[test]
    fn test_nearest_member() {
        let group = RankGroup::from_ranks(vec![0, 1, 2, 3]);
        assert_eq!(nearest_member(&group, 5), 3);
        let group = RankGroup::from_ranks(vec![4, 5, 6, 7]);
        assert_eq!(nearest_member(&group, 2), 4);
        let group = RankGroup::from_ranks(vec![0, 4]);
        assert_eq!(nearest_member(&group, 2), 0);
    }

    #[test]
    fn test_workload_data_id_table() {
        let mut balancer = TreeLoadBalancer::new("test", BalancerConfig::default());
        assert!(!balancer.get_load_balance_depends_on_patch_data(0));

        balancer.set_workload_patch_data_index(7, Some(2));
        assert!(!balancer.get_load_balance_depends_on_patch_data(0));
        assert!(balancer.get_load_balance_depends_on_patch_data(2));
        // Levels beyond the table fall back to the master id.
        assert!(!balancer.get_load_balance_depends_on_patch_data(5));

        balancer.set_workload_patch_data_index(9, None);
        assert!(balancer.get_load_balance_depends_on_patch_data(5));
    }

    #[test]
    fn test_constrain_max_box_sizes_splits_fat_boxes() {
        let config = BalancerConfig::default();
        let params = PartitioningParams::new(
            &config,
            [10, 10, 10],
            [100, 100, 100],
            [1, 1, 1],
            [0, 0, 0],
            vec![],
        );

        let mut unassigned = TransitSet::new();
        let fat = MeshBox::new([0, 0, 0], [300, 10, 10], 0);
        unassigned.insert(BoxInTransit::from_origin(fat, BoxId::new(0, 0)));

        let mut next_id = 1;
        constrain_max_box_sizes(&params, &mut unassigned, &mut next_id, 0);

        assert!(unassigned.len() >= 3);
        assert_eq!(unassigned.sum_load(), 30_000.0);
        for item in unassigned.iter() {
            for axis in 0..NDIM {
                assert!(item.mesh_box.size(axis) <= 100);
            }
            // Every piece remembers the fat box as its origin.
            assert_eq!(item.origin_id, BoxId::new(0, 0));
            assert_eq!(item.origin, fat);
        }
    }

    #[test]
    fn test_constrain_leaves_small_boxes_alone() {
        let config = BalancerConfig::default();
        let params = PartitioningParams::new(
            &config,
            [4, 4, 4],
            [100, 100, 100],
            [1, 1, 1],
            [0, 0, 0],
            vec![],
        );

        let mut unassigned = TransitSet::new();
        let small = MeshBox::new([0, 0, 0], [50, 50, 50], 0);
        unassigned.insert(BoxInTransit::from_origin(small, BoxId::new(0, 0)));

        let mut next_id = 1;
        constrain_max_box_sizes(&params, &mut unassigned, &mut next_id, 0);

        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned.first().unwrap().id, BoxId::new(0, 0));
        assert_eq!(next_id, 1);
    }
}
