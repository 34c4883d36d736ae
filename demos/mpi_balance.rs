//! Balance an already balanced level, then balance into a rank subset.

use mpi::traits::*;
use treebalance::tools::gather_to_root;
use treebalance::{BalancerConfig, BoxLevel, MappingConnector, MeshBox, RankGroup, TreeLoadBalancer};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    let comm = universe.world();
    let rank = comm.rank();
    let size = comm.size();

    let domain = MeshBox::new([0, 0, 0], [100 * size, 100, 100], 0);

    // Every rank owns one 100^3 box: the level is already balanced.

    let mut level = BoxLevel::new(rank, size);
    let my_box = MeshBox::new([100 * rank, 0, 0], [100 * (rank + 1), 100, 100], 0);
    level.add_box(my_box);

    let mut balancer = TreeLoadBalancer::new("demo", BalancerConfig::default());
    balancer.set_mpi(&comm);

    let mut connector = MappingConnector::with_transpose();
    balancer
        .load_balance_box_level(
            &mut level,
            Some(&mut connector),
            0,
            [10, 10, 10],
            [200, 200, 200],
            &[domain],
            [0, 0, 0],
            [1, 1, 1],
            None,
        )
        .unwrap();

    // Nothing should have moved: the box stayed whole and the mapping is
    // the identity.

    assert_eq!(level.len(), 1);
    assert_eq!(level.local_load(), 1_000_000.0);
    assert_eq!(connector.num_edges(), 0);

    println!("rank {}: already balanced level untouched", rank);

    // Now restrict the destination to the lower half of the ranks. The
    // upper half must be emptied by the prebalance and the group members
    // end up with twice the load.

    if size >= 2 {
        let group_ranks: Vec<i32> = (0..size / 2).collect();
        let group = RankGroup::from_ranks(group_ranks);

        let mut connector = MappingConnector::with_transpose();
        balancer
            .load_balance_box_level(
                &mut level,
                Some(&mut connector),
                0,
                [10, 10, 10],
                [200, 200, 200],
                &[domain],
                [0, 0, 0],
                [1, 1, 1],
                Some(group.clone()),
            )
            .unwrap();

        if group.contains(rank) {
            assert!(level.local_load() > 0.0);
        } else {
            assert!(level.is_empty());
        }

        // Load is conserved globally.
        if let Some(loads) = gather_to_root(&[level.local_load()], &comm) {
            let total: f64 = loads.iter().sum();
            assert_eq!(total, 1_000_000.0 * size as f64);
            println!("rank group balance done, load conserved at {}", total);
        }
    }
}
