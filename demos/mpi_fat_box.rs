//! Spread the load of a single fat box over all ranks.

use mpi::traits::*;
use treebalance::tools::gather_to_root;
use treebalance::{BalancerConfig, BoxLevel, MappingConnector, MeshBox, TreeLoadBalancer};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    let comm = universe.world();
    let rank = comm.rank();
    let size = comm.size();

    let domain = MeshBox::new([0, 0, 0], [200, 100, 100], 0);

    // Only rank 0 holds work: one 200 x 100 x 100 box.

    let mut level = BoxLevel::new(rank, size);
    if rank == 0 {
        level.add_box(domain);
    }
    let total_load = 2_000_000.0;

    let config = BalancerConfig::default();
    let flex = config.flexible_load_tolerance;
    let mut balancer = TreeLoadBalancer::new("fat-box", config);
    balancer.set_mpi(&comm);

    let mut connector = MappingConnector::with_transpose();
    balancer
        .load_balance_box_level(
            &mut level,
            Some(&mut connector),
            0,
            [4, 4, 4],
            [200, 200, 200],
            &[domain],
            [0, 0, 0],
            [1, 1, 1],
            None,
        )
        .unwrap();

    let avg = total_load / size as f64;

    // Every rank should end close to the average.

    assert!(
        level.local_load() <= (1.0 + flex) * avg + f64::EPSILON,
        "rank {} overloaded: {} > {}",
        rank,
        level.local_load(),
        (1.0 + flex) * avg
    );

    if let Some(loads) = gather_to_root(&[level.local_load()], &comm) {
        let total: f64 = loads.iter().sum();
        assert_eq!(total, total_load);
        println!("total load conserved at {}", total);
    }

    // The origin box on rank 0 fans out into one edge per receiving rank.

    if rank == 0 && size > 1 {
        let origins: Vec<_> = connector.origins().collect();
        assert!(!origins.is_empty());
        let edges = connector.edges_from(origins[0]);
        assert!(
            edges.len() >= (size - 1) as usize,
            "expected at least {} edges, found {}",
            size - 1,
            edges.len()
        );
        println!("origin fanned out into {} balanced boxes", edges.len());
    }

    balancer.print_statistics(&mut std::io::stdout()).unwrap();
}
