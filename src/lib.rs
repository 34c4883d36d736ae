//! A distributed load balancer for AMR box levels
//!
//! This library redistributes a collection of axis-aligned integer boxes
//! across the processes of an MPI communicator so that every process
//! ends up with approximately the same total work load, while respecting
//! geometric constraints on the boxes (minimum and maximum sizes, cut
//! factors, forbidden cut planes near domain boundaries).
//!
//! The algorithm is tree based. For each balancing cycle the processes
//! of a rank group are arranged in a virtual tree. Every subtree reports
//! its load to its parent and ships surplus boxes toward the root; the
//! root and every interior node then grant work back down to the
//! subtrees that still want it. Boxes are sliced by a geometry-aware
//! breaker that minimises a penalty combining imbalance, newly exposed
//! surface, and slenderness. With a bounded fan-out ratio the group
//! sizes widen exponentially over several cycles, so a single heavily
//! loaded process never has to talk to everyone at once.
//!
//! ## Using the library
//!
//! ```no_run
//! use treebalance::{BalancerConfig, BoxLevel, MappingConnector, MeshBox, TreeLoadBalancer};
//! use mpi::traits::Communicator;
//!
//! let universe = mpi::initialize().unwrap();
//! let world = universe.world();
//!
//! let domain = MeshBox::new([0, 0, 0], [256, 256, 256], 0);
//! let mut level = BoxLevel::new(world.rank(), world.size());
//! if world.rank() == 0 {
//!     level.add_box(domain);
//! }
//!
//! let mut balancer = TreeLoadBalancer::new("balancer", BalancerConfig::default());
//! balancer.set_mpi(&world);
//!
//! let mut connector = MappingConnector::with_transpose();
//! balancer
//!     .load_balance_box_level(
//!         &mut level,
//!         Some(&mut connector),
//!         0,
//!         [16, 16, 16],
//!         [128, 128, 128],
//!         &[domain],
//!         [0, 0, 0],
//!         [1, 1, 1],
//!         None,
//!     )
//!     .unwrap();
//! ```
//!
//! Balancing mutates the level in place and records which balanced boxes
//! every originating box was mapped to in the connector.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod adjust;
pub mod balancer;
pub mod box_level;
pub mod breaker;
pub mod comm;
pub mod connector;
pub mod constants;
pub mod error;
pub mod geometry;
pub mod messages;
pub mod params;
pub mod rank_tree;
pub mod report;
pub mod subtree;
pub mod tools;
pub mod transit;

pub use crate::balancer::TreeLoadBalancer;
pub use crate::box_level::BoxLevel;
pub use crate::connector::MappingConnector;
pub use crate::error::BalanceError;
pub use crate::geometry::{BoxId, MeshBox};
pub use crate::params::{BalancerConfig, PartitioningParams};
pub use crate::rank_tree::{CenteredRankTree, RankGroup, RankTreeStrategy};
