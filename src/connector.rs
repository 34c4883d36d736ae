//! The unbalanced-to-balanced mapping built after redistribution.

use std::collections::BTreeMap;

use mpi::traits::{Communicator, CommunicatorCollectives};

use crate::constants::{EDGE_TAG_0, EDGE_TAG_1};
use crate::error::BalanceError;
use crate::geometry::{BoxId, MeshBox};
use crate::messages::{pack_records, unpack_records, Phase, WireEdge};
use crate::tools::exchange_payloads;
use crate::transit::TransitSet;

/// Records where every originating box ended up.
///
/// Forward edges map an originating box to the balanced boxes covering
/// it; transpose edges map a balanced box back to its origin. A box that
/// stayed whole on its owner produces no explicit edges: the mapping is
/// the identity there.
#[derive(Clone, Debug, Default)]
pub struct MappingConnector {
    forward: BTreeMap<BoxId, Vec<(BoxId, MeshBox)>>,
    transpose: BTreeMap<BoxId, Vec<(BoxId, MeshBox)>>,
    has_transpose: bool,
}

impl MappingConnector {
    /// An empty connector that also maintains its transpose.
    pub fn with_transpose() -> Self {
        Self {
            forward: BTreeMap::new(),
            transpose: BTreeMap::new(),
            has_transpose: true,
        }
    }

    /// Whether the transpose is being maintained.
    pub fn has_transpose(&self) -> bool {
        self.has_transpose
    }

    /// Add a forward edge from an originating box to a balanced box.
    pub fn add_edge(&mut self, origin_id: BoxId, final_id: BoxId, final_box: MeshBox) {
        self.forward
            .entry(origin_id)
            .or_default()
            .push((final_id, final_box));
    }

    /// Add a transpose edge from a balanced box back to its origin.
    pub fn add_transpose_edge(&mut self, final_id: BoxId, origin_id: BoxId, origin: MeshBox) {
        self.transpose
            .entry(final_id)
            .or_default()
            .push((origin_id, origin));
    }

    /// Balanced boxes recorded for an originating box.
    pub fn edges_from(&self, origin_id: &BoxId) -> &[(BoxId, MeshBox)] {
        self.forward
            .get(origin_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Origins recorded for a balanced box.
    pub fn transpose_edges_from(&self, final_id: &BoxId) -> &[(BoxId, MeshBox)] {
        self.transpose
            .get(final_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of forward edges.
    pub fn num_edges(&self) -> usize {
        self.forward.values().map(Vec::len).sum()
    }

    /// Origins with at least one forward edge.
    pub fn origins(&self) -> impl Iterator<Item = &BoxId> {
        self.forward.keys()
    }

    /// Log a per-origin summary of the mapping.
    pub fn summarize(&self) {
        for (origin, finals) in &self.forward {
            let cells: i64 = finals.iter().map(|(_, b)| b.num_cells()).sum();
            log::info!(
                "origin {} mapped to {} boxes, {} cells",
                origin,
                finals.len(),
                cells
            );
        }
    }
}

/// Construct the semilocal edges of the mapping over MPI.
///
/// Every locally kept box whose origin lives elsewhere, or that differs
/// from its origin, is reported to the origin's owner in one matched
/// exchange. The receiving side records the forward edges; the sending
/// side records the transpose edges, which are local by construction.
pub fn construct_semilocal_unbalanced_to_balanced<C: Communicator + CommunicatorCollectives>(
    connector: &mut MappingConnector,
    kept: &TransitSet,
    origin_snapshot: &[(BoxId, MeshBox)],
    comm: &C,
) -> Result<(), BalanceError> {
    let rank = comm.rank();

    let mut per_rank: BTreeMap<i32, Vec<WireEdge>> = BTreeMap::new();
    for item in kept.iter() {
        // A box still whole on its origin's owner maps to itself.
        let unchanged = item.origin_id.owner == rank
            && item.origin_id == item.id
            && item.origin == item.mesh_box;
        if unchanged {
            continue;
        }
        connector.add_transpose_edge(item.id, item.origin_id, item.origin);
        if item.origin_id.owner == rank {
            // The origin is ours; no communication needed.
            connector.add_edge(item.origin_id, item.id, item.mesh_box);
        } else {
            let edge = WireEdge::pack(&item.origin, &item.origin_id, &item.mesh_box, &item.id);
            per_rank.entry(item.origin_id.owner).or_default().push(edge);
        }
    }

    let outgoing: Vec<(i32, Vec<u8>)> = per_rank
        .iter()
        .map(|(&dest, edges)| {
            (
                dest,
                pack_records(Phase::Edge, rank, edges).into_bytes(),
            )
        })
        .collect();

    for (_from, payload) in exchange_payloads(comm, &outgoing, EDGE_TAG_0, EDGE_TAG_1)? {
        for edge in unpack_records::<WireEdge>(Phase::Edge, payload)? {
            let ((origin, origin_id), (final_box, final_id)) = edge.unpack();
            debug_assert_eq!(origin_id.owner, rank);
            let _ = origin;
            connector.add_edge(origin_id, final_id, final_box);
        }
    }

    verify_local_completeness(connector, kept, origin_snapshot, rank);
    Ok(())
}

/// Check that every locally originating box is fully accounted for.
///
/// An origin is covered either by the forward edges recorded for it or
/// by still being held whole on this rank. Saturation misses elsewhere
/// do not affect this accounting; a gap here means lost boxes.
fn verify_local_completeness(
    connector: &MappingConnector,
    kept: &TransitSet,
    origin_snapshot: &[(BoxId, MeshBox)],
    rank: i32,
) {
    for (origin_id, origin) in origin_snapshot {
        debug_assert_eq!(origin_id.owner, rank);
        let mapped_cells: i64 = connector
            .edges_from(origin_id)
            .iter()
            .map(|(_, b)| b.num_cells())
            .sum();
        let kept_whole = kept
            .iter()
            .any(|item| item.id == *origin_id && item.mesh_box == *origin);
        let accounted = if kept_whole {
            origin.num_cells()
        } else {
            mapped_cells
        };
        if accounted != origin.num_cells() {
            log::error!(
                "origin {} covers {} cells but the mapping accounts for {}",
                origin_id,
                origin.num_cells(),
                accounted
            );
            debug_assert_eq!(accounted, origin.num_cells());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_edges_accumulate_per_origin() {
        let mut connector = MappingConnector::with_transpose();
        let origin = BoxId::new(0, 0);
        connector.add_edge(origin, BoxId::new(1, 0), MeshBox::new([0, 0, 0], [5, 10, 10], 0));
        connector.add_edge(origin, BoxId::new(2, 0), MeshBox::new([5, 0, 0], [10, 10, 10], 0));

        assert_eq!(connector.num_edges(), 2);
        assert_eq!(connector.edges_from(&origin).len(), 2);
        assert!(connector.edges_from(&BoxId::new(0, 1)).is_empty());
    }

    #[test]
    fn test_transpose_edges_are_separate() {
        let mut connector = MappingConnector::with_transpose();
        let origin = BoxId::new(0, 0);
        let final_id = BoxId::new(1, 3);
        let origin_box = MeshBox::new([0, 0, 0], [10, 10, 10], 0);
        connector.add_transpose_edge(final_id, origin, origin_box);

        assert_eq!(connector.num_edges(), 0);
        assert_eq!(connector.transpose_edges_from(&final_id).len(), 1);
        assert_eq!(connector.transpose_edges_from(&final_id)[0].0, origin);
    }
}
