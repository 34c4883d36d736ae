//! Post-balance load reporting and communication diagnostics.

use std::io::Write;

use mpi::traits::CommunicatorCollectives;

use crate::tools::gather_to_root;
use crate::transit::LoadType;

/// Sink for per-edge communication volumes.
///
/// When a writer is attached to the balancer, every load transfer along
/// a tree edge is recorded with its cycle number and the sender and
/// receiver positions within the cycle's group.
pub trait CommGraphWriter {
    /// Record one traded volume along a tree edge.
    fn record_edge(&mut self, cycle: usize, from: i32, to: i32, load: LoadType);
}

/// Gather per-process loads to root and write a distribution summary.
///
/// All ranks must call this collectively; only root writes.
pub fn gather_and_report_load_balance<C: CommunicatorCollectives, W: Write>(
    local_load: LoadType,
    comm: &C,
    out: &mut W,
) -> std::io::Result<()> {
    let Some(loads) = gather_to_root(&[local_load], comm) else {
        return Ok(());
    };

    let n = loads.len();
    let sum: LoadType = loads.iter().sum();
    let avg = sum / n as LoadType;

    let (min_rank, min) = loads
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(r, &l)| (r, l))
        .unwrap();
    let (max_rank, max) = loads
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(r, &l)| (r, l))
        .unwrap();

    let variance = loads.iter().map(|l| (l - avg) * (l - avg)).sum::<f64>() / n as f64;
    let stddev = variance.sqrt();

    writeln!(out, "load distribution over {} processes:", n)?;
    writeln!(out, "  total {:.0}  mean {:.2}  stddev {:.2}", sum, avg, stddev)?;
    writeln!(
        out,
        "  min {:.0} on rank {}  max {:.0} on rank {}",
        min, min_rank, max, max_rank
    )?;
    if avg > 0.0 {
        writeln!(out, "  imbalance factor {:.4}", max / avg)?;
    }
    Ok(())
}
