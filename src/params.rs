//! Configuration and per-invocation partitioning parameters.

use crate::constants::{
    DEFAULT_BALANCE_PENALTY_WT, DEFAULT_FLEXIBLE_LOAD_TOLERANCE, DEFAULT_MAX_CYCLE_SPREAD_RATIO,
    DEFAULT_PRECUT_PENALTY_WT, DEFAULT_SLENDER_PENALTY_THRESHOLD, DEFAULT_SLENDER_PENALTY_WT,
    DEFAULT_SURFACE_PENALTY_WT, NDIM,
};
use crate::geometry::MeshBox;
use serde::Deserialize;

/// User-facing configuration for a [TreeLoadBalancer](crate::TreeLoadBalancer).
///
/// Loaded once from a key/value store (any serde-compatible source) and
/// held for the lifetime of the balancer. All fields have defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Fraction of the ideal load a process may keep beyond its ideal
    /// share. Higher values reduce box cutting and communication at the
    /// cost of a less balanced result. Must lie in `[0, 1]`.
    pub flexible_load_tolerance: f64,

    /// Upper bound on how many processes may receive the load of a single
    /// process within one cycle. Small values spread a concentrated load
    /// over several cycles instead of one very wide fan-out.
    pub max_cycle_spread_ratio: usize,

    /// Whether to log a load-balance report after each balance call.
    #[serde(alias = "DEV_report_load_balance")]
    pub report_load_balance: bool,

    /// Whether to log a summary of the mapping connector after each
    /// balance call.
    #[serde(alias = "DEV_summarize_map")]
    pub summarize_map: bool,

    /// Weight of the imbalance term in the box breaking penalty.
    pub balance_penalty_wt: f64,

    /// Weight of the new-surface term in the box breaking penalty.
    pub surface_penalty_wt: f64,

    /// Weight of the slenderness term in the box breaking penalty.
    pub slender_penalty_wt: f64,

    /// Aspect ratio above which a box is penalized as slender.
    pub slender_penalty_threshold: f64,

    /// Multiplier applied to the penalty of the uncut alternative when
    /// deciding whether to break a box. Values above one force more
    /// aggressive cutting but can produce more slivers.
    pub precut_penalty_wt: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            flexible_load_tolerance: DEFAULT_FLEXIBLE_LOAD_TOLERANCE,
            max_cycle_spread_ratio: DEFAULT_MAX_CYCLE_SPREAD_RATIO,
            report_load_balance: false,
            summarize_map: false,
            balance_penalty_wt: DEFAULT_BALANCE_PENALTY_WT,
            surface_penalty_wt: DEFAULT_SURFACE_PENALTY_WT,
            slender_penalty_wt: DEFAULT_SLENDER_PENALTY_WT,
            slender_penalty_threshold: DEFAULT_SLENDER_PENALTY_THRESHOLD,
            precut_penalty_wt: DEFAULT_PRECUT_PENALTY_WT,
        }
    }
}

/// Immutable bundle of geometric constraints and penalty weights for one
/// balance invocation.
///
/// Constructed at the entry of `load_balance_box_level` and treated as
/// read-only for the duration of the call.
#[derive(Clone, Debug)]
pub struct PartitioningParams {
    /// Minimum box extent per axis. Cuts never produce a piece smaller
    /// than this along any axis.
    pub min_size: [i32; NDIM],

    /// Maximum box extent per axis. Boxes exceeding this are split before
    /// any load-based cutting.
    pub max_size: [i32; NDIM],

    /// Per-axis cut factor. Admissible cut planes have absolute indices
    /// divisible by this factor.
    pub cut_factor: [i32; NDIM],

    /// Per-axis distance from a domain face within which cuts are
    /// forbidden. Cuts too close to a boundary create ghost-region
    /// singularities.
    pub bad_interval: [i32; NDIM],

    /// Boxes describing the computational domain, per block.
    pub block_domain_boxes: Vec<MeshBox>,

    /// Weight of the imbalance term in the breaking penalty.
    pub balance_penalty_wt: f64,

    /// Weight of the new-surface term in the breaking penalty.
    pub surface_penalty_wt: f64,

    /// Weight of the slenderness term in the breaking penalty.
    pub slender_penalty_wt: f64,

    /// Aspect ratio above which a box is penalized as slender.
    pub slender_penalty_threshold: f64,

    /// Multiplier applied to the uncut alternative's penalty.
    pub precut_penalty_wt: f64,

    /// Fraction over the ideal load a process may keep.
    pub flexible_load_tolerance: f64,
}

impl PartitioningParams {
    /// Assemble the per-invocation parameters from the balancer
    /// configuration and the geometric arguments of a balance call.
    pub fn new(
        config: &BalancerConfig,
        min_size: [i32; NDIM],
        max_size: [i32; NDIM],
        cut_factor: [i32; NDIM],
        bad_interval: [i32; NDIM],
        block_domain_boxes: Vec<MeshBox>,
    ) -> Self {
        Self {
            min_size,
            max_size,
            cut_factor,
            bad_interval,
            block_domain_boxes,
            balance_penalty_wt: config.balance_penalty_wt,
            surface_penalty_wt: config.surface_penalty_wt,
            slender_penalty_wt: config.slender_penalty_wt,
            slender_penalty_threshold: config.slender_penalty_threshold,
            precut_penalty_wt: config.precut_penalty_wt,
            flexible_load_tolerance: config.flexible_load_tolerance,
        }
    }

    /// Domain boxes belonging to the given block.
    pub fn domain_boxes_for_block(&self, block: i32) -> impl Iterator<Item = &MeshBox> {
        self.block_domain_boxes
            .iter()
            .filter(move |b| b.block() == block)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BalancerConfig::default();
        assert_eq!(config.flexible_load_tolerance, 0.05);
        assert_eq!(config.max_cycle_spread_ratio, 1_000_000);
        assert!(!config.report_load_balance);
        assert!(!config.summarize_map);
    }

    #[test]
    fn test_params_from_config() {
        let config = BalancerConfig::default();
        let domain = MeshBox::new([0, 0, 0], [100, 100, 100], 0);
        let params = PartitioningParams::new(
            &config,
            [4, 4, 4],
            [64, 64, 64],
            [1, 1, 1],
            [2, 2, 2],
            vec![domain],
        );
        assert_eq!(params.min_size, [4, 4, 4]);
        assert_eq!(params.domain_boxes_for_block(0).count(), 1);
        assert_eq!(params.domain_boxes_for_block(1).count(), 0);
    }
}
