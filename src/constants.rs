//! Crate-wide constants.

/// Spatial dimension of all boxes handled by the balancer.
pub const NDIM: usize = 3;

/// Message tag for the first datum of an upward or downward load message.
pub const LOAD_TAG_0: i32 = 1;

/// Message tag for the overflow part of a load message.
pub const LOAD_TAG_1: i32 = 2;

/// Message tag for the first datum of a mapping-edge message.
pub const EDGE_TAG_0: i32 = 3;

/// Message tag for the overflow part of a mapping-edge message.
pub const EDGE_TAG_1: i32 = 4;

/// Message tag for the first datum of a pre-balance box migration message.
pub const PREBALANCE_TAG_0: i32 = 5;

/// Message tag for the overflow part of a pre-balance box migration message.
pub const PREBALANCE_TAG_1: i32 = 6;

/// Size in bytes of the fixed first datum of every two-part message.
///
/// Small payloads fit entirely into the first datum so that most tree
/// edges need a single message per pass. Larger payloads trigger a
/// secondary exchange on the paired overflow tag.
pub const FIRST_DATA_LEN: usize = 500;

/// Minimum communicator size for which the balancer automatically uses
/// more than one fan-out cycle.
pub const MIN_NPROC_FOR_AUTOMATIC_MULTICYCLE: usize = 65;

/// Default fraction of the ideal load a process may keep beyond its
/// ideal share.
pub const DEFAULT_FLEXIBLE_LOAD_TOLERANCE: f64 = 0.05;

/// Default upper bound on the per-cycle fan-out ratio.
pub const DEFAULT_MAX_CYCLE_SPREAD_RATIO: usize = 1_000_000;

/// Default weight of the imbalance term in the box breaking penalty.
pub const DEFAULT_BALANCE_PENALTY_WT: f64 = 1.0;

/// Default weight of the new-surface term in the box breaking penalty.
pub const DEFAULT_SURFACE_PENALTY_WT: f64 = 1.0;

/// Default weight of the slenderness term in the box breaking penalty.
pub const DEFAULT_SLENDER_PENALTY_WT: f64 = 1.0;

/// Default aspect ratio above which a box is penalized as slender.
pub const DEFAULT_SLENDER_PENALTY_THRESHOLD: f64 = 2.0;

/// Default multiplier applied to the penalty of the uncut alternative
/// when deciding whether to break a box. Values above one force more
/// aggressive cutting.
pub const DEFAULT_PRECUT_PENALTY_WT: f64 = 1.0;
