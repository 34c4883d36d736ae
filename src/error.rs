//! Error types for the balancer.

use crate::geometry::BoxId;
use thiserror::Error;

/// Fatal conditions that abort a balance call.
///
/// Non-fatal conditions (a box that admits no cut, a subtree that ends a
/// cycle outside its window) are not errors; they are logged and the
/// algorithm falls back to a looser match.
#[derive(Debug, Error)]
pub enum BalanceError {
    /// The balancer was asked to communicate without a communicator set.
    #[error("no communicator has been set; call set_mpi first")]
    NoCommunicator,

    /// The private communicator does not match the box level's communicator.
    #[error("private communicator size {dupe} does not match box level communicator size {level}")]
    IncongruentCommunicator {
        /// Size of the duplicated private communicator.
        dupe: usize,
        /// Size of the communicator the box level is distributed over.
        level: usize,
    },

    /// The input connector has no transpose to update.
    #[error("input connector is missing its transpose")]
    MissingTranspose,

    /// A message exceeded the representable size.
    #[error("message of {len} bytes overflows the wire format")]
    MessageOverflow {
        /// Attempted message length in bytes.
        len: usize,
    },

    /// A received message was malformed or arrived outside a known phase.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A range insert into a transit set contained a box already present.
    #[error("duplicate transit box {0}")]
    DuplicateTransitBox(BoxId),

    /// Writing a report failed.
    #[error("i/o error while writing a report")]
    Io(#[from] std::io::Error),
}
