//! Asynchronous parent/child message exchange along a rank tree.
//!
//! Every exchange uses a two-part protocol: a fixed-size first datum
//! carrying the total payload length and as much payload as fits, and,
//! only for oversized payloads, a secondary message on the paired
//! overflow tag. Small subtrees therefore cost a single message per
//! edge. Sends are posted non-blocking and completed together; receives
//! from all children are pre-posted before any of them is waited on.

use mpi::point_to_point::{Destination, Source};
use mpi::request::WaitGuard;
use mpi::traits::Communicator;

use crate::constants::FIRST_DATA_LEN;
use crate::error::BalanceError;

/// Assemble the fixed first datum: total length then payload prefix.
pub(crate) fn build_first_datum(payload: &[u8]) -> Result<(Vec<u8>, usize), BalanceError> {
    let total = u32::try_from(payload.len())
        .map_err(|_| BalanceError::MessageOverflow { len: payload.len() })?;
    let mut first = vec![0u8; FIRST_DATA_LEN];
    first[..4].copy_from_slice(&total.to_le_bytes());
    let prefix_len = payload.len().min(FIRST_DATA_LEN - 4);
    first[4..4 + prefix_len].copy_from_slice(&payload[..prefix_len]);
    Ok((first, prefix_len))
}

/// Send one two-part message to a peer.
pub fn send_message<C: Communicator>(
    comm: &C,
    to: i32,
    first_tag: i32,
    overflow_tag: i32,
    payload: &[u8],
) -> Result<(), BalanceError> {
    let (first, prefix_len) = build_first_datum(payload)?;
    let process = comm.process_at_rank(to);
    mpi::request::scope(|scope| {
        let _first =
            WaitGuard::from(process.immediate_send_with_tag(scope, &first[..], first_tag));
        if payload.len() > prefix_len {
            let _rest = WaitGuard::from(process.immediate_send_with_tag(
                scope,
                &payload[prefix_len..],
                overflow_tag,
            ));
        }
    });
    Ok(())
}

/// Receive one two-part message from a peer.
pub fn recv_message<C: Communicator>(
    comm: &C,
    from: i32,
    first_tag: i32,
    overflow_tag: i32,
) -> Result<Vec<u8>, BalanceError> {
    let process = comm.process_at_rank(from);
    let mut first = vec![0u8; FIRST_DATA_LEN];
    mpi::request::scope(|scope| {
        process
            .immediate_receive_into_with_tag(scope, &mut first[..], first_tag)
            .wait();
    });
    reassemble(comm, from, overflow_tag, first)
}

/// Combine a received first datum with its overflow part, if any.
fn reassemble<C: Communicator>(
    comm: &C,
    from: i32,
    overflow_tag: i32,
    first: Vec<u8>,
) -> Result<Vec<u8>, BalanceError> {
    let total = u32::from_le_bytes(first[..4].try_into().unwrap()) as usize;
    let prefix_len = total.min(FIRST_DATA_LEN - 4);
    let mut payload = first[4..4 + prefix_len].to_vec();
    if total > prefix_len {
        let (rest, _status) = comm
            .process_at_rank(from)
            .receive_vec_with_tag::<u8>(overflow_tag);
        if rest.len() != total - prefix_len {
            return Err(BalanceError::Protocol(format!(
                "overflow message from rank {} has {} bytes, expected {}",
                from,
                rest.len(),
                total - prefix_len
            )));
        }
        payload.extend_from_slice(&rest);
    }
    Ok(payload)
}

/// Communication endpoints of one process within a rank tree.
///
/// Ranks are positions within the group communicator the tree was built
/// on. A leaf has no children; the root has no parent.
pub struct TreeComm<'a, C: Communicator> {
    comm: &'a C,
    parent: Option<i32>,
    children: Vec<i32>,
}

impl<'a, C: Communicator> TreeComm<'a, C> {
    /// Set up the endpoints for one process.
    pub fn new(comm: &'a C, parent: Option<i32>, children: Vec<i32>) -> Self {
        Self {
            comm,
            parent,
            children,
        }
    }

    /// The parent's rank, if this process is not the tree root.
    pub fn parent(&self) -> Option<i32> {
        self.parent
    }

    /// The children's ranks, in child-index order.
    pub fn children(&self) -> &[i32] {
        &self.children
    }

    /// Send a payload to the parent. No-op at the root.
    pub fn send_to_parent(
        &self,
        first_tag: i32,
        overflow_tag: i32,
        payload: &[u8],
    ) -> Result<(), BalanceError> {
        match self.parent {
            Some(parent) => send_message(self.comm, parent, first_tag, overflow_tag, payload),
            None => Ok(()),
        }
    }

    /// Receive one payload from the parent, if any.
    pub fn recv_from_parent(
        &self,
        first_tag: i32,
        overflow_tag: i32,
    ) -> Result<Option<Vec<u8>>, BalanceError> {
        match self.parent {
            Some(parent) => {
                recv_message(self.comm, parent, first_tag, overflow_tag).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Send one payload per child, posted together, in child-index order.
    pub fn send_to_children(
        &self,
        first_tag: i32,
        overflow_tag: i32,
        payloads: &[Vec<u8>],
    ) -> Result<(), BalanceError> {
        assert_eq!(payloads.len(), self.children.len());

        let mut firsts = Vec::with_capacity(payloads.len());
        for payload in payloads {
            firsts.push(build_first_datum(payload)?);
        }

        mpi::request::scope(|scope| {
            let mut guards = Vec::new();
            for (&child, payload, (first, prefix_len)) in
                itertools::izip!(self.children.iter(), payloads.iter(), firsts.iter())
            {
                let process = self.comm.process_at_rank(child);
                guards.push(WaitGuard::from(process.immediate_send_with_tag(
                    scope,
                    &first[..],
                    first_tag,
                )));
                if payload.len() > *prefix_len {
                    guards.push(WaitGuard::from(process.immediate_send_with_tag(
                        scope,
                        &payload[*prefix_len..],
                        overflow_tag,
                    )));
                }
            }
        });
        Ok(())
    }

    /// Receive one payload from every child.
    ///
    /// The first datum of every child is pre-posted before any receive is
    /// waited on; overflow parts are collected afterwards. Results are
    /// returned in child-index order regardless of arrival order.
    pub fn recv_from_children(
        &self,
        first_tag: i32,
        overflow_tag: i32,
    ) -> Result<Vec<Vec<u8>>, BalanceError> {
        let mut firsts: Vec<Vec<u8>> = self
            .children
            .iter()
            .map(|_| vec![0u8; FIRST_DATA_LEN])
            .collect();

        mpi::request::scope(|scope| {
            let requests: Vec<_> = itertools::izip!(self.children.iter(), firsts.iter_mut())
                .map(|(&child, first)| {
                    self.comm
                        .process_at_rank(child)
                        .immediate_receive_into_with_tag(scope, &mut first[..], first_tag)
                })
                .collect();
            for request in requests {
                request.wait();
            }
        });

        itertools::izip!(self.children.iter(), firsts)
            .map(|(&child, first)| reassemble(self.comm, child, overflow_tag, first))
            .collect()
    }
}
