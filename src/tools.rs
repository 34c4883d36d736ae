//! Communication utilities.

use mpi::collective::SystemOperation;
use mpi::datatype::PartitionMut;
use mpi::point_to_point::Destination;
use mpi::request::WaitGuard;
use mpi::traits::{Communicator, CommunicatorCollectives, Equivalence, Root};

use crate::comm::{build_first_datum, recv_message};
use crate::error::BalanceError;
use crate::transit::LoadType;

/// Compute displacements from a vector of counts.
///
/// For counts `[3, 4, 5]` the displacements are `[0, 3, 7]`; the last
/// count only matters for the total.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// Gather a distributed array to the root rank.
///
/// The result is a `Vec<T>` on root and `None` on all other ranks.
pub fn gather_to_root<T: Equivalence + Default + Clone, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> Option<Vec<T>> {
    let n = arr.len() as i32;
    let root = comm.process_at_rank(0);

    if comm.rank() == 0 {
        let mut counts = vec![0_i32; comm.size() as usize];
        root.gather_into_root(&n, &mut counts);

        let total: i32 = counts.iter().sum();
        let mut gathered = vec![T::default(); total as usize];
        let displs = displacements(&counts);
        let mut partition = PartitionMut::new(&mut gathered[..], counts, &displs[..]);
        root.gather_varcount_into_root(arr, &mut partition);
        Some(gathered)
    } else {
        root.gather_into(&n);
        root.gather_varcount_into(arr);
        None
    }
}

/// Sum a load over all ranks of a communicator.
pub fn global_sum_load<C: CommunicatorCollectives>(local: LoadType, comm: &C) -> LoadType {
    let mut global = 0.0;
    comm.all_reduce_into(&local, &mut global, SystemOperation::sum());
    global
}

/// Exchange at most one payload with every other rank.
///
/// `outgoing` pairs destination ranks with payloads; at most one payload
/// per destination, none of them empty. An all-to-all of lengths first
/// tells every rank whom to expect messages from, then all sends are
/// posted non-blocking and the expected messages are received while the
/// sends drain. Returns `(source rank, payload)` pairs in rank order.
pub fn exchange_payloads<C: Communicator + CommunicatorCollectives>(
    comm: &C,
    outgoing: &[(i32, Vec<u8>)],
    first_tag: i32,
    overflow_tag: i32,
) -> Result<Vec<(i32, Vec<u8>)>, BalanceError> {
    let size = comm.size() as usize;

    let mut send_lens = vec![0_i32; size];
    for (rank, payload) in outgoing {
        debug_assert!(!payload.is_empty());
        debug_assert_eq!(send_lens[*rank as usize], 0);
        send_lens[*rank as usize] = i32::try_from(payload.len())
            .map_err(|_| BalanceError::MessageOverflow { len: payload.len() })?;
    }

    let mut recv_lens = vec![0_i32; size];
    comm.all_to_all_into(&send_lens, &mut recv_lens);

    // First datums are built up front so the non-blocking sends can all
    // borrow them for the duration of the exchange.
    let mut firsts = Vec::with_capacity(outgoing.len());
    for (_, payload) in outgoing {
        firsts.push(build_first_datum(payload)?);
    }

    let mut inbound = Vec::new();
    mpi::request::scope(|scope| -> Result<(), BalanceError> {
        let mut guards = Vec::new();
        for ((rank, payload), (first, prefix_len)) in outgoing.iter().zip(firsts.iter()) {
            let process = comm.process_at_rank(*rank);
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

        for (rank, &len) in recv_lens.iter().enumerate() {
            if len > 0 {
                inbound.push((
                    rank as i32,
                    recv_message(comm, rank as i32, first_tag, overflow_tag)?,
                ));
            }
        }
        Ok(())
    })?;

    Ok(inbound)
}

#[cfg(test)]
mod test {
    use super::displacements;

    #[test]
    fn test_displacements() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
        assert_eq!(displacements(&[]), Vec::<i32>::new());
        assert_eq!(displacements(&[0, 2, 0, 1]), vec![0, 0, 2, 2]);
    }
}
