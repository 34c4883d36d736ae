//! Byte framing of the messages exchanged along tree edges.
//!
//! Every message is a homogeneous byte stream: a fixed header, a packed
//! list of boxes in transit, and an optional trailer (a subtree summary
//! on upward messages). All records are plain-old-data so packing is a
//! cast, not a serialization pass.

use bytemuck::{Pod, Zeroable};

use crate::constants::NDIM;
use crate::error::BalanceError;
use crate::geometry::{BoxId, MeshBox};
use crate::subtree::SubtreeData;
use crate::transit::{BoxInTransit, LoadType, TransitSet};

/// Direction or phase of a message, stored in the header's first byte.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Phase {
    /// Load aggregation flowing from children to parents.
    Up = 1,
    /// Load distribution flowing from parents to children.
    Down = 2,
    /// Mapping-edge records after redistribution.
    Edge = 3,
    /// Box migration before the first cycle.
    Prebalance = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Result<Self, BalanceError> {
        match value {
            1 => Ok(Phase::Up),
            2 => Ok(Phase::Down),
            3 => Ok(Phase::Edge),
            4 => Ok(Phase::Prebalance),
            other => Err(BalanceError::Protocol(format!(
                "unknown message phase {other}"
            ))),
        }
    }
}

/// Fixed message header.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireHeader {
    /// Phase tag, see [Phase].
    pub phase: u8,
    /// Alignment padding, always zero.
    pub pad: [u8; 3],
    /// Rank of the sender within its group communicator.
    pub sender: i32,
    /// Number of packed transit records following the header.
    pub num_items: i32,
    /// Bytes of trailer data following the records.
    pub extra_size: i32,
}

/// Wire encoding of a box with its identity.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireBox {
    lo: [i32; NDIM],
    hi: [i32; NDIM],
    block: i32,
    owner: i32,
    local_id: i64,
}

impl WireBox {
    fn pack(mesh_box: &MeshBox, id: &BoxId) -> Self {
        Self {
            lo: mesh_box.lo(),
            hi: mesh_box.hi(),
            block: mesh_box.block(),
            owner: id.owner,
            local_id: id.local_id,
        }
    }

    fn unpack(&self) -> (MeshBox, BoxId) {
        (
            MeshBox::new(self.lo, self.hi, self.block),
            BoxId::new(self.owner, self.local_id),
        )
    }
}

/// Wire encoding of a box in transit: current box, origin, load.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireTransit {
    current: WireBox,
    origin: WireBox,
    load: LoadType,
}

impl WireTransit {
    /// Pack a box in transit.
    pub fn pack(item: &BoxInTransit) -> Self {
        Self {
            current: WireBox::pack(&item.mesh_box, &item.id),
            origin: WireBox::pack(&item.origin, &item.origin_id),
            load: item.load,
        }
    }

    /// Unpack into a box in transit.
    pub fn unpack(&self) -> BoxInTransit {
        let (mesh_box, id) = self.current.unpack();
        let (origin, origin_id) = self.origin.unpack();
        BoxInTransit {
            mesh_box,
            id,
            origin,
            origin_id,
            load: self.load,
        }
    }
}

/// Wire encoding of a subtree summary, appended to upward messages.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireSubtree {
    rank: i32,
    num_procs: i32,
    load_current: LoadType,
    load_ideal: LoadType,
    load_upperlimit: LoadType,
    eff_num_procs: i32,
    wants_work: i32,
    eff_load_current: LoadType,
    eff_load_ideal: LoadType,
    eff_load_upperlimit: LoadType,
}

impl WireSubtree {
    /// Pack the summary part of a subtree (the traded bin travels as the
    /// message's item list).
    pub fn pack(data: &SubtreeData) -> Self {
        Self {
            rank: data.rank,
            num_procs: data.num_procs,
            load_current: data.load_current,
            load_ideal: data.load_ideal,
            load_upperlimit: data.load_upperlimit,
            eff_num_procs: data.eff_num_procs,
            wants_work: data.wants_work_from_parent as i32,
            eff_load_current: data.eff_load_current,
            eff_load_ideal: data.eff_load_ideal,
            eff_load_upperlimit: data.eff_load_upperlimit,
        }
    }

    /// Unpack into a subtree with an empty traded bin.
    pub fn unpack(&self) -> SubtreeData {
        SubtreeData {
            rank: self.rank,
            num_procs: self.num_procs,
            load_current: self.load_current,
            load_ideal: self.load_ideal,
            load_upperlimit: self.load_upperlimit,
            eff_num_procs: self.eff_num_procs,
            eff_load_current: self.eff_load_current,
            eff_load_ideal: self.eff_load_ideal,
            eff_load_upperlimit: self.eff_load_upperlimit,
            work_traded: TransitSet::new(),
            wants_work_from_parent: self.wants_work != 0,
        }
    }
}

/// Record reporting where an originating box ended up.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireEdge {
    origin: WireBox,
    final_box: WireBox,
}

impl WireEdge {
    /// Pack an origin/final pair.
    pub fn pack(origin: &MeshBox, origin_id: &BoxId, final_box: &MeshBox, final_id: &BoxId) -> Self {
        Self {
            origin: WireBox::pack(origin, origin_id),
            final_box: WireBox::pack(final_box, final_id),
        }
    }

    /// Unpack into `((origin, origin id), (final box, final id))`.
    pub fn unpack(&self) -> ((MeshBox, BoxId), (MeshBox, BoxId)) {
        (self.origin.unpack(), self.final_box.unpack())
    }
}

/// An append-only byte stream with typed reads.
#[derive(Default)]
pub struct MessageStream {
    buf: Vec<u8>,
    cursor: usize,
}

impl MessageStream {
    /// Create an empty stream for writing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap received bytes for reading.
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf, cursor: 0 }
    }

    /// Append a plain-old-data value.
    pub fn put<T: Pod>(&mut self, value: &T) {
        self.buf.extend_from_slice(bytemuck::bytes_of(value));
    }

    /// Read the next plain-old-data value.
    pub fn get<T: Pod>(&mut self) -> Result<T, BalanceError> {
        let size = std::mem::size_of::<T>();
        let end = self.cursor + size;
        if end > self.buf.len() {
            return Err(BalanceError::Protocol(format!(
                "message truncated: need {} bytes at offset {}, have {}",
                size,
                self.cursor,
                self.buf.len()
            )));
        }
        let value = bytemuck::pod_read_unaligned(&self.buf[self.cursor..end]);
        self.cursor = end;
        Ok(value)
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// The full underlying buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Pack a subtree and its traded boxes for sending up the tree.
pub fn pack_subtree_up(sender: i32, data: &SubtreeData) -> MessageStream {
    let mut msg = MessageStream::new();
    msg.put(&WireHeader {
        phase: Phase::Up as u8,
        pad: [0; 3],
        sender,
        num_items: data.work_traded.len() as i32,
        extra_size: std::mem::size_of::<WireSubtree>() as i32,
    });
    for item in data.work_traded.iter() {
        msg.put(&WireTransit::pack(item));
    }
    msg.put(&WireSubtree::pack(data));
    msg
}

/// Unpack a subtree received from a child.
pub fn unpack_subtree_up(bytes: Vec<u8>) -> Result<SubtreeData, BalanceError> {
    let mut msg = MessageStream::from_bytes(bytes);
    let header: WireHeader = msg.get()?;
    Phase::from_u8(header.phase).and_then(|phase| {
        if phase == Phase::Up {
            Ok(())
        } else {
            Err(BalanceError::Protocol(format!(
                "expected upward message, got {:?}",
                phase
            )))
        }
    })?;

    let mut items = Vec::with_capacity(header.num_items as usize);
    for _ in 0..header.num_items {
        let record: WireTransit = msg.get()?;
        items.push(record.unpack());
    }
    let summary: WireSubtree = msg.get()?;
    let mut data = summary.unpack();
    data.work_traded.insert_all(items)?;
    Ok(data)
}

/// Pack boxes granted to a child for sending down the tree.
pub fn pack_boxes_down(sender: i32, bin: &TransitSet) -> MessageStream {
    let mut msg = MessageStream::new();
    msg.put(&WireHeader {
        phase: Phase::Down as u8,
        pad: [0; 3],
        sender,
        num_items: bin.len() as i32,
        extra_size: 0,
    });
    for item in bin.iter() {
        msg.put(&WireTransit::pack(item));
    }
    msg
}

/// Unpack boxes received from the parent.
pub fn unpack_boxes_down(bytes: Vec<u8>) -> Result<Vec<BoxInTransit>, BalanceError> {
    let mut msg = MessageStream::from_bytes(bytes);
    let header: WireHeader = msg.get()?;
    if Phase::from_u8(header.phase)? != Phase::Down {
        return Err(BalanceError::Protocol(
            "expected downward message".to_string(),
        ));
    }
    let mut items = Vec::with_capacity(header.num_items as usize);
    for _ in 0..header.num_items {
        let record: WireTransit = msg.get()?;
        items.push(record.unpack());
    }
    Ok(items)
}

/// Pack a homogeneous list of records behind a header.
pub fn pack_records<T: Pod>(phase: Phase, sender: i32, records: &[T]) -> MessageStream {
    let mut msg = MessageStream::new();
    msg.put(&WireHeader {
        phase: phase as u8,
        pad: [0; 3],
        sender,
        num_items: records.len() as i32,
        extra_size: 0,
    });
    for record in records {
        msg.put(record);
    }
    msg
}

/// Unpack a homogeneous list of records, checking the phase.
pub fn unpack_records<T: Pod>(phase: Phase, bytes: Vec<u8>) -> Result<Vec<T>, BalanceError> {
    let mut msg = MessageStream::from_bytes(bytes);
    let header: WireHeader = msg.get()?;
    if Phase::from_u8(header.phase)? != phase {
        return Err(BalanceError::Protocol(format!(
            "message phase mismatch: expected {:?}",
            phase
        )));
    }
    let mut records = Vec::with_capacity(header.num_items as usize);
    for _ in 0..header.num_items {
        records.push(msg.get()?);
    }
    Ok(records)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_upward_message_carries_bin_and_summary() {
        let mut data = SubtreeData::for_single_process(2, 500.0, 400.0, 0.05);
        let mesh_box = MeshBox::new([0, 0, 0], [10, 10, 1], 0);
        data.work_traded
            .insert(BoxInTransit::from_origin(mesh_box, BoxId::new(2, 4)));

        let bytes = pack_subtree_up(2, &data).into_bytes();
        let unpacked = unpack_subtree_up(bytes).unwrap();

        assert_eq!(unpacked.rank, 2);
        assert_eq!(unpacked.load_current, 500.0);
        assert_eq!(unpacked.load_upperlimit, 420.0);
        assert_eq!(unpacked.work_traded.len(), 1);
        let item = unpacked.work_traded.first().unwrap();
        assert_eq!(item.mesh_box, mesh_box);
        assert_eq!(item.origin_id, BoxId::new(2, 4));
        assert!(!unpacked.wants_work_from_parent);
    }

    #[test]
    fn test_phase_is_checked() {
        let bin = TransitSet::new();
        let bytes = pack_boxes_down(0, &bin).into_bytes();
        assert!(unpack_subtree_up(bytes).is_err());
    }

    #[test]
    fn test_truncated_message_is_rejected() {
        let mut data = SubtreeData::for_single_process(0, 10.0, 10.0, 0.0);
        data.work_traded.insert(BoxInTransit::from_origin(
            MeshBox::new([0, 0, 0], [2, 2, 2], 0),
            BoxId::new(0, 0),
        ));
        let mut bytes = pack_subtree_up(0, &data).into_bytes();
        bytes.truncate(bytes.len() - 8);
        assert!(unpack_subtree_up(bytes).is_err());
    }
}
