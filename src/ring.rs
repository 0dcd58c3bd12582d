//! Partitioning of the registered buffer into per-peer receive rings and a send staging area.
//!
//! The buffer is laid out as
//!
//! ```text
//! | peer 0 ring | peer 1 ring | ... | peer N-1 ring | staging | padding to page |
//! ```
//!
//! Each ring holds `num_concurr_msgs` slots of `msg_size` bytes. In one-sided mode both ends of a
//! link walk the same slot index in lockstep, which is what lets the receiver infer an arrival
//! from the slot contents alone.
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::ibverbs::memory_region::PAGE_SIZE;

/// The byte expected at the first and last position of a slot once a remote write landed.
pub const SENTINEL: u8 = b'A';

/// A local piece of the registered buffer, as handed to a scatter / gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSlice {
    pub addr: u64,
    pub len: u32,
}

/// Sizes and offsets of every area in the registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    msg_size: usize,
    slots: usize,
    num_peers: usize,
    staging_slots: usize,
    total_len: usize,
}

impl MemoryLayout {
    /// Returns `None` when any dimension is zero or the total does not fit in memory.
    pub fn new(msg_size: usize, slots: usize, num_peers: usize, staging_slots: usize) -> Option<Self> {
        if msg_size == 0 || slots == 0 || num_peers == 0 || staging_slots == 0 {
            return None;
        }
        // every slot length goes into a u32 sge length
        u32::try_from(msg_size).ok()?;

        let ring_len = slots.checked_mul(msg_size)?;
        let recv_len = ring_len.checked_mul(num_peers)?;
        let staging_len = staging_slots.checked_mul(msg_size)?;
        let total_len = recv_len.checked_add(staging_len)?.checked_next_multiple_of(PAGE_SIZE)?;

        Some(MemoryLayout {
            msg_size,
            slots,
            num_peers,
            staging_slots,
            total_len,
        })
    }

    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Number of slots in every receive ring.
    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn num_peers(&self) -> usize {
        self.num_peers
    }

    pub fn staging_slots(&self) -> usize {
        self.staging_slots
    }

    /// Length of one peer's receive ring.
    pub fn ring_len(&self) -> usize {
        self.slots * self.msg_size
    }

    /// Offset of `peer`'s receive ring from the start of the buffer.
    pub fn recv_ring_offset(&self, peer: usize) -> usize {
        assert!(peer < self.num_peers, "peer {peer} out of range ({} peers)", self.num_peers);
        peer * self.ring_len()
    }

    pub fn staging_offset(&self) -> usize {
        self.num_peers * self.ring_len()
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }
}

/// Position on a ring of `slots` entries, advancing one slot per completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    slot: usize,
    slots: usize,
}

impl RingCursor {
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "a ring needs at least one slot");
        RingCursor { slot: 0, slots }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Byte offset of the current slot within its ring.
    pub fn offset(&self, msg_size: usize) -> usize {
        self.slot * msg_size
    }

    /// Move to the next slot, returning the one just left.
    pub fn advance(&mut self) -> usize {
        let current = self.slot;
        self.slot = (self.slot + 1) % self.slots;
        current
    }
}

/// One peer's receive ring. The hardware writes into it behind the compiler's back, so every
/// access goes through raw pointers and the sentinel bytes are read atomically.
#[derive(Debug)]
pub struct RecvRing<'buf> {
    base: NonNull<u8>,
    slots: usize,
    msg_size: usize,
    _buf: PhantomData<&'buf mut [u8]>,
}

unsafe impl Send for RecvRing<'_> {}

impl<'buf> RecvRing<'buf> {
    /// # Safety
    ///
    /// `base` must be valid for `slots * msg_size` bytes during `'buf` and no other ring may
    /// cover any of those bytes.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, slots: usize, msg_size: usize) -> Self {
        RecvRing {
            base,
            slots,
            msg_size,
            _buf: PhantomData,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Virtual address of the first slot, advertised to the peer as its write target.
    pub fn base_addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub fn slot_addr(&self, slot: usize) -> u64 {
        self.slot_ptr(slot) as u64
    }

    /// The whole slot, used as a receive or echo buffer.
    pub fn slice(&self, slot: usize) -> LocalSlice {
        LocalSlice {
            addr: self.slot_addr(slot),
            len: self.msg_size as u32,
        }
    }

    /// Whether a full message sits in `slot`: both its first and last byte carry [`SENTINEL`].
    ///
    /// This is a heuristic against the DMA write granularity of the adapter, not an ordering
    /// guarantee, and it assumes the sentinel never shows up where the payload would not put it.
    pub fn has_arrived(&self, slot: usize) -> bool {
        let first = self.slot_ptr(slot);
        let last = unsafe { first.add(self.msg_size - 1) };
        unsafe {
            AtomicU8::from_ptr(first).load(Ordering::Acquire) == SENTINEL
                && AtomicU8::from_ptr(last).load(Ordering::Acquire) == SENTINEL
        }
    }

    /// Zero `slot` so the next arrival can be told apart from the previous one.
    pub fn clear(&self, slot: usize) {
        let first = self.slot_ptr(slot);
        unsafe {
            AtomicU8::from_ptr(first).store(0, Ordering::Relaxed);
            if self.msg_size > 1 {
                let last = first.add(self.msg_size - 1);
                AtomicU8::from_ptr(last).store(0, Ordering::Relaxed);
            }
            if self.msg_size > 2 {
                ptr::write_bytes(first.add(1), 0, self.msg_size - 2);
            }
        }
        std::sync::atomic::fence(Ordering::Release);
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        assert!(slot < self.slots, "slot {slot} out of range ({} slots)", self.slots);
        unsafe { self.base.as_ptr().add(slot * self.msg_size) }
    }
}

/// Read-only source buffers for outgoing messages, shared by every lane.
#[derive(Debug, Clone, Copy)]
pub struct StagingArea<'buf> {
    base: NonNull<u8>,
    slots: usize,
    msg_size: usize,
    _buf: PhantomData<&'buf [u8]>,
}

unsafe impl Send for StagingArea<'_> {}
unsafe impl Sync for StagingArea<'_> {}

impl<'buf> StagingArea<'buf> {
    /// # Safety
    ///
    /// `base` must be valid for `slots * msg_size` bytes during `'buf` and nothing may write to
    /// them while the area is alive.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, slots: usize, msg_size: usize) -> Self {
        StagingArea {
            base,
            slots,
            msg_size,
            _buf: PhantomData,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// The payload held by `slot`.
    pub fn slice(&self, slot: usize) -> LocalSlice {
        assert!(slot < self.slots, "staging slot {slot} out of range ({} slots)", self.slots);
        LocalSlice {
            addr: self.base.as_ptr() as u64 + (slot * self.msg_size) as u64,
            len: self.msg_size as u32,
        }
    }

    /// A zero-length buffer for control messages that only carry immediate data.
    pub fn control_slice(&self) -> LocalSlice {
        LocalSlice {
            addr: self.base.as_ptr() as u64,
            len: 0,
        }
    }
}

/// The peer's receive ring for this link, as learned during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRing {
    base: u64,
    rkey: u32,
    slots: usize,
    msg_size: usize,
}

impl RemoteRing {
    pub fn new(base: u64, rkey: u32, slots: usize, msg_size: usize) -> Self {
        RemoteRing {
            base,
            rkey,
            slots,
            msg_size,
        }
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    pub fn slot_addr(&self, slot: usize) -> u64 {
        assert!(slot < self.slots, "remote slot {slot} out of range ({} slots)", self.slots);
        self.base + (slot * self.msg_size) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibverbs::memory_region::AlignedBuffer;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(64, 8, 1, 1, 4096)]
    #[case(64, 8, 3, 8, 4096)]
    #[case(4096, 8, 1, 1, 9 * 4096)]
    #[case(1000, 3, 2, 3, 3 * 4096)]
    fn test_layout_total_len(
        #[case] msg_size: usize, #[case] slots: usize, #[case] peers: usize, #[case] staging: usize,
        #[case] total: usize,
    ) {
        let layout = MemoryLayout::new(msg_size, slots, peers, staging).unwrap();
        assert_eq!(layout.total_len(), total);
        assert_eq!(layout.staging_offset(), peers * slots * msg_size);
        assert!(layout.staging_offset() + staging * msg_size <= layout.total_len());
    }

    #[rstest]
    #[case(0, 8, 1, 1)]
    #[case(64, 0, 1, 1)]
    #[case(64, 8, 0, 1)]
    #[case(usize::MAX / 2, 8, 1, 1)]
    fn test_layout_rejects_degenerate_sizes(
        #[case] msg_size: usize, #[case] slots: usize, #[case] peers: usize, #[case] staging: usize,
    ) {
        assert_eq!(MemoryLayout::new(msg_size, slots, peers, staging), None);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_recv_ring_offset_checks_peer() {
        let layout = MemoryLayout::new(64, 8, 2, 1).unwrap();
        layout.recv_ring_offset(2);
    }

    proptest! {
        #[test]
        fn test_cursor_is_periodic_and_bounded(msg_size in 1usize..=8192, slots in 1usize..=64, steps in 1usize..=512) {
            let ring_len = msg_size * slots;
            let mut cursor = RingCursor::new(slots);
            let mut offsets = Vec::with_capacity(steps);
            for _ in 0..steps {
                let offset = cursor.offset(msg_size);
                prop_assert!(offset < ring_len);
                prop_assert_eq!(offset % msg_size, 0);
                offsets.push(offset);
                cursor.advance();
            }
            let period = ring_len / msg_size;
            for i in period..offsets.len() {
                prop_assert_eq!(offsets[i], offsets[i - period]);
            }
        }

        #[test]
        fn test_rings_are_disjoint(msg_size in 1usize..=512, slots in 1usize..=16, peers in 1usize..=8) {
            let layout = MemoryLayout::new(msg_size, slots, peers, 1).unwrap();
            for peer in 0..peers {
                let start = layout.recv_ring_offset(peer);
                prop_assert_eq!(start, peer * layout.ring_len());
                prop_assert!(start + layout.ring_len() <= layout.staging_offset());
            }
        }
    }

    #[test]
    fn test_recv_ring_arrival_and_clear() {
        let buffer = AlignedBuffer::zeroed(PAGE_SIZE).unwrap();
        let ring = unsafe { RecvRing::from_raw(buffer.as_ptr(), 4, 16) };
        assert!(!ring.has_arrived(1));

        let slot = ring.slot_addr(1) as *mut u8;
        unsafe { ptr::write_bytes(slot, SENTINEL, 15) };
        assert!(!ring.has_arrived(1), "last byte still missing");
        unsafe { *slot.add(15) = SENTINEL };
        assert!(ring.has_arrived(1));
        assert!(!ring.has_arrived(0));

        ring.clear(1);
        assert!(!ring.has_arrived(1));
        let bytes = unsafe { std::slice::from_raw_parts(slot, 16) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_single_byte_slots() {
        let buffer = AlignedBuffer::zeroed(PAGE_SIZE).unwrap();
        let ring = unsafe { RecvRing::from_raw(buffer.as_ptr(), 2, 1) };
        unsafe { *(ring.slot_addr(0) as *mut u8) = SENTINEL };
        assert!(ring.has_arrived(0));
        ring.clear(0);
        assert!(!ring.has_arrived(0));
    }

    #[test]
    #[should_panic(expected = "slot 4 out of range")]
    fn test_slot_address_is_bounds_checked() {
        let buffer = AlignedBuffer::zeroed(PAGE_SIZE).unwrap();
        let ring = unsafe { RecvRing::from_raw(buffer.as_ptr(), 4, 16) };
        ring.slot_addr(4);
    }

    #[test]
    fn test_remote_ring_addresses() {
        let remote = RemoteRing::new(0x1000, 7, 8, 64);
        assert_eq!(remote.slot_addr(0), 0x1000);
        assert_eq!(remote.slot_addr(7), 0x1000 + 7 * 64);
        assert_eq!(remote.rkey(), 7);
    }
}
