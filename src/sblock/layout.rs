//! Shared-memory layout for one block channel.
//!
//! The region is written by both cores, so every struct here is `#[repr(C)]`
//! with a frozen field order. The read/write pointers are monotonically
//! increasing 32-bit counters, not indices: the slot a counter refers to is
//! `counter mod block_count`, and `write - read` (wrapping) is the occupancy.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  SblockHeader                                                 │
//! │    ring  { tx: RingHalf, rx: RingHalf }                       │
//! │    pool  { tx: RingHalf, rx: RingHalf }                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ring TX BlockDesc[tx_count]   (descriptors queued to peer)   │
//! │  ring RX BlockDesc[rx_count]                                  │
//! │  pool TX BlockDesc[tx_count]   (free-list descriptors)        │
//! │  pool RX BlockDesc[rx_count]                                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  TX block data   (tx_count × tx_size)                         │
//! │  RX block data   (rx_count × rx_size)                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! "TX" and "RX" are named from the host's perspective; the client reads
//! the same header with the halves swapped.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

/// One slot descriptor: absolute bus address of the block plus the number
/// of valid bytes in it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDesc {
    pub addr: u32,
    pub length: u32,
}

/// One direction of one structure (ring or pool): a 6-word record.
///
/// `read_ptr`/`write_ptr` are shared with the peer core and must only be
/// touched through the atomic accessors; the other four words are written
/// once by the host during initialisation and read-only afterwards.
#[repr(C)]
pub struct RingHalf {
    /// Bus address of this direction's block data array.
    pub block_addr: u32,
    pub block_count: u32,
    pub block_size: u32,
    /// Bus address of this direction's `BlockDesc` array.
    pub blks_addr: u32,
    pub read_ptr: AtomicU32,
    pub write_ptr: AtomicU32,
}

/// TX and RX records of one structure (the ring, or the pool).
#[repr(C)]
pub struct RingHeader {
    pub tx: RingHalf,
    pub rx: RingHalf,
}

/// The full channel header: ring description, then pool description.
#[repr(C)]
pub struct SblockHeader {
    pub ring: RingHeader,
    pub pool: RingHeader,
}

const _: () = assert!(size_of::<BlockDesc>() == 8);
const _: () = assert!(size_of::<RingHalf>() == 24);
const _: () = assert!(size_of::<RingHeader>() == 48);
const _: () = assert!(size_of::<SblockHeader>() == 96);

/// Slot index for a monotonic counter. Must match bit-for-bit on both
/// cores; power-of-two capacities take the mask fast path.
#[inline]
pub fn ring_position(counter: u32, capacity: u32) -> u32 {
    if capacity.is_power_of_two() {
        counter & (capacity - 1)
    } else {
        counter % capacity
    }
}

/// Occupied-slot count, wrapping at the u32 boundary. Valid states keep
/// this in `[0, block_count]`.
#[inline]
pub fn occupancy(write_ptr: u32, read_ptr: u32) -> u32 {
    write_ptr.wrapping_sub(read_ptr)
}

impl RingHalf {
    pub fn read_ptr(&self) -> u32 {
        self.read_ptr.load(Ordering::Acquire)
    }

    pub fn write_ptr(&self) -> u32 {
        self.write_ptr.load(Ordering::Acquire)
    }

    pub fn set_read_ptr(&self, v: u32) {
        self.read_ptr.store(v, Ordering::Release);
    }

    pub fn set_write_ptr(&self, v: u32) {
        self.write_ptr.store(v, Ordering::Release);
    }

    pub fn occupancy(&self) -> u32 {
        occupancy(self.write_ptr(), self.read_ptr())
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    pub fn is_full(&self) -> bool {
        self.occupancy() >= self.block_count
    }

    pub fn position(&self, counter: u32) -> u32 {
        ring_position(counter, self.block_count)
    }
}

/// Block geometry requested at channel creation, host perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGeometry {
    pub tx_count: u32,
    pub tx_size: u32,
    pub rx_count: u32,
    pub rx_size: u32,
}

/// Byte offsets of every section of the region, derived from the geometry.
#[derive(Debug, Clone, Copy)]
pub struct RegionLayout {
    pub ring_tx_blks: usize,
    pub ring_rx_blks: usize,
    pub pool_tx_blks: usize,
    pub pool_rx_blks: usize,
    pub tx_data: usize,
    pub rx_data: usize,
    pub total: usize,
}

impl ChannelGeometry {
    /// Compute section offsets. Both the ring view and the pool view carry
    /// their own descriptor array, hence two `BlockDesc` runs per direction.
    pub fn layout(&self) -> RegionLayout {
        let desc = size_of::<BlockDesc>();
        let ring_tx_blks = size_of::<SblockHeader>();
        let ring_rx_blks = ring_tx_blks + self.tx_count as usize * desc;
        let pool_tx_blks = ring_rx_blks + self.rx_count as usize * desc;
        let pool_rx_blks = pool_tx_blks + self.tx_count as usize * desc;
        let tx_data = pool_rx_blks + self.rx_count as usize * desc;
        let rx_data = tx_data + (self.tx_count * self.tx_size) as usize;
        let total = rx_data + (self.rx_count * self.rx_size) as usize;
        RegionLayout {
            ring_tx_blks,
            ring_rx_blks,
            pool_tx_blks,
            pool_rx_blks,
            tx_data,
            rx_data,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_power_of_two_matches_modulo() {
        for counter in [0u32, 1, 7, 8, 9, 255, 256, u32::MAX] {
            assert_eq!(ring_position(counter, 8), counter % 8);
        }
    }

    #[test]
    fn position_non_power_of_two() {
        assert_eq!(ring_position(7, 3), 1);
        assert_eq!(ring_position(9, 3), 0);
    }

    #[test]
    fn occupancy_wraps_at_u32_boundary() {
        assert_eq!(occupancy(3, u32::MAX - 1), 5);
        assert_eq!(occupancy(5, 5), 0);
        assert_eq!(occupancy(9, 5), 4);
    }

    #[test]
    fn layout_accounts_for_both_descriptor_runs() {
        let geo = ChannelGeometry {
            tx_count: 4,
            tx_size: 128,
            rx_count: 2,
            rx_size: 64,
        };
        let layout = geo.layout();
        let descs = (4 + 2) * size_of::<BlockDesc>() * 2;
        assert_eq!(
            layout.total,
            size_of::<SblockHeader>() + descs + 4 * 128 + 2 * 64
        );
    }
}
