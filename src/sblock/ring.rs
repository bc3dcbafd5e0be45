//! Runtime view over one channel's shared-memory region.
//!
//! This struct is NOT stored in shared memory. It is a transient view that
//! holds pointers into the mapped region, plus the local occupancy
//! side-arrays that survive a peer restart (they live on this core).
//!
//! Both endpoints hold a view over the same physical region; the client's
//! view swaps the TX/RX halves so that "TX" always means "the direction I
//! produce into" locally. Pointer words are only mutated while holding the
//! matching lock from the shared [`ChannelLockSet`].

use std::io;
use std::ptr;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::layout::{BlockDesc, ChannelGeometry, RingHalf, SblockHeader};
use crate::sipc::fabric::{ChannelLockSet, DIR_RX, DIR_TX};
use crate::sipc::smem::SmemRegion;

/// Which end of the channel this view belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Allocated and owns the region.
    Host,
    /// Mapped a region described by the host during the handshake.
    Client,
}

/// Transfer direction from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Tx,
    Rx,
}

impl Dir {
    pub fn index(self) -> usize {
        match self {
            Dir::Tx => 0,
            Dir::Rx => 1,
        }
    }
}

/// Per-block occupancy state, local bookkeeping only. `Done` means the
/// block is circulating (in pool or ring); `Pending` means a local caller
/// holds it between get/put or receive/release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Done,
    Pending,
}

/// Pointer snapshot for one direction, diagnostic surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirStats {
    pub ring_read: u32,
    pub ring_write: u32,
    pub pool_read: u32,
    pub pool_write: u32,
    pub pending: u32,
}

pub struct RingView {
    region: Arc<SmemRegion>,
    header: *mut SblockHeader,
    role: Role,
    locks: Arc<ChannelLockSet>,
    /// Occupancy side-arrays indexed by local direction, then by physical
    /// block index.
    records: [Mutex<Box<[BlockState]>>; 2],
}

// The raw pointers all target the shared mapping, which outlives the view
// via `region`; cross-thread access is serialised by the lock set.
unsafe impl Send for RingView {}
unsafe impl Sync for RingView {}

impl RingView {
    /// Host-side: lay out and initialise a fresh region. Every block starts
    /// free: pool write pointers at `block_count`, ring pointers at zero.
    pub fn init_region(region: &SmemRegion, geo: ChannelGeometry) {
        let layout = geo.layout();
        debug_assert!(layout.total <= region.size());
        let header = region.as_ptr() as *mut SblockHeader;

        let half = |block_addr: usize, count: u32, size: u32, blks: usize, wr: u32| RingHalf {
            block_addr: region.bus_addr(block_addr),
            block_count: count,
            block_size: size,
            blks_addr: region.bus_addr(blks),
            read_ptr: 0.into(),
            write_ptr: wr.into(),
        };

        let hdr = SblockHeader {
            ring: super::layout::RingHeader {
                tx: half(layout.tx_data, geo.tx_count, geo.tx_size, layout.ring_tx_blks, 0),
                rx: half(layout.rx_data, geo.rx_count, geo.rx_size, layout.ring_rx_blks, 0),
            },
            pool: super::layout::RingHeader {
                tx: half(
                    layout.tx_data,
                    geo.tx_count,
                    geo.tx_size,
                    layout.pool_tx_blks,
                    geo.tx_count,
                ),
                rx: half(
                    layout.rx_data,
                    geo.rx_count,
                    geo.rx_size,
                    layout.pool_rx_blks,
                    geo.rx_count,
                ),
            },
        };
        unsafe { ptr::write(header, hdr) };

        // Seed both pool descriptor arrays with every block present.
        let seed = |blks_off: usize, data_off: usize, count: u32, size: u32| {
            let base = unsafe { region.as_ptr().add(blks_off) } as *mut BlockDesc;
            for i in 0..count {
                let desc = BlockDesc {
                    addr: region.bus_addr(data_off + (i * size) as usize),
                    length: size,
                };
                unsafe { ptr::write_volatile(base.add(i as usize), desc) };
            }
        };
        seed(layout.pool_tx_blks, layout.tx_data, geo.tx_count, geo.tx_size);
        seed(layout.pool_rx_blks, layout.rx_data, geo.rx_count, geo.rx_size);
    }

    /// Build a view over an initialised region. Validates that the header
    /// geometry stays inside the mapped window before trusting it.
    pub fn new(
        region: Arc<SmemRegion>,
        role: Role,
        locks: Arc<ChannelLockSet>,
    ) -> io::Result<Self> {
        if region.size() < std::mem::size_of::<SblockHeader>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "region smaller than channel header",
            ));
        }
        let header = region.as_ptr() as *mut SblockHeader;

        let validate = |half: &RingHalf| -> io::Result<()> {
            if half.block_count == 0 || half.block_size == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "zero block geometry in channel header",
                ));
            }
            region.offset_of(half.block_addr)?;
            region.offset_of(half.blks_addr)?;
            Ok(())
        };
        unsafe {
            validate(&(*header).ring.tx)?;
            validate(&(*header).ring.rx)?;
            validate(&(*header).pool.tx)?;
            validate(&(*header).pool.rx)?;
        }

        let record_for = |count: u32| Mutex::new(vec![BlockState::Done; count as usize].into());
        let (tx_count, rx_count) = unsafe {
            match role {
                Role::Host => ((*header).pool.tx.block_count, (*header).pool.rx.block_count),
                Role::Client => ((*header).pool.rx.block_count, (*header).pool.tx.block_count),
            }
        };

        Ok(Self {
            region,
            header,
            role,
            locks,
            records: [record_for(tx_count), record_for(rx_count)],
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Host-oriented index for a local direction; the client is swapped.
    fn host_dir(&self, dir: Dir) -> usize {
        match (self.role, dir) {
            (Role::Host, Dir::Tx) | (Role::Client, Dir::Rx) => DIR_TX,
            (Role::Host, Dir::Rx) | (Role::Client, Dir::Tx) => DIR_RX,
        }
    }

    fn half<'a>(&self, of: &'a super::layout::RingHeader, dir: Dir) -> &'a RingHalf {
        match self.host_dir(dir) {
            DIR_TX => &of.tx,
            _ => &of.rx,
        }
    }

    /// Ring record for a local direction.
    pub fn ring(&self, dir: Dir) -> &RingHalf {
        self.half(unsafe { &(*self.header).ring }, dir)
    }

    /// Pool record for a local direction.
    pub fn pool(&self, dir: Dir) -> &RingHalf {
        self.half(unsafe { &(*self.header).pool }, dir)
    }

    pub fn lock_ring(&self, dir: Dir) -> MutexGuard<'_, ()> {
        self.locks.ring[self.host_dir(dir)].lock()
    }

    pub fn lock_pool(&self, dir: Dir) -> MutexGuard<'_, ()> {
        self.locks.pool[self.host_dir(dir)].lock()
    }

    /// Read the descriptor a counter refers to. Volatile: the peer core
    /// writes these words.
    pub fn read_desc(&self, half: &RingHalf, counter: u32) -> BlockDesc {
        let base = self.desc_base(half);
        let pos = half.position(counter) as usize;
        unsafe { ptr::read_volatile(base.add(pos)) }
    }

    /// Write the descriptor slot a counter refers to.
    pub fn write_desc(&self, half: &RingHalf, counter: u32, desc: BlockDesc) {
        let base = self.desc_base(half);
        let pos = half.position(counter) as usize;
        unsafe { ptr::write_volatile(base.add(pos), desc) };
    }

    fn desc_base(&self, half: &RingHalf) -> *mut BlockDesc {
        // Validated against the window in `new`/`init_region`.
        self.region
            .ptr_at(half.blks_addr)
            .expect("descriptor array address validated at construction") as *mut BlockDesc
    }

    /// Physical block index for a bus address within a direction, or None
    /// if the address does not belong to that block array.
    pub fn block_index(&self, dir: Dir, addr: u32) -> Option<usize> {
        let pool = self.pool(dir);
        let off = addr.wrapping_sub(pool.block_addr);
        let idx = (off / pool.block_size) as usize;
        if off % pool.block_size != 0 || idx >= pool.block_count as usize {
            return None;
        }
        Some(idx)
    }

    /// Virtual pointer for a block's bus address.
    pub fn data_ptr(&self, addr: u32) -> io::Result<*mut u8> {
        self.region.ptr_at(addr)
    }

    /// Flip one occupancy entry, returning the previous state.
    pub fn set_record(&self, dir: Dir, index: usize, state: BlockState) -> BlockState {
        let mut rec = self.records[dir.index()].lock();
        let prev = rec[index];
        rec[index] = state;
        prev
    }

    pub fn record_state(&self, dir: Dir, index: usize) -> BlockState {
        self.records[dir.index()].lock()[index]
    }

    /// Rebuild one direction after a peer restart: drain the ring, then
    /// reconstruct the pool from the occupancy side-array instead of
    /// trusting the old pool pointers. Retracting the pool write pointer
    /// (rather than advancing the read pointer) makes a second run with no
    /// intervening traffic a no-op.
    pub fn recover_direction(&self, dir: Dir) {
        let _pool_guard = self.lock_pool(dir);
        let _ring_guard = self.lock_ring(dir);
        let rec = self.records[dir.index()].lock();

        let ring = self.ring(dir);
        ring.set_read_ptr(ring.write_ptr());

        let pool = self.pool(dir);
        let mut wr = pool.read_ptr();
        for (i, state) in rec.iter().enumerate() {
            if *state == BlockState::Done {
                self.write_desc(
                    pool,
                    wr,
                    BlockDesc {
                        addr: pool.block_addr + i as u32 * pool.block_size,
                        length: pool.block_size,
                    },
                );
                wr = wr.wrapping_add(1);
            }
        }
        pool.set_write_ptr(wr);
    }

    /// Pointer snapshot plus held-block count for one direction. Takes the
    /// same locks the transfer paths take so the snapshot is consistent.
    pub fn stats(&self, dir: Dir) -> DirStats {
        let _pool_guard = self.lock_pool(dir);
        let _ring_guard = self.lock_ring(dir);
        let ring = self.ring(dir);
        let pool = self.pool(dir);
        let pending = self.records[dir.index()]
            .lock()
            .iter()
            .filter(|s| **s == BlockState::Pending)
            .count() as u32;
        DirStats {
            ring_read: ring.read_ptr(),
            ring_write: ring.write_ptr(),
            pool_read: pool.read_ptr(),
            pool_write: pool.write_ptr(),
            pending,
        }
    }
}
