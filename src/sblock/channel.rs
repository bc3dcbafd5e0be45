//! Channel entity and the acquire/release protocol.
//!
//! A channel owns one shared-memory region, a background monitor thread
//! driving the handshake, and the wait queues blocked producers/consumers
//! park on. Producers cycle buffers through `get` → fill → `send` (or
//! `put` to back out); consumers through `receive` → drain → `release`.
//!
//! Locking order, identical in every path: cross-core resource acquisition
//! first, then the one ring/pool lock the operation needs, then (briefly)
//! the occupancy side-array. `get`/`receive` keep their resource
//! acquisition when they return a buffer; the matching `put`/`send`/
//! `release` drops it. The acquisition is refcounted, so concurrent
//! holders stack instead of starving each other.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use super::layout::{BlockDesc, ChannelGeometry};
use super::monitor;
use super::ring::{BlockState, Dir, DirStats, RingView, Role};
use crate::sipc::fabric::SipcFabric;
use crate::sipc::smem::SmemRegion;
use crate::sipc::smsg::{Smsg, SmsgEndpoint, SmsgKind};
use crate::sipc::waitq::{Wait, WaitOutcome, WaitQueue};
use crate::error::{Result, SblockError};

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Not yet past the handshake, or the peer went away.
    Idle = 0,
    /// Handshake complete; transfer operations are allowed.
    Ready = 1,
}

/// Events delivered to the user callback from the monitor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SblockEvent {
    /// Handshake finished; the channel is usable.
    Opened,
    /// Peer closed or vanished; the channel is idle.
    Closed,
    /// The peer published at least one buffer into our RX ring.
    DataReady,
    /// The peer freed at least one buffer into our TX pool.
    BufferFreed,
}

/// Invoked on the channel's monitor thread; must not block on channel
/// operations or the event loop stalls.
pub type EventCallback = Box<dyn Fn(SblockEvent) + Send + Sync + 'static>;

/// Readable/writable snapshot, `poll(2)`-style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollFlags {
    pub readable: bool,
    pub writable: bool,
}

/// Pointer snapshot for both directions, diagnostic surface.
#[derive(Debug, Clone, Copy)]
pub struct ChannelStats {
    pub tx: DirStats,
    pub rx: DirStats,
}

/// A buffer checked out of the channel. Holding one keeps its block out of
/// circulation: a buffer that is never handed back to `put`/`send`/
/// `release` stays lost until the recovery protocol reclaims the block.
pub struct SblockBuffer {
    ptr: *mut u8,
    len: usize,
    cap: usize,
    addr: u32,
}

unsafe impl Send for SblockBuffer {}

impl SblockBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Bus address of the underlying block.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Valid bytes. For a buffer from `get` this starts at zero and is set
    /// by `write`/`set_len`; for a buffer from `receive` it is the length
    /// the producer sent.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.cap {
            return Err(SblockError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("length {} exceeds block capacity {}", len, self.cap),
            )));
        }
        self.len = len;
        Ok(())
    }

    /// Copy `data` into the block and set the valid length.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.cap {
            return Err(SblockError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("message too large ({} > {})", data.len(), self.cap),
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, data.len());
        }
        self.len = data.len();
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.cap) }
    }
}

impl fmt::Debug for SblockBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SblockBuffer")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("capacity", &self.cap)
            .finish()
    }
}

pub(crate) struct ChannelCore {
    pub(crate) channel_id: u8,
    pub(crate) role: Role,
    pub(crate) fabric: Arc<SipcFabric>,
    pub(crate) smsg: Arc<SmsgEndpoint>,
    state: AtomicU8,
    /// Set on the first transition to Ready; an OPEN after that is a
    /// reconnect and triggers recovery.
    pub(crate) was_ready: AtomicBool,
    /// True once destroy started; the monitor loop exits on it.
    pub(crate) stopping: AtomicBool,
    /// Host: set at creation. Client: set by the monitor after the INIT
    /// handshake reveals the region.
    ring: Mutex<Option<Arc<RingView>>>,
    /// The host's owned region (kept so the /dev/shm file lives as long as
    /// the channel). The client's attached region is owned by its view.
    region: Mutex<Option<Arc<SmemRegion>>>,
    pub(crate) getwait: WaitQueue,
    pub(crate) recvwait: WaitQueue,
    poll: Mutex<PollFlags>,
    pub(crate) callback: Option<EventCallback>,
}

impl ChannelCore {
    pub(crate) fn state(&self) -> ChannelState {
        if self.state.load(Ordering::Acquire) == ChannelState::Ready as u8 {
            ChannelState::Ready
        } else {
            ChannelState::Idle
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    /// Monitor-thread only: the handshake task is the single writer of the
    /// Ready/Idle transition. Wakes every parked caller so it re-evaluates.
    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
        if state == ChannelState::Ready {
            self.was_ready.store(true, Ordering::Release);
        }
        self.getwait.wake_all();
        self.recvwait.wake_all();
    }

    pub(crate) fn ring_view(&self) -> Result<Arc<RingView>> {
        self.ring.lock().clone().ok_or(SblockError::NotReady)
    }

    pub(crate) fn install_ring(&self, view: Arc<RingView>) {
        *self.ring.lock() = Some(view);
    }

    /// Bus base of the host-owned region, handed to the client at INIT.
    pub(crate) fn region_bus_base(&self) -> Option<u32> {
        self.region.lock().as_ref().map(|r| r.bus_base())
    }

    pub(crate) fn emit(&self, event: SblockEvent) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }

    pub(crate) fn set_readable(&self, readable: bool) {
        self.poll.lock().readable = readable;
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.poll.lock().writable = writable;
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(SblockError::NotReady)
        }
    }

    fn buffer_from(&self, ring: &RingView, desc: BlockDesc, len: usize) -> Result<SblockBuffer> {
        let ptr = ring
            .data_ptr(desc.addr)
            .map_err(|e| SblockError::Map(e.to_string()))?;
        Ok(SblockBuffer {
            ptr,
            len,
            cap: desc.length as usize,
            addr: desc.addr,
        })
    }

    /// Producer: take a free block out of the TX pool.
    pub(crate) fn get(&self, timeout_ms: i64) -> Result<SblockBuffer> {
        let wait = Wait::from_ms(timeout_ms);
        self.ensure_ready()?;
        let ring = self.ring_view()?;
        let resource = self.fabric.resource();

        resource.acquire()?;
        let no_data = {
            let _guard = ring.lock_pool(Dir::Tx);
            let empty = ring.pool(Dir::Tx).is_empty();
            self.set_writable(!empty);
            empty
        };

        if no_data {
            resource.release();
            if wait == Wait::NoWait {
                return Err(SblockError::NoData);
            }
            let outcome = self
                .getwait
                .wait_until(wait, || !self.is_ready() || !ring.pool(Dir::Tx).is_empty());
            if !self.is_ready() {
                return Err(SblockError::Reset);
            }
            if outcome == WaitOutcome::TimedOut {
                return Err(SblockError::Timeout);
            }
            resource.acquire()?;
        }

        // Re-check after the wait: another producer may have raced ahead.
        let desc = {
            let _guard = ring.lock_pool(Dir::Tx);
            let pool = ring.pool(Dir::Tx);
            if pool.is_empty() {
                self.set_writable(false);
                resource.release();
                return if self.is_ready() {
                    Err(SblockError::WouldBlock)
                } else {
                    Err(SblockError::Reset)
                };
            }
            let rd = pool.read_ptr();
            let desc = ring.read_desc(pool, rd);
            pool.set_read_ptr(rd.wrapping_add(1));
            if let Some(index) = ring.block_index(Dir::Tx, desc.addr) {
                let prev = ring.set_record(Dir::Tx, index, BlockState::Pending);
                if prev == BlockState::Pending {
                    tracing::warn!(
                        channel = self.channel_id,
                        index,
                        "pool handed out a block already checked out"
                    );
                }
            }
            self.set_writable(!pool.is_empty());
            desc
        };

        // Resource acquisition is handed to the matching put/send.
        match self.buffer_from(&ring, desc, 0) {
            Ok(buf) => Ok(buf),
            Err(e) => {
                resource.release();
                Err(e)
            }
        }
    }

    /// Producer: hand a block back to the pool unsent. Drops the resource
    /// reference taken by the matching `get`. Allowed in any state so a
    /// caller can always back out.
    pub(crate) fn put(&self, buf: SblockBuffer) -> Result<()> {
        let ring = self.ring_view()?;
        {
            let _guard = ring.lock_pool(Dir::Tx);
            let pool = ring.pool(Dir::Tx);
            if let Some(index) = ring.block_index(Dir::Tx, buf.addr) {
                if ring.record_state(Dir::Tx, index) == BlockState::Done {
                    tracing::warn!(
                        channel = self.channel_id,
                        index,
                        "double put of a free block"
                    );
                    return Err(SblockError::Protocol(format!(
                        "block {index} is not checked out"
                    )));
                }
                ring.set_record(Dir::Tx, index, BlockState::Done);
            }
            let wr = pool.write_ptr();
            ring.write_desc(
                pool,
                wr,
                BlockDesc {
                    addr: buf.addr,
                    length: pool.block_size,
                },
            );
            pool.set_write_ptr(wr.wrapping_add(1));
        }
        self.set_writable(true);
        self.getwait.wake_all();
        self.fabric.resource().release();
        Ok(())
    }

    fn send_ex(&self, buf: SblockBuffer, yell: bool) -> Result<()> {
        self.ensure_ready()?;
        let ring = self.ring_view()?;
        let mut notify = yell;
        {
            let _guard = ring.lock_ring(Dir::Tx);
            let ring_half = ring.ring(Dir::Tx);
            let wr = ring_half.write_ptr();
            ring.write_desc(
                ring_half,
                wr,
                BlockDesc {
                    addr: buf.addr,
                    length: buf.len as u32,
                },
            );
            ring_half.set_write_ptr(wr.wrapping_add(1));
            // Edge-triggered: the peer only needs a doorbell when the ring
            // leaves empty (its consumer may be parked) or hits full.
            let occupancy = ring_half.occupancy();
            if occupancy == 1 || occupancy >= ring_half.block_count {
                notify = true;
            }
            if let Some(index) = ring.block_index(Dir::Tx, buf.addr) {
                ring.set_record(Dir::Tx, index, BlockState::Done);
            }
        }
        if notify {
            let _ = self.smsg.send(Smsg::new(
                self.channel_id,
                SmsgKind::Event,
                monitor::EVENT_SEND,
                0,
            ));
        }
        self.fabric.resource().release();
        Ok(())
    }

    /// Producer: publish a filled block to the peer, always ringing the
    /// doorbell. Drops the resource reference taken by the matching `get`.
    pub(crate) fn send(&self, buf: SblockBuffer) -> Result<()> {
        self.send_ex(buf, true)
    }

    /// Batching variant: publish without ringing the doorbell (the
    /// empty→non-empty and full edges still ring it).
    pub(crate) fn send_prepare(&self, buf: SblockBuffer) -> Result<()> {
        self.send_ex(buf, false)
    }

    /// Flush a `send_prepare` batch: ring the doorbell if anything is
    /// still queued.
    pub(crate) fn send_finish(&self) -> Result<()> {
        self.ensure_ready()?;
        let ring = self.ring_view()?;
        if !ring.ring(Dir::Tx).is_empty() {
            let _ = self.smsg.send(Smsg::new(
                self.channel_id,
                SmsgKind::Event,
                monitor::EVENT_SEND,
                0,
            ));
        }
        Ok(())
    }

    /// Consumer: pull the next published block from the RX ring.
    pub(crate) fn receive(&self, timeout_ms: i64) -> Result<SblockBuffer> {
        let wait = Wait::from_ms(timeout_ms);
        self.ensure_ready()?;
        let ring = self.ring_view()?;
        let resource = self.fabric.resource();

        resource.acquire()?;
        let no_data = {
            let _guard = ring.lock_ring(Dir::Rx);
            let empty = ring.ring(Dir::Rx).is_empty();
            self.set_readable(!empty);
            empty
        };

        if no_data {
            resource.release();
            if wait == Wait::NoWait {
                return Err(SblockError::NoData);
            }
            let outcome = self
                .recvwait
                .wait_until(wait, || !self.is_ready() || !ring.ring(Dir::Rx).is_empty());
            if !self.is_ready() {
                return Err(SblockError::Reset);
            }
            if outcome == WaitOutcome::TimedOut {
                return Err(SblockError::Timeout);
            }
            resource.acquire()?;
        }

        let desc = {
            let _guard = ring.lock_ring(Dir::Rx);
            let ring_half = ring.ring(Dir::Rx);
            if ring_half.is_empty() {
                self.set_readable(false);
                resource.release();
                return if self.is_ready() {
                    Err(SblockError::WouldBlock)
                } else {
                    Err(SblockError::Reset)
                };
            }
            let rd = ring_half.read_ptr();
            let desc = ring.read_desc(ring_half, rd);
            ring_half.set_read_ptr(rd.wrapping_add(1));
            if let Some(index) = ring.block_index(Dir::Rx, desc.addr) {
                let prev = ring.set_record(Dir::Rx, index, BlockState::Pending);
                if prev == BlockState::Pending {
                    tracing::warn!(
                        channel = self.channel_id,
                        index,
                        "ring handed out a block already checked out"
                    );
                }
            }
            self.set_readable(!ring_half.is_empty());
            desc
        };

        let len = desc.length as usize;
        match self.buffer_from(&ring, desc, len) {
            Ok(buf) => Ok(buf),
            Err(e) => {
                resource.release();
                Err(e)
            }
        }
    }

    /// Consumer: hand a drained block back to the RX pool so the producer
    /// can reuse it. Drops the resource reference taken by the matching
    /// `receive`. Allowed in any state.
    pub(crate) fn release(&self, buf: SblockBuffer) -> Result<()> {
        let ring = self.ring_view()?;
        let mut notify = false;
        {
            let _guard = ring.lock_pool(Dir::Rx);
            let pool = ring.pool(Dir::Rx);
            if let Some(index) = ring.block_index(Dir::Rx, buf.addr) {
                if ring.record_state(Dir::Rx, index) == BlockState::Done {
                    tracing::warn!(
                        channel = self.channel_id,
                        index,
                        "double release of a free block"
                    );
                    return Err(SblockError::Protocol(format!(
                        "block {index} is not checked out"
                    )));
                }
                ring.set_record(Dir::Rx, index, BlockState::Done);
            }
            let wr = pool.write_ptr();
            ring.write_desc(
                pool,
                wr,
                BlockDesc {
                    addr: buf.addr,
                    length: pool.block_size,
                },
            );
            pool.set_write_ptr(wr.wrapping_add(1));
            // The producer side only needs the doorbell when the pool
            // leaves empty: its get callers may be parked.
            if pool.occupancy() == 1 {
                notify = true;
            }
        }
        if notify {
            let _ = self.smsg.send(Smsg::new(
                self.channel_id,
                SmsgKind::Event,
                monitor::EVENT_RELEASE,
                0,
            ));
        }
        self.fabric.resource().release();
        Ok(())
    }

    /// Recompute and publish both poll flags.
    pub(crate) fn poll(&self) -> PollFlags {
        let Ok(ring) = self.ring_view() else {
            return PollFlags::default();
        };
        let flags = PollFlags {
            readable: !ring.ring(Dir::Rx).is_empty(),
            writable: !ring.pool(Dir::Tx).is_empty(),
        };
        *self.poll.lock() = flags;
        flags
    }

    /// RX ring occupancy: blocks published by the peer, not yet received.
    pub(crate) fn arrived_count(&self) -> u32 {
        self.ring_view()
            .map(|r| r.ring(Dir::Rx).occupancy())
            .unwrap_or(0)
    }

    /// TX pool occupancy: free blocks a producer can get.
    pub(crate) fn free_count(&self) -> u32 {
        self.ring_view()
            .map(|r| r.pool(Dir::Tx).occupancy())
            .unwrap_or(0)
    }

    pub(crate) fn stats(&self) -> Result<ChannelStats> {
        let ring = self.ring_view()?;
        Ok(ChannelStats {
            tx: ring.stats(Dir::Tx),
            rx: ring.stats(Dir::Rx),
        })
    }
}

/// Handle to one channel. Obtained from [`crate::SblockManager`]; dropping
/// it without `destroy` kills the endpoint silently, which the peer
/// perceives as a core crash.
pub struct SblockChannel {
    pub(crate) core: Arc<ChannelCore>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SblockChannel {
    pub(crate) fn create_host(
        fabric: Arc<SipcFabric>,
        smsg: Arc<SmsgEndpoint>,
        channel_id: u8,
        geometry: ChannelGeometry,
        callback: Option<EventCallback>,
    ) -> Result<Arc<Self>> {
        if geometry.tx_count == 0
            || geometry.rx_count == 0
            || geometry.tx_size == 0
            || geometry.rx_size == 0
        {
            return Err(SblockError::Alloc("zero block geometry".into()));
        }
        let layout = geometry.layout();
        let region = Arc::new(
            SmemRegion::create(
                &fabric.smem_name(channel_id),
                layout.total,
                fabric.alloc_bus_window(layout.total),
            )
            .map_err(|e| SblockError::Alloc(e.to_string()))?,
        );
        RingView::init_region(&region, geometry);
        let view = RingView::new(region.clone(), Role::Host, fabric.lock_set(channel_id))
            .map_err(|e| SblockError::Map(e.to_string()))?;

        let core = Arc::new(ChannelCore {
            channel_id,
            role: Role::Host,
            fabric,
            smsg,
            state: AtomicU8::new(ChannelState::Idle as u8),
            was_ready: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            ring: Mutex::new(Some(Arc::new(view))),
            region: Mutex::new(Some(region)),
            getwait: WaitQueue::new(),
            recvwait: WaitQueue::new(),
            poll: Mutex::new(PollFlags::default()),
            callback,
        });
        let monitor = monitor::spawn(core.clone()).map_err(SblockError::Io)?;
        Ok(Arc::new(Self {
            core,
            monitor: Mutex::new(Some(monitor)),
        }))
    }

    pub(crate) fn create_client(
        fabric: Arc<SipcFabric>,
        smsg: Arc<SmsgEndpoint>,
        channel_id: u8,
        callback: Option<EventCallback>,
    ) -> Result<Arc<Self>> {
        let core = Arc::new(ChannelCore {
            channel_id,
            role: Role::Client,
            fabric,
            smsg,
            state: AtomicU8::new(ChannelState::Idle as u8),
            was_ready: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            ring: Mutex::new(None),
            region: Mutex::new(None),
            getwait: WaitQueue::new(),
            recvwait: WaitQueue::new(),
            poll: Mutex::new(PollFlags::default()),
            callback,
        });
        let monitor = monitor::spawn(core.clone()).map_err(SblockError::Io)?;
        Ok(Arc::new(Self {
            core,
            monitor: Mutex::new(Some(monitor)),
        }))
    }

    pub fn channel_id(&self) -> u8 {
        self.core.channel_id
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Block until the handshake completes, up to `timeout_ms` (same
    /// semantics as the transfer timeouts: 0 = poll, negative = forever).
    pub fn wait_until_ready(&self, timeout_ms: i64) -> bool {
        let wait = Wait::from_ms(timeout_ms);
        if self.is_ready() {
            return true;
        }
        if wait == Wait::NoWait {
            return false;
        }
        self.core.getwait.wait_until(wait, || self.core.is_ready()) == WaitOutcome::Ready
    }

    /// See [`ChannelCore::get`]: producer-side block acquisition.
    /// `timeout_ms`: 0 = poll, negative = wait forever, positive = bounded.
    pub fn get(&self, timeout_ms: i64) -> Result<SblockBuffer> {
        self.core.get(timeout_ms)
    }

    pub fn put(&self, buf: SblockBuffer) -> Result<()> {
        self.core.put(buf)
    }

    pub fn send(&self, buf: SblockBuffer) -> Result<()> {
        self.core.send(buf)
    }

    pub fn send_prepare(&self, buf: SblockBuffer) -> Result<()> {
        self.core.send_prepare(buf)
    }

    pub fn send_finish(&self) -> Result<()> {
        self.core.send_finish()
    }

    pub fn receive(&self, timeout_ms: i64) -> Result<SblockBuffer> {
        self.core.receive(timeout_ms)
    }

    pub fn release(&self, buf: SblockBuffer) -> Result<()> {
        self.core.release(buf)
    }

    pub fn poll(&self) -> PollFlags {
        self.core.poll()
    }

    pub fn arrived_count(&self) -> u32 {
        self.core.arrived_count()
    }

    pub fn free_count(&self) -> u32 {
        self.core.free_count()
    }

    pub fn stats(&self) -> Result<ChannelStats> {
        self.core.stats()
    }

    /// Graceful teardown: tell the peer, force-wake every parked caller,
    /// stop the monitor thread. The host's region is freed when the last
    /// buffer/view reference drops; a client never frees the region.
    pub fn destroy(&self) {
        if self.core.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.core.smsg.send(Smsg::new(
            self.core.channel_id,
            SmsgKind::Close,
            monitor::FLAG_REQ,
            0,
        ));
        self.core.set_state(ChannelState::Idle);
        self.core.smsg.ch_close(self.core.channel_id);
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
        *self.core.region.lock() = None;
    }
}

impl Drop for SblockChannel {
    fn drop(&mut self) {
        // Abrupt path: no CLOSE reaches the peer, which is exactly what a
        // crashed core looks like from the other side.
        if !self.core.stopping.swap(true, Ordering::AcqRel) {
            self.core.set_state(ChannelState::Idle);
            self.core.smsg.ch_close(self.core.channel_id);
            if let Some(handle) = self.monitor.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

impl fmt::Debug for SblockChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("SblockChannel");
        dbg.field("channel", &self.core.channel_id)
            .field("role", &self.core.role)
            .field("state", &self.core.state());
        if let Ok(stats) = self.core.stats() {
            dbg.field("tx", &stats.tx).field("rx", &stats.rx);
        }
        dbg.finish()
    }
}
