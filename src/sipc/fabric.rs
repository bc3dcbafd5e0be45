// In-process stand-in for the interconnect between the two cores: the
// control-message bus, the shared-memory naming/addressing scheme, the
// resource lock, and the per-channel lock sets both endpoints serialise
// pointer mutations through.
//
// In a two-kernel deployment the lock sets would be hardware spinlocks in
// shared memory; here they are ordinary mutexes shared via the fabric.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use super::resource::ResourceLock;
use super::smsg::{Side, SmsgBus, SmsgEndpoint};

/// Host-oriented direction index into a [`ChannelLockSet`].
pub const DIR_TX: usize = 0;
pub const DIR_RX: usize = 1;

/// The four locks guarding one channel's shared pointer words, indexed by
/// host-oriented direction. Always acquired inside a resource-lock
/// acquisition, never the other way around.
pub struct ChannelLockSet {
    pub ring: [CachePadded<Mutex<()>>; 2],
    pub pool: [CachePadded<Mutex<()>>; 2],
}

impl ChannelLockSet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ring: [
                CachePadded::new(Mutex::new(())),
                CachePadded::new(Mutex::new(())),
            ],
            pool: [
                CachePadded::new(Mutex::new(())),
                CachePadded::new(Mutex::new(())),
            ],
        })
    }
}

static FABRIC_SEQ: AtomicU64 = AtomicU64::new(0);

/// One destination core's fabric: everything both endpoints of that pair
/// share outside the block regions themselves.
pub struct SipcFabric {
    name: String,
    bus: Arc<SmsgBus>,
    resource: Arc<ResourceLock>,
    next_bus_addr: AtomicU32,
    channel_locks: Mutex<HashMap<u8, Arc<ChannelLockSet>>>,
}

impl SipcFabric {
    /// Create a fabric with a process-unique shared-memory namespace and
    /// a bus address window starting at `bus_base`.
    pub fn new(bus_base: u32) -> Arc<Self> {
        let seq = FABRIC_SEQ.fetch_add(1, Ordering::Relaxed);
        Self::with_name(format!("sblock-{}-{}", std::process::id(), seq), bus_base)
    }

    /// Create a fabric with an explicit shared-memory namespace; regions
    /// are created under `/dev/shm/<name>-ch<channel>`.
    pub fn with_name(name: String, bus_base: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            bus: SmsgBus::new(),
            resource: Arc::new(ResourceLock::new()),
            next_bus_addr: AtomicU32::new(bus_base),
            channel_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a core to the fabric, replacing any previous occupant of
    /// that side (a restarted core).
    pub fn attach(self: &Arc<Self>, side: Side) -> SipcPort {
        SipcPort {
            fabric: self.clone(),
            endpoint: Arc::new(self.bus.attach(side)),
            side,
        }
    }

    pub fn resource(&self) -> &Arc<ResourceLock> {
        &self.resource
    }

    /// Shared lock set for `channel`, created on first use.
    pub fn lock_set(&self, channel: u8) -> Arc<ChannelLockSet> {
        self.channel_locks
            .lock()
            .entry(channel)
            .or_insert_with(ChannelLockSet::new)
            .clone()
    }

    /// Reserve a bus address window for a region of `size` bytes.
    pub fn alloc_bus_window(&self, size: usize) -> u32 {
        let aligned = ((size + 127) & !127) as u32;
        self.next_bus_addr.fetch_add(aligned, Ordering::Relaxed)
    }

    /// /dev/shm name for one channel's region.
    pub fn smem_name(&self, channel: u8) -> String {
        format!("{}-ch{}", self.name, channel)
    }

    /// Permanent teardown: fail all blocked resource acquisitions.
    pub fn shutdown(&self) {
        self.resource.shutdown();
    }
}

/// One core's handle on a fabric.
pub struct SipcPort {
    fabric: Arc<SipcFabric>,
    endpoint: Arc<SmsgEndpoint>,
    side: Side,
}

impl SipcPort {
    pub fn fabric(&self) -> &Arc<SipcFabric> {
        &self.fabric
    }

    pub fn smsg(&self) -> &Arc<SmsgEndpoint> {
        &self.endpoint
    }

    pub fn side(&self) -> Side {
        self.side
    }
}
