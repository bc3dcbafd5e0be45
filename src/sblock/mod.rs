//! Block-channel transport: channel registry and public surface.

pub mod channel;
pub mod layout;
mod monitor;
pub mod ring;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

pub use channel::{
    ChannelState, ChannelStats, EventCallback, PollFlags, SblockBuffer, SblockChannel,
    SblockEvent,
};
pub use layout::ChannelGeometry;
pub use ring::{BlockState, Dir, DirStats, Role};

use crate::error::{Result, SblockError};
use crate::sipc::fabric::SipcPort;

/// Owner of every channel on this core, keyed by (destination core,
/// channel id). One port per destination core must be attached before
/// channels to that core can be created.
pub struct SblockManager {
    ports: Mutex<HashMap<u8, SipcPort>>,
    channels: Mutex<HashMap<(u8, u8), Arc<SblockChannel>>>,
}

impl SblockManager {
    pub fn new() -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Register the fabric port reaching destination core `core`.
    pub fn attach_core(&self, core: u8, port: SipcPort) -> Result<()> {
        let mut ports = self.ports.lock();
        if ports.contains_key(&core) {
            return Err(SblockError::AlreadyExists { core, channel: 0 });
        }
        ports.insert(core, port);
        Ok(())
    }

    fn port_parts(
        &self,
        core: u8,
    ) -> Result<(
        Arc<crate::sipc::fabric::SipcFabric>,
        Arc<crate::sipc::smsg::SmsgEndpoint>,
    )> {
        let ports = self.ports.lock();
        let port = ports.get(&core).ok_or(SblockError::NotReady)?;
        Ok((port.fabric().clone(), port.smsg().clone()))
    }

    /// Create the host end of a channel: allocates and initialises the
    /// shared region, then starts the handshake monitor.
    pub fn create_host(
        &self,
        core: u8,
        channel: u8,
        geometry: ChannelGeometry,
        callback: Option<EventCallback>,
    ) -> Result<Arc<SblockChannel>> {
        let (fabric, smsg) = self.port_parts(core)?;
        let mut channels = self.channels.lock();
        if channels.contains_key(&(core, channel)) {
            return Err(SblockError::AlreadyExists { core, channel });
        }
        let ch = SblockChannel::create_host(fabric, smsg, channel, geometry, callback)?;
        channels.insert((core, channel), ch.clone());
        Ok(ch)
    }

    /// Create the client end of a channel. Returns immediately; the
    /// channel turns Ready once the handshake with the host completes.
    pub fn create_client(
        &self,
        core: u8,
        channel: u8,
        callback: Option<EventCallback>,
    ) -> Result<Arc<SblockChannel>> {
        let (fabric, smsg) = self.port_parts(core)?;
        let mut channels = self.channels.lock();
        if channels.contains_key(&(core, channel)) {
            return Err(SblockError::AlreadyExists { core, channel });
        }
        let ch = SblockChannel::create_client(fabric, smsg, channel, callback)?;
        channels.insert((core, channel), ch.clone());
        Ok(ch)
    }

    /// Look up a live channel.
    pub fn channel(&self, core: u8, channel: u8) -> Option<Arc<SblockChannel>> {
        self.channels.lock().get(&(core, channel)).cloned()
    }

    /// Graceful teardown of one channel: CLOSE handshake, forced wake of
    /// all parked callers, monitor stop, registry removal.
    pub fn destroy(&self, core: u8, channel: u8) -> Result<()> {
        let ch = self
            .channels
            .lock()
            .remove(&(core, channel))
            .ok_or(SblockError::NotReady)?;
        ch.destroy();
        Ok(())
    }
}

impl Default for SblockManager {
    fn default() -> Self {
        Self::new()
    }
}
