//! Per-channel monitor thread.
//!
//! The monitor owns the control-channel conversation: the INIT handshake,
//! OPEN/CLOSE lifecycle (including reconnect-triggered recovery), and
//! doorbell dispatch to wait queues and the user callback. It is the only
//! writer of the Ready/Idle transition; everything else reads the state
//! and re-checks after taking its lock.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::channel::{ChannelCore, ChannelState, SblockEvent};
use super::layout::SblockHeader;
use super::ring::{Dir, RingView, Role};
use crate::sipc::smem::SmemRegion;
use crate::sipc::smsg::{Smsg, SmsgKind};
use crate::error::{Result, SblockError};

pub(crate) const FLAG_REQ: u16 = 0x0;
pub(crate) const FLAG_ACK: u16 = 0x1;
/// CMD/DONE sub-code: exchange the region base address.
pub(crate) const CMD_INIT: u16 = 0x10;
/// EVENT sub-code: producer published into the ring.
pub(crate) const EVENT_SEND: u16 = 0x20;
/// EVENT sub-code: consumer freed into the pool.
pub(crate) const EVENT_RELEASE: u16 = 0x21;

pub(crate) fn spawn(core: Arc<ChannelCore>) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("sblock-ch{}", core.channel_id))
        .spawn(move || run(core))
}

fn run(core: Arc<ChannelCore>) {
    let channel = core.channel_id;
    if core.smsg.ch_open(channel).is_err() {
        tracing::debug!(channel, "monitor exiting before peer rendezvous");
        return;
    }
    match core.role {
        Role::Host => host_loop(&core),
        Role::Client => client_loop(&core),
    }
    tracing::debug!(channel, "monitor stopped");
}

fn host_loop(core: &Arc<ChannelCore>) {
    let channel = core.channel_id;
    loop {
        let msg = match core.smsg.recv(channel) {
            Ok(msg) => msg,
            Err(_) => break,
        };
        if core.stopping.load(Ordering::Acquire) {
            break;
        }
        match (msg.kind, msg.flag) {
            (SmsgKind::Cmd, CMD_INIT) => {
                // Client asks where the shared memory is.
                match core.region_bus_base() {
                    Some(base) => {
                        let _ = core
                            .smsg
                            .send(Smsg::new(channel, SmsgKind::Done, CMD_INIT, base));
                    }
                    None => tracing::warn!(channel, "INIT received but no region allocated"),
                }
            }
            (SmsgKind::Open, FLAG_REQ) => {
                if core.was_ready.load(Ordering::Acquire) {
                    // Peer restarted while we stayed up: drop anything it
                    // could not have produced/consumed consistently, then
                    // rebuild the pools from local ground truth.
                    tracing::debug!(channel, "peer reconnect, rebuilding rings");
                    core.emit(SblockEvent::Closed);
                    if let Ok(ring) = core.ring_view() {
                        ring.recover_direction(Dir::Tx);
                        ring.recover_direction(Dir::Rx);
                        core.set_writable(!ring.pool(Dir::Tx).is_empty());
                    }
                    core.getwait.wake_all();
                    core.recvwait.wake_all();
                }
                let _ = core
                    .smsg
                    .send(Smsg::new(channel, SmsgKind::Open, FLAG_ACK, 0));
                core.set_state(ChannelState::Ready);
                core.emit(SblockEvent::Opened);
            }
            (SmsgKind::Close, FLAG_REQ) => {
                let _ = core
                    .smsg
                    .send(Smsg::new(channel, SmsgKind::Close, FLAG_ACK, 0));
                core.set_state(ChannelState::Idle);
                core.emit(SblockEvent::Closed);
            }
            // Ack to our own CLOSE; nothing left to do.
            (SmsgKind::Close, _) => {}
            (SmsgKind::Event, EVENT_SEND) => data_ready(core),
            (SmsgKind::Event, EVENT_RELEASE) => buffer_freed(core),
            _ => protocol_violation(channel, &msg),
        }
    }
}

fn client_loop(core: &Arc<ChannelCore>) {
    let channel = core.channel_id;
    let _ = core
        .smsg
        .send(Smsg::new(channel, SmsgKind::Cmd, CMD_INIT, 0));
    loop {
        let msg = match core.smsg.recv(channel) {
            Ok(msg) => msg,
            Err(_) => break,
        };
        if core.stopping.load(Ordering::Acquire) {
            break;
        }
        match (msg.kind, msg.flag) {
            (SmsgKind::Done, CMD_INIT) => {
                if core.ring_view().is_ok() {
                    protocol_violation(channel, &msg);
                    continue;
                }
                match map_region(core, msg.value) {
                    Ok(view) => {
                        core.install_ring(view);
                        let _ = core
                            .smsg
                            .send(Smsg::new(channel, SmsgKind::Open, FLAG_REQ, 0));
                    }
                    Err(e) => {
                        tracing::error!(channel, error = %e, "failed to map host region");
                    }
                }
            }
            (SmsgKind::Open, FLAG_ACK) => {
                core.set_state(ChannelState::Ready);
                core.emit(SblockEvent::Opened);
            }
            (SmsgKind::Close, FLAG_REQ) => {
                let _ = core
                    .smsg
                    .send(Smsg::new(channel, SmsgKind::Close, FLAG_ACK, 0));
                core.set_state(ChannelState::Idle);
                core.emit(SblockEvent::Closed);
            }
            (SmsgKind::Close, _) => {}
            (SmsgKind::Event, EVENT_SEND) => data_ready(core),
            (SmsgKind::Event, EVENT_RELEASE) => buffer_freed(core),
            _ => protocol_violation(channel, &msg),
        }
    }
}

fn map_region(core: &ChannelCore, addr: u32) -> Result<Arc<RingView>> {
    let name = core.fabric.smem_name(core.channel_id);
    let region = SmemRegion::attach(&name, std::mem::size_of::<SblockHeader>(), addr)
        .map_err(|e| SblockError::Map(e.to_string()))?;
    let view = RingView::new(
        Arc::new(region),
        Role::Client,
        core.fabric.lock_set(core.channel_id),
    )
    .map_err(|e| SblockError::Map(e.to_string()))?;
    Ok(Arc::new(view))
}

fn data_ready(core: &Arc<ChannelCore>) {
    core.set_readable(true);
    core.recvwait.wake_all();
    core.emit(SblockEvent::DataReady);
}

fn buffer_freed(core: &Arc<ChannelCore>) {
    core.set_writable(true);
    core.getwait.wake_all();
    core.emit(SblockEvent::BufferFreed);
}

fn protocol_violation(channel: u8, msg: &Smsg) {
    tracing::warn!(
        channel,
        kind = ?msg.kind,
        flag = msg.flag,
        "unexpected control message, dropping"
    );
}
