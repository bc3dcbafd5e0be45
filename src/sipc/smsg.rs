// Inter-core control-message bus.
//
// This is the low-level signalling path between the two cores: small
// fixed-shape messages, one logical queue per (endpoint, channel). The
// block transport never moves payload through here, only lifecycle and
// doorbell events.
//
// The bus has exactly two sides. An endpoint that is dropped without a
// CLOSE handshake simply disappears, which is how a peer-core crash looks
// to the survivor: its queues close, outbound messages to it are dropped,
// and a replacement endpoint can attach later.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SblockError};

/// Message type, mirroring the control-channel vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsgKind {
    /// Channel lifecycle: peer is up (flag distinguishes request/ack).
    Open,
    /// Channel lifecycle: peer is going away.
    Close,
    /// Command during the handshake (flag selects the command).
    Cmd,
    /// Command completion (flag selects, value carries the datum).
    Done,
    /// Doorbell event (flag selects send/release).
    Event,
}

/// One control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Smsg {
    pub channel: u8,
    pub kind: SmsgKind,
    pub flag: u16,
    pub value: u32,
}

impl Smsg {
    pub fn new(channel: u8, kind: SmsgKind, flag: u16, value: u32) -> Self {
        Self {
            channel,
            kind,
            flag,
            value,
        }
    }
}

/// Which side of the bus an endpoint occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Application core (host side of every channel).
    Local,
    /// Companion core (client side of every channel).
    Remote,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Local => 0,
            Side::Remote => 1,
        }
    }
}

struct ChannelQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

struct QueueState {
    msgs: VecDeque<Smsg>,
    closed: bool,
}

impl ChannelQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                msgs: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        })
    }

    fn push(&self, msg: Smsg) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.msgs.push_back(msg);
        self.cv.notify_one();
        true
    }

    fn pop_blocking(&self) -> Option<Smsg> {
        let mut state = self.state.lock();
        loop {
            if let Some(msg) = state.msgs.pop_front() {
                return Some(msg);
            }
            if state.closed {
                return None;
            }
            self.cv.wait(&mut state);
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cv.notify_all();
    }
}

struct EndpointCore {
    channels: Mutex<HashMap<u8, Arc<ChannelQueue>>>,
    dead: AtomicBool,
}

impl EndpointCore {
    fn close_all(&self) {
        self.dead.store(true, Ordering::Release);
        let channels = self.channels.lock();
        for queue in channels.values() {
            queue.close();
        }
    }
}

/// The two-sided bus. Channel-open rendezvous is tracked here so that
/// `ch_open` can park until the peer side opens the same channel.
pub struct SmsgBus {
    sides: Mutex<[Option<Arc<EndpointCore>>; 2]>,
    rendezvous: Condvar,
}

impl SmsgBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sides: Mutex::new([None, None]),
            rendezvous: Condvar::new(),
        })
    }

    /// Attach an endpoint on `side`, replacing (and killing) any previous
    /// occupant — that is what a restarted core looks like.
    pub fn attach(self: &Arc<Self>, side: Side) -> SmsgEndpoint {
        let core = Arc::new(EndpointCore {
            channels: Mutex::new(HashMap::new()),
            dead: AtomicBool::new(false),
        });
        {
            let mut sides = self.sides.lock();
            if let Some(old) = sides[side.index()].replace(core.clone()) {
                old.close_all();
            }
            self.rendezvous.notify_all();
        }
        SmsgEndpoint {
            bus: self.clone(),
            side,
            core,
        }
    }

    fn peer_of(&self, side: Side) -> Option<Arc<EndpointCore>> {
        let sides = self.sides.lock();
        sides[1 - side.index()].clone()
    }
}

/// One core's handle on the bus.
pub struct SmsgEndpoint {
    bus: Arc<SmsgBus>,
    side: Side,
    core: Arc<EndpointCore>,
}

impl SmsgEndpoint {
    pub fn side(&self) -> Side {
        self.side
    }

    /// Open `channel` locally, then park until the peer has it open too.
    /// Fails if this endpoint dies, or the channel is closed locally,
    /// while waiting.
    pub fn ch_open(&self, channel: u8) -> Result<()> {
        self.core
            .channels
            .lock()
            .entry(channel)
            .or_insert_with(ChannelQueue::new);

        let mut sides = self.bus.sides.lock();
        self.bus.rendezvous.notify_all();
        loop {
            if self.core.dead.load(Ordering::Acquire)
                || !self.core.channels.lock().contains_key(&channel)
            {
                return Err(SblockError::Reset);
            }
            let peer_open = sides[1 - self.side.index()]
                .as_ref()
                .map(|peer| peer.channels.lock().contains_key(&channel))
                .unwrap_or(false);
            if peer_open {
                return Ok(());
            }
            self.bus.rendezvous.wait(&mut sides);
        }
    }

    /// Drop the local queue for `channel`, waking its reader and any
    /// rendezvous waiter.
    pub fn ch_close(&self, channel: u8) {
        if let Some(queue) = self.core.channels.lock().remove(&channel) {
            queue.close();
        }
        let _sides = self.bus.sides.lock();
        self.bus.rendezvous.notify_all();
    }

    /// Deliver a message to the peer core. Delivery to a dead peer or an
    /// unopened peer channel is dropped: the control path is best-effort
    /// during outages, exactly when the peer cannot read anyway.
    pub fn send(&self, msg: Smsg) -> Result<()> {
        let Some(peer) = self.bus.peer_of(self.side) else {
            tracing::debug!(channel = msg.channel, kind = ?msg.kind, "smsg send with no peer");
            return Err(SblockError::NotReady);
        };
        if peer.dead.load(Ordering::Acquire) {
            tracing::debug!(channel = msg.channel, kind = ?msg.kind, "smsg send to dead peer");
            return Err(SblockError::NotReady);
        }
        let queue = peer.channels.lock().get(&msg.channel).cloned();
        match queue {
            Some(queue) if queue.push(msg) => Ok(()),
            _ => {
                tracing::debug!(
                    channel = msg.channel,
                    kind = ?msg.kind,
                    "smsg send to unopened peer channel"
                );
                Err(SblockError::NotReady)
            }
        }
    }

    /// Block until a message arrives on `channel`. Returns `Reset` when
    /// the queue is closed (channel closed locally or endpoint died).
    pub fn recv(&self, channel: u8) -> Result<Smsg> {
        let queue = self
            .core
            .channels
            .lock()
            .get(&channel)
            .cloned()
            .ok_or(SblockError::NotReady)?;
        queue.pop_blocking().ok_or(SblockError::Reset)
    }
}

impl Drop for SmsgEndpoint {
    fn drop(&mut self) {
        // Abrupt death: no CLOSE is sent on this path.
        self.core.close_all();
        let mut sides = self.bus.sides.lock();
        let slot = &mut sides[self.side.index()];
        if slot
            .as_ref()
            .map(|cur| Arc::ptr_eq(cur, &self.core))
            .unwrap_or(false)
        {
            *slot = None;
        }
        self.bus.rendezvous.notify_all();
    }
}
