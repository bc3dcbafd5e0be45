//! Shared-memory ring-buffer IPC between an application core and a
//! companion core.
//!
//! Each channel is one shared-memory region holding, per direction, a
//! block pool (free buffers) and a ring (published buffers). A producer
//! takes a free block with [`SblockChannel::get`], fills it, and publishes
//! it with [`SblockChannel::send`]; the consumer pulls it with
//! [`SblockChannel::receive`] and recycles it with
//! [`SblockChannel::release`]. Cross-core doorbells are edge-triggered:
//! the expensive inter-core signal only fires when a ring leaves empty
//! (or fills up), or when a pool stops being empty.
//!
//! The [`sipc`] module carries the collaborator services: the shared
//! memory regions, the control-message bus the handshake runs over, and
//! the cross-core resource lock.

pub mod error;
pub mod sblock;
pub mod sipc;

pub use error::{Result, SblockError};
pub use sblock::{
    BlockState, ChannelGeometry, ChannelState, ChannelStats, Dir, DirStats, EventCallback,
    PollFlags, Role, SblockBuffer, SblockChannel, SblockEvent, SblockManager,
};
pub use sipc::{Side, SipcFabric, SipcPort};
