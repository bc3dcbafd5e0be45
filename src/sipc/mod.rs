pub mod fabric;
pub mod resource;
pub mod smem;
pub mod smsg;
pub mod waitq;

pub use fabric::{ChannelLockSet, SipcFabric, SipcPort};
pub use resource::ResourceLock;
pub use smem::SmemRegion;
pub use smsg::{Side, Smsg, SmsgBus, SmsgEndpoint, SmsgKind};
pub use waitq::{Wait, WaitOutcome, WaitQueue};
