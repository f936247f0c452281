// Public modules and re-exports
pub mod dma;
pub mod error;
pub mod hw;
pub mod offload;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod ring;
pub mod rx;
pub mod stats;
pub mod tx;
pub mod wqe;

pub use error::{
    ConfigError, ConfigErrorKind, DrainTimeout, HwError, OffloadError, StartError, TxErrorKind,
};
pub use hw::{Doorbell, QueueContext, QueueCtl, QueueId, QueueKind};
pub use offload::{L4Offload, TxOffload};
pub use pool::{Frame, FramePool, PacketPool};
pub use queue::{QueueConfig, QueueState};
pub use registry::DeviceRegistry;
pub use rx::{CsumStatus, CsumVerdict, RxMeta, RxPacket, RxQueue, RxSeg};
pub use stats::{RxStatsSnapshot, TxStatsSnapshot};
pub use tx::{SubmitError, TxPacket, TxQueue, TxSeg};
pub use wqe::RqWqeKind;
