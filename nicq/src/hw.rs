//! # Hardware Seams
//!
//! ## Purpose
//!
//! This file defines the two interfaces the ring engine uses to talk to the
//! device: the doorbell (the MMIO write that exposes newly produced
//! descriptors) and the control plane (queue context programming and queue
//! flush). The engine never touches device registers directly, so the same
//! queue code runs against real MMIO or against the software device model
//! used by the test suite.
//!
//! ## How it works
//!
//! At start time the queue hands the device a [`QueueContext`] carrying the
//! DMA addresses of everything the device needs to reach on its own: the
//! descriptor ring, the completion entries and, for TX, the consumer-index
//! cell the device writes back through DMA. After that the only hot-path
//! interaction is [`Doorbell::ring`], a single posted write. The engine is
//! responsible for issuing the release fence before ringing; the doorbell
//! implementation only performs the write.
//!
//! ## Main components
//!
//! - `QueueContext`: everything programmed into the device at queue start.
//! - `Doorbell`: the producer-index notification.
//! - `QueueCtl`: context programming and flush, used at start/stop only.

use std::fmt;

use crate::error::HwError;

/// Default pending-descriptor limit before the device writes the TX
/// consumer index back to host memory.
pub const DEFAULT_TX_CI_PENDING_LIMIT: u16 = 3;
/// Default coalescing time hint for TX consumer-index write-back.
pub const DEFAULT_TX_CI_COALESCING_TIME: u16 = 16;

/// Identifies one queue of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u16);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Send queue or receive queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Sq,
    Rq,
}

/// Everything the device needs to know about one queue, programmed once at
/// start.
///
/// Addresses are bus addresses; in this userspace engine they are
/// identity-mapped process addresses (see [`crate::dma::DmaRegion::iova`]).
#[derive(Debug, Clone, Copy)]
pub struct QueueContext {
    pub queue: QueueId,
    pub kind: QueueKind,
    /// Base address of the descriptor slot array.
    pub wq_base: u64,
    /// Number of descriptor slots, always a power of two.
    pub depth: u16,
    /// log2 of the slot size in bytes.
    pub wqebb_shift: u8,
    /// Doorbell index shift: an RQ doorbell counts in base-size units, so
    /// extended-WQE queues shift their producer index left by this amount.
    pub wqe_type: u8,
    /// RX buffer capacity in bytes; zero for SQ contexts.
    pub buf_len: u32,
    /// Base address of the completion entry array; zero for SQ contexts.
    pub cqe_base: u64,
    /// Address of the consumer-index cell the device DMA-writes; zero for
    /// RQ contexts.
    pub ci_addr: u64,
    /// Write-back pacing hints, opaque to the engine.
    pub pending_limit: u16,
    pub coalescing_time: u16,
}

/// The producer-index notification, one posted MMIO write.
///
/// The caller has already made the descriptor memory globally visible with a
/// release fence before calling [`ring`](Doorbell::ring); implementations
/// must not require any further ordering.
pub trait Doorbell: Send + Sync {
    /// Tell the device that descriptors up to (masked) index `pi` are ready.
    fn ring(&self, queue: QueueId, kind: QueueKind, pi: u16);
}

/// Queue control plane, consumed at start and stop only.
pub trait QueueCtl: Send + Sync {
    /// Program one queue's context into the device. Called exactly once per
    /// start; failure is fatal to that queue's startup.
    fn program_queue_context(&self, ctx: &QueueContext) -> Result<(), HwError>;

    /// Ask the device to quiesce the queue and complete whatever is still in
    /// flight. The caller follows up with the bounded drain loop.
    fn flush_queue(&self, queue: QueueId, kind: QueueKind) -> Result<(), HwError>;
}
