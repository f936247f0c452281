use std::error::Error;
use std::fmt;
use std::io;

use crate::hw::QueueId;

/// A queue configuration rejected at start time.
///
/// Structural by design: the queue stays `Stopped` and the operator has to
/// fix the configuration, nothing is silently coerced beyond the documented
/// bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigError {
    /// Name of the offending configuration field.
    pub name: &'static str,
    pub kind: ConfigErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    Zero,
    /// Requested depth still exceeds the maximum after power-of-two round-up.
    DepthAboveMax { rounded: u32, max: u16 },
    /// Free threshold must stay strictly below `capacity - 1`.
    ThresholdTooHigh { thresh: u16, capacity: u16 },
    /// RX buffer length larger than what the pool hands out.
    BufferTooLong { requested: u32, frame: u32 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConfigErrorKind::Zero => write!(f, "{} must not be zero", self.name),
            ConfigErrorKind::DepthAboveMax { rounded, max } => write!(
                f,
                "{}: {} exceeds the maximum queue depth {}",
                self.name, rounded, max
            ),
            ConfigErrorKind::ThresholdTooHigh { thresh, capacity } => write!(
                f,
                "{}: {} must be below capacity - 1 ({})",
                self.name,
                thresh,
                capacity - 1
            ),
            ConfigErrorKind::BufferTooLong { requested, frame } => write!(
                f,
                "{}: {} exceeds the pool frame length {}",
                self.name, requested, frame
            ),
        }
    }
}

impl Error for ConfigError {}

/// Why the offload encoder refused a packet.
///
/// All of these drop exactly one packet and are counted on the queue; they
/// never unwind the queue itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadError {
    /// Packet has no segments or no payload bytes.
    EmptyPacket,
    /// Non-TSO packets are bounded by the 16-bit length field.
    PacketTooLong { len: u32 },
    /// Segment count cannot be brought within the hardware limit.
    TooManySegments { segs: usize, max: usize },
    /// The tail bounce copy would exceed the copy buffer.
    CopyTooLong { len: u32, max: u32 },
    /// TSO requested with a zero MSS.
    ZeroMss,
}

impl fmt::Display for OffloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            OffloadError::EmptyPacket => write!(f, "packet has no data"),
            OffloadError::PacketTooLong { len } => {
                write!(f, "non-TSO packet of {} bytes exceeds 65535", len)
            }
            OffloadError::TooManySegments { segs, max } => {
                write!(f, "{} segments exceed the hardware limit of {}", segs, max)
            }
            OffloadError::CopyTooLong { len, max } => {
                write!(f, "tail copy of {} bytes exceeds the {} byte bound", len, max)
            }
            OffloadError::ZeroMss => write!(f, "TSO requires a non-zero MSS"),
        }
    }
}

impl Error for OffloadError {}

/// What went wrong while submitting one packet to a TX queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxErrorKind {
    /// Not enough free slots even after reclaiming completions. Transient
    /// back-pressure, the packet is handed back for a later retry.
    RingFull { need: u16, free: u16 },
    /// The offload encoder rejected the packet; it has been dropped.
    Offload(OffloadError),
    /// No bounce buffer available right now. Transient, the packet is
    /// handed back for a later retry.
    NoCopyBuffer,
    /// The queue is not in the `Running` state.
    NotRunning,
}

impl fmt::Display for TxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TxErrorKind::RingFull { need, free } => {
                write!(f, "ring full: {} slots needed, {} free", need, free)
            }
            TxErrorKind::Offload(e) => write!(f, "offload: {}", e),
            TxErrorKind::NoCopyBuffer => write!(f, "copy buffer pool exhausted"),
            TxErrorKind::NotRunning => write!(f, "queue is not running"),
        }
    }
}

/// Stop could not confirm hardware quiescence within the bound.
///
/// Reported with the full index state so the stuck queue can be diagnosed,
/// but teardown proceeds anyway; the remaining buffers are reclaimed without
/// the hardware's acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainTimeout {
    pub queue: QueueId,
    pub prod_idx: u16,
    pub cons_idx: u16,
    /// Descriptor slots still outstanding when the timeout hit.
    pub outstanding: u16,
}

impl fmt::Display for DrainTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queue {} drain timed out: pi={} ci={} outstanding={}",
            self.queue, self.prod_idx, self.cons_idx, self.outstanding
        )
    }
}

impl Error for DrainTimeout {}

/// Failure reported by the hardware control plane.
#[derive(Debug)]
pub enum HwError {
    /// The device rejected the request.
    Rejected(&'static str),
    Io(io::Error),
}

impl fmt::Display for HwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwError::Rejected(why) => write!(f, "device rejected request: {}", why),
            HwError::Io(e) => write!(f, "device i/o error: {}", e),
        }
    }
}

impl Error for HwError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HwError::Io(e) => Some(e),
            HwError::Rejected(_) => None,
        }
    }
}

/// Why a queue failed to start. The queue remains `Stopped`.
#[derive(Debug)]
pub enum StartError {
    Config(ConfigError),
    /// Context programming failed; fatal to this queue's startup.
    Hw(HwError),
    Io(io::Error),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::Config(e) => write!(f, "configuration: {}", e),
            StartError::Hw(e) => write!(f, "hardware programming: {}", e),
            StartError::Io(e) => write!(f, "memory allocation: {}", e),
        }
    }
}

impl Error for StartError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StartError::Config(e) => Some(e),
            StartError::Hw(e) => Some(e),
            StartError::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for StartError {
    fn from(e: ConfigError) -> Self {
        StartError::Config(e)
    }
}

impl From<HwError> for StartError {
    fn from(e: HwError) -> Self {
        StartError::Hw(e)
    }
}

impl From<io::Error> for StartError {
    fn from(e: io::Error) -> Self {
        StartError::Io(e)
    }
}
