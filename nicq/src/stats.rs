//! Per-queue counters, readable at any time without touching the queue.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one TX queue. Shared through an `Arc`; reading a snapshot
/// never blocks the hot path.
#[derive(Debug, Default)]
pub struct TxStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    /// Submissions rejected with a full ring; back-pressure signal.
    ring_full: AtomicU64,
    /// Packets dropped by the offload encoder.
    offload_errors: AtomicU64,
    /// Submissions deferred because no bounce buffer was available.
    copy_buf_misses: AtomicU64,
    /// Packets that went through the bounce-copy path.
    bounced: AtomicU64,
    /// Buffers force-released at stop without hardware acknowledgment.
    force_released: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStatsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub ring_full: u64,
    pub offload_errors: u64,
    pub copy_buf_misses: u64,
    pub bounced: u64,
    pub force_released: u64,
}

impl TxStats {
    pub fn snapshot(&self) -> TxStatsSnapshot {
        TxStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            ring_full: self.ring_full.load(Ordering::Relaxed),
            offload_errors: self.offload_errors.load(Ordering::Relaxed),
            copy_buf_misses: self.copy_buf_misses.load(Ordering::Relaxed),
            bounced: self.bounced.load(Ordering::Relaxed),
            force_released: self.force_released.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn on_packet(&self, bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn on_ring_full(&self) {
        self.ring_full.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_offload_error(&self) {
        self.offload_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_copy_buf_miss(&self) {
        self.copy_buf_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_bounce(&self) {
        self.bounced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_force_release(&self, n: u64) {
        self.force_released.fetch_add(n, Ordering::Relaxed);
    }
}

/// Counters of one RX queue.
#[derive(Debug, Default)]
pub struct RxStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    /// Polls that found no completed packet.
    empty_polls: AtomicU64,
    /// Replenish slots skipped because the pool was exhausted.
    alloc_failures: AtomicU64,
    /// Completions carrying a checksum error indication.
    csum_errors: AtomicU64,
    /// Buffers force-released at stop without hardware acknowledgment.
    force_released: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStatsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub empty_polls: u64,
    pub alloc_failures: u64,
    pub csum_errors: u64,
    pub force_released: u64,
}

impl RxStats {
    pub fn snapshot(&self) -> RxStatsSnapshot {
        RxStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            csum_errors: self.csum_errors.load(Ordering::Relaxed),
            force_released: self.force_released.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn on_packet(&self, bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn on_empty_poll(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_alloc_failure(&self, n: u64) {
        self.alloc_failures.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn on_csum_error(&self) {
        self.csum_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_force_release(&self, n: u64) {
        self.force_released.fetch_add(n, Ordering::Relaxed);
    }
}
