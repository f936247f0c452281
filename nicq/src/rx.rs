//! # RX Queue
//!
//! ## Purpose
//!
//! The receive side of the ring engine: posting empty buffers to the
//! device, harvesting completed packets in order, copying the completion
//! metadata through to the caller, and keeping the ring replenished.
//!
//! ## How it works
//!
//! Every descriptor slot is paired 1:1 with a completion entry in a
//! separate array; the device writes packet data into the posted buffer
//! and then publishes length and metadata through the completion entry's
//! status word. The consumer loop acquire-loads that word: the done bit is
//! the only gate, and every other field of the entry may be read only
//! after it. A packet longer than one buffer spans consecutive slots; the
//! head entry's done bit covers the whole chain, and the walk is bounded
//! by the declared length. Every consumed entry is cleared before its slot
//! can be reserved again, so a stale status can never be mistaken for a
//! fresh completion on the next lap.
//!
//! Replenish runs once per poll after harvesting: it fills the contiguous
//! run of free slots with fresh pool frames and issues at most one
//! doorbell, amortizing the MMIO cost. Pool exhaustion is counted, never
//! fatal; the slots stay empty until a later poll succeeds.
//!
//! ## Main components
//!
//! - `RxQueue`: start / poll / stop.
//! - `RxPacket`, `RxMeta`: what the caller receives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::dma::DmaRegion;
use crate::error::{DrainTimeout, StartError};
use crate::hw::{Doorbell, QueueContext, QueueCtl, QueueId, QueueKind};
use crate::pool::{Frame, PacketPool};
use crate::queue::{QueueConfig, QueueState, drain_bounded};
use crate::ring::Wq;
use crate::stats::{RxStats, RxStatsSnapshot};
use crate::wqe::{
    self, CQE_CSUM_HW_CHECK_NONE, CQE_CSUM_IP_ERR, CQE_CSUM_SCTP_CRC_ERR, CQE_CSUM_TCP_ERR,
    CQE_CSUM_UDP_ERR, CQE_SHIFT, CQE_SIZE, RqCqe, RqWqe, RqWqeKind,
};

/// One segment of a received packet.
#[derive(Debug)]
pub struct RxSeg {
    pub frame: Frame,
    pub len: u32,
}

/// Checksum verdict for one layer, as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsumVerdict {
    /// The device checked nothing, or checking is disabled.
    #[default]
    Unknown,
    Good,
    Bad,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsumStatus {
    pub ip: CsumVerdict,
    pub l4: CsumVerdict,
}

/// Completion metadata copied through to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxMeta {
    pub csum: CsumStatus,
    /// VLAN tag stripped by the device.
    pub vlan_tci: Option<u16>,
    /// RSS hash, present when the device classified the flow.
    pub rss_hash: Option<u32>,
    /// Number of coalesced segments when the device merged the packet,
    /// zero otherwise.
    pub lro_segs: u8,
}

/// A received packet: one frame per slot it occupied, plus metadata.
#[derive(Debug)]
pub struct RxPacket {
    pub segs: Vec<RxSeg>,
    pub meta: RxMeta,
}

impl RxPacket {
    pub fn pkt_len(&self) -> u32 {
        self.segs.iter().map(|s| s.len).sum()
    }
}

/// The receive side of one queue pair.
pub struct RxQueue {
    id: QueueId,
    state: QueueState,
    wq: Wq,
    /// Completion entries, one per slot, device-written.
    cqes: DmaRegion,
    /// Indexed by masked slot; `Some` while the device owns the buffer.
    frames: Vec<Option<Frame>>,
    kind: RqWqeKind,
    buf_len: u32,
    csum_en: bool,
    free_thresh: u16,
    pool: Arc<dyn PacketPool>,
    db: Arc<dyn Doorbell>,
    stats: Arc<RxStats>,
    drain_timeout: std::time::Duration,
}

impl RxQueue {
    /// Allocates ring and completion memory, programs the queue context,
    /// primes `capacity - 1` slots with buffers and transitions to
    /// `Running`.
    pub fn start(
        id: QueueId,
        cfg: &QueueConfig,
        pool: Arc<dyn PacketPool>,
        db: Arc<dyn Doorbell>,
        ctl: &dyn QueueCtl,
    ) -> Result<RxQueue, StartError> {
        let cfg = cfg.check(pool.frame_len())?;
        let wq = Wq::new(cfg.depth, cfg.rq_wqe.wqebb_shift(), cfg.huge_pages)?;
        let cqes = DmaRegion::alloc(cfg.depth as usize * CQE_SIZE, cfg.huge_pages)?;

        let ctx = QueueContext {
            queue: id,
            kind: QueueKind::Rq,
            wq_base: wq.base_iova(),
            depth: cfg.depth,
            wqebb_shift: cfg.rq_wqe.wqebb_shift(),
            wqe_type: cfg.rq_wqe.wqe_type(),
            buf_len: cfg.buf_len,
            cqe_base: cqes.iova(),
            ci_addr: 0,
            pending_limit: 0,
            coalescing_time: 0,
        };
        ctl.program_queue_context(&ctx)?;

        let mut rxq = RxQueue {
            id,
            state: QueueState::Starting,
            frames: (0..cfg.depth).map(|_| None).collect(),
            wq,
            cqes,
            kind: cfg.rq_wqe,
            buf_len: cfg.buf_len,
            csum_en: cfg.csum_offload,
            free_thresh: cfg.free_thresh,
            pool,
            db,
            stats: Arc::new(RxStats::default()),
            drain_timeout: cfg.drain_timeout,
        };

        rxq.replenish();
        if rxq.wq.distance_used() != cfg.depth - 1 {
            // The initial fill must be complete; hand the frames back and
            // refuse the start.
            rxq.force_release_all();
            return Err(StartError::Io(std::io::Error::other(
                "pool too small to prime the rx ring",
            )));
        }
        log::debug!("rq {}: started, depth {}", id, cfg.depth);
        rxq.state = QueueState::Running;
        Ok(rxq)
    }

    #[inline]
    pub fn id(&self) -> QueueId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Slots posted to the device and not yet consumed.
    #[inline]
    pub fn distance_used(&self) -> u16 {
        self.wq.distance_used()
    }

    pub fn stats(&self) -> RxStatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared handle to the live counters.
    pub fn stats_handle(&self) -> Arc<RxStats> {
        Arc::clone(&self.stats)
    }

    /// The status word of the completion entry at masked slot `masked`.
    #[inline]
    fn cqe_status_at(&self, masked: u16) -> &AtomicU32 {
        // SAFETY: the entry array lives as long as the queue and status is
        // its first word; the device writes it, we read/clear it.
        unsafe {
            AtomicU32::from_ptr(self.cqes.as_ptr().add((masked as usize) << CQE_SHIFT) as *mut u32)
        }
    }

    /// Snapshot of a whole completion entry. Only valid after the status
    /// word was observed done.
    #[inline]
    fn read_cqe(&self, masked: u16) -> RqCqe {
        unsafe {
            (self.cqes.as_ptr().add((masked as usize) << CQE_SHIFT) as *const RqCqe).read_volatile()
        }
    }

    /// Harvests up to `budget` completed packets, then replenishes free
    /// slots with at most one doorbell.
    ///
    /// Returns the packets in completion order, possibly none. With no new
    /// completions this call leaves all indices untouched.
    pub fn poll(&mut self, budget: usize) -> Vec<RxPacket> {
        let mut out = Vec::new();
        if self.state != QueueState::Running || budget == 0 {
            return out;
        }
        let mask = self.wq.mask();

        while out.len() < budget {
            let ci = self.wq.cons_idx() & mask;
            let status = self.cqe_status_at(ci).load(Ordering::Acquire);
            if !wqe::cqe_done(status) {
                if out.is_empty() {
                    self.stats.on_empty_poll();
                }
                break;
            }
            let cqe = self.read_cqe(ci);
            let pkt_len = wqe::cqe_pkt_len(cqe.vlan_len);
            let Some(frame) = self.frames[ci as usize].take() else {
                debug_assert!(false, "completion on an empty slot");
                break;
            };

            let head_len = pkt_len.min(self.buf_len);
            let mut segs = vec![RxSeg {
                frame,
                len: head_len,
            }];
            self.cqe_status_at(ci).store(0, Ordering::Release);
            self.wq.release(1);

            // A longer packet continues in the following slots. Their own
            // done bits are not consulted: the device guarantees the chain
            // is written before the head's done bit is set, and the walk
            // is bounded by the declared length. Each entry is still
            // cleared so ring reuse never sees a stale word.
            let mut remain = pkt_len - head_len;
            while remain > 0 {
                let ci = self.wq.cons_idx() & mask;
                let Some(frame) = self.frames[ci as usize].take() else {
                    debug_assert!(false, "jumbo chain ran past posted slots");
                    break;
                };
                let len = remain.min(self.buf_len);
                self.cqe_status_at(ci).store(0, Ordering::Release);
                self.wq.release(1);
                segs.push(RxSeg { frame, len });
                remain -= len;
            }

            let meta = extract_meta(self.csum_en, status, &cqe, &self.stats);
            self.stats.on_packet(pkt_len as u64);
            out.push(RxPacket { segs, meta });
        }

        self.replenish();
        out
    }

    /// Posts fresh buffers into the free slots when the free count has
    /// reached the configured threshold. One doorbell at most.
    fn replenish(&mut self) {
        let free = self.wq.distance_free();
        if free < self.free_thresh {
            return;
        }
        let pi = self.wq.prod_idx() & self.wq.mask();
        // Bounded by the contiguous run to the array end; the wrapped
        // remainder is picked up by the next poll.
        let run = free.min(self.wq.depth() - pi);
        let mut got = 0u16;
        for i in 0..run {
            let Some(frame) = self.pool.alloc() else {
                // Not fatal: the slots stay empty and the refill is
                // retried on the next poll.
                self.stats.on_alloc_failure((run - got) as u64);
                break;
            };
            let slot = pi + i;
            let cqe_addr = self.cqes.iova() + ((slot as u64) << CQE_SHIFT);
            let rq_wqe = match self.kind {
                RqWqeKind::Normal => RqWqe::Normal {
                    cqe_addr,
                    buf_addr: frame.iova(),
                },
                RqWqeKind::Extend => RqWqe::Extend {
                    cqe_addr,
                    buf_addr: frame.iova(),
                    buf_len: self.buf_len,
                },
            };
            rq_wqe.encode_into(&self.wq, slot);
            self.frames[slot as usize] = Some(frame);
            got += 1;
        }
        if got > 0 {
            let reserved = self.wq.reserve(got);
            debug_assert!(reserved.is_some());
            // Descriptors before the doorbell, same contract as TX.
            fence(Ordering::Release);
            let new_pi = (pi + got) & self.wq.mask();
            self.db
                .ring(self.id, QueueKind::Rq, new_pi << self.kind.wqe_type());
        }
    }

    /// Stops the queue: asks the device to flush, drains completions
    /// within the configured bound, then releases the remaining buffers
    /// regardless.
    pub fn stop(&mut self, ctl: &dyn QueueCtl) -> Result<(), DrainTimeout> {
        if self.state != QueueState::Running {
            self.state = QueueState::Stopped;
            return Ok(());
        }
        self.state = QueueState::Stopping;

        if let Err(e) = ctl.flush_queue(self.id, QueueKind::Rq) {
            log::warn!("rq {}: flush request failed: {}", self.id, e);
        }

        let timeout = self.drain_timeout;
        let res = drain_bounded(timeout, || {
            self.release_completed();
            self.wq.distance_used()
        });
        let res = match res {
            Ok(()) => Ok(()),
            Err(left) => {
                let err = DrainTimeout {
                    queue: self.id,
                    prod_idx: self.wq.prod_idx(),
                    cons_idx: self.wq.cons_idx(),
                    outstanding: left,
                };
                log::error!("rq {}: {}", self.id, err);
                Err(err)
            }
        };

        let forced = self.force_release_all();
        if forced > 0 {
            self.stats.on_force_release(forced);
        }
        self.state = QueueState::Stopped;
        res
    }

    /// Drain-time walk: frees buffers for entries the device marked done
    /// or flushed, following jumbo chains by leftover length, and stops at
    /// the first untouched entry.
    fn release_completed(&mut self) {
        let mask = self.wq.mask();
        let mut pkt_left = 0u32;
        while self.wq.distance_used() != 0 {
            let ci = self.wq.cons_idx() & mask;
            let status = self.cqe_status_at(ci).load(Ordering::Acquire);
            if pkt_left > 0 {
                // Continuation slot of a jumbo packet being flushed.
                pkt_left -= pkt_left.min(self.buf_len);
            } else if wqe::cqe_flush(status) {
                // A flushed entry releases exactly one slot.
            } else if wqe::cqe_done(status) {
                let len = wqe::cqe_pkt_len(self.read_cqe(ci).vlan_len);
                pkt_left = len.saturating_sub(self.buf_len);
            } else {
                break;
            }
            if let Some(frame) = self.frames[ci as usize].take() {
                self.pool.free(frame);
            }
            self.cqe_status_at(ci).store(0, Ordering::Release);
            self.wq.release(1);
        }
    }

    /// Unconditional cleanup used at teardown and on a failed start.
    /// Returns the number of buffers released.
    fn force_release_all(&mut self) -> u64 {
        let mask = self.wq.mask();
        let mut n = 0u64;
        while self.wq.distance_used() != 0 {
            let ci = self.wq.cons_idx() & mask;
            if let Some(frame) = self.frames[ci as usize].take() {
                self.pool.free(frame);
                n += 1;
            }
            self.cqe_status_at(ci).store(0, Ordering::Release);
            self.wq.release(1);
        }
        n
    }
}

/// Pure data transformation from a completion entry to caller metadata.
fn extract_meta(csum_en: bool, status: u32, cqe: &RqCqe, stats: &RxStats) -> RxMeta {
    let csum = if !csum_en {
        CsumStatus::default()
    } else {
        let err = wqe::cqe_csum_err(status);
        if err == 0 {
            CsumStatus {
                ip: CsumVerdict::Good,
                l4: CsumVerdict::Good,
            }
        } else if err & CQE_CSUM_HW_CHECK_NONE != 0 {
            // The device checked nothing; every other bit is meaningless.
            CsumStatus::default()
        } else {
            let ip = if err & CQE_CSUM_IP_ERR != 0 {
                stats.on_csum_error();
                CsumVerdict::Bad
            } else {
                CsumVerdict::Good
            };
            let l4 = if err & (CQE_CSUM_TCP_ERR | CQE_CSUM_UDP_ERR | CQE_CSUM_SCTP_CRC_ERR) != 0 {
                stats.on_csum_error();
                CsumVerdict::Bad
            } else {
                CsumVerdict::Good
            };
            CsumStatus { ip, l4 }
        }
    };

    let vlan_tag = wqe::cqe_vlan_tag(cqe.vlan_len);
    let vlan_tci = if wqe::cqe_vlan_stripped(cqe.offload_type) && vlan_tag != 0 {
        Some(vlan_tag)
    } else {
        None
    };
    let rss_hash = if wqe::cqe_rss_type(cqe.offload_type) != 0 {
        Some(cqe.hash_val)
    } else {
        None
    };

    RxMeta {
        csum,
        vlan_tci,
        rss_hash,
        lro_segs: wqe::cqe_lro_segs(status),
    }
}
