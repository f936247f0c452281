//! # TX Queue
//!
//! ## Purpose
//!
//! This file implements the send side of the ring engine: accepting one
//! logical packet, mapping it onto descriptor slots through the offload
//! encoder, exposing it to the device with a single doorbell, and
//! reclaiming slots once the device reports progress.
//!
//! ## How it works
//!
//! The device does not write per-descriptor completions for TX. Instead it
//! DMA-writes its masked consumer index into a host memory cell whose
//! address was handed over at context-programming time; reclamation reads
//! that cell with acquire ordering and releases whole packets at a time.
//! A multi-slot packet is tracked by one bookkeeping entry at its head
//! slot carrying the slot count, so the packet's buffers are released
//! atomically once the device has moved past all of them.
//!
//! Submission is strictly ordered: plan first (pure, nothing to roll
//! back), then the bounce copy if the plan needs one, then the slot
//! reservation, the descriptor writes, a release fence, and exactly one
//! doorbell.
//!
//! ## Main components
//!
//! - `TxPacket` / `TxSeg`: the caller's packet, built from pool frames.
//! - `TxQueue`: submit / reclaim / stop.
//! - `SubmitError`: what failed, and the packet back when a retry makes
//!   sense.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering, fence};

use crate::dma::DmaRegion;
use crate::error::{DrainTimeout, StartError, TxErrorKind};
use crate::hw::{
    DEFAULT_TX_CI_COALESCING_TIME, DEFAULT_TX_CI_PENDING_LIMIT, Doorbell, QueueContext, QueueCtl,
    QueueId, QueueKind,
};
use crate::offload::{self, SQ_MAX_COPY_BYTES, TxOffload};
use crate::pool::{CopyBuf, CopyPool, Frame, PacketPool};
use crate::queue::{QueueConfig, QueueState, drain_bounded};
use crate::ring::Wq;
use crate::stats::{TxStats, TxStatsSnapshot};
use crate::wqe::{SQ_WQEBB_SHIFT, SqWqe};

/// One segment of an outbound packet: a pool frame and the number of valid
/// bytes in it.
#[derive(Debug)]
pub struct TxSeg {
    pub frame: Frame,
    pub len: u32,
}

/// One logical outbound packet.
#[derive(Debug)]
pub struct TxPacket {
    pub segs: Vec<TxSeg>,
    pub offload: TxOffload,
}

impl TxPacket {
    /// A single-segment packet with no offloads.
    pub fn single(frame: Frame, len: u32) -> Self {
        TxPacket {
            segs: vec![TxSeg { frame, len }],
            offload: TxOffload::default(),
        }
    }

    pub fn total_len(&self) -> u32 {
        self.segs.iter().map(|s| s.len).sum()
    }
}

/// A failed submit.
///
/// For transient conditions (`RingFull`, `NoCopyBuffer`, `NotRunning`) the
/// packet travels back to the caller in `packet` for a later retry. For
/// encoder rejections the packet has already been dropped and its buffers
/// returned to the pool; `packet` is `None`.
#[derive(Debug)]
pub struct SubmitError {
    pub kind: TxErrorKind,
    pub packet: Option<TxPacket>,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for SubmitError {}

/// Bookkeeping for one in-flight packet, stored at its head slot.
#[derive(Debug)]
struct TxEntry {
    segs: Vec<TxSeg>,
    bounce: Option<CopyBuf>,
    wqebb_cnt: u16,
}

/// The send side of one queue pair.
pub struct TxQueue {
    id: QueueId,
    state: QueueState,
    wq: Wq,
    /// Indexed by masked slot; `Some` only at packet head slots.
    entries: Vec<Option<TxEntry>>,
    /// The cell the device DMA-writes its masked consumer index into.
    ci_mem: DmaRegion,
    copy_pool: CopyPool,
    pool: Arc<dyn PacketPool>,
    db: Arc<dyn Doorbell>,
    stats: Arc<TxStats>,
    free_thresh: u16,
    drain_timeout: std::time::Duration,
}

impl TxQueue {
    /// Allocates the ring, programs the queue context and transitions to
    /// `Running`.
    ///
    /// A configuration or context-programming failure leaves the queue
    /// unbuilt; nothing has to be torn down.
    pub fn start(
        id: QueueId,
        cfg: &QueueConfig,
        pool: Arc<dyn PacketPool>,
        db: Arc<dyn Doorbell>,
        ctl: &dyn QueueCtl,
    ) -> Result<TxQueue, StartError> {
        let cfg = cfg.check(pool.frame_len())?;
        let wq = Wq::new(cfg.depth, SQ_WQEBB_SHIFT, cfg.huge_pages)?;
        let ci_mem = DmaRegion::alloc(std::mem::size_of::<u16>(), cfg.huge_pages)?;
        let copy_pool = CopyPool::new(cfg.copy_bufs, SQ_MAX_COPY_BYTES, cfg.huge_pages)?;

        let ctx = QueueContext {
            queue: id,
            kind: QueueKind::Sq,
            wq_base: wq.base_iova(),
            depth: cfg.depth,
            wqebb_shift: SQ_WQEBB_SHIFT,
            wqe_type: 0,
            buf_len: 0,
            cqe_base: 0,
            ci_addr: ci_mem.iova(),
            pending_limit: DEFAULT_TX_CI_PENDING_LIMIT,
            coalescing_time: DEFAULT_TX_CI_COALESCING_TIME,
        };
        ctl.program_queue_context(&ctx)?;

        log::debug!("sq {}: started, depth {}", id, cfg.depth);
        Ok(TxQueue {
            id,
            state: QueueState::Running,
            entries: (0..cfg.depth).map(|_| None).collect(),
            wq,
            ci_mem,
            copy_pool,
            pool,
            db,
            stats: Arc::new(TxStats::default()),
            free_thresh: cfg.free_thresh,
            drain_timeout: cfg.drain_timeout,
        })
    }

    #[inline]
    pub fn id(&self) -> QueueId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Slots claimed and not yet reclaimed.
    #[inline]
    pub fn distance_used(&self) -> u16 {
        self.wq.distance_used()
    }

    /// Slots available to new submissions.
    #[inline]
    pub fn distance_free(&self) -> u16 {
        self.wq.distance_free()
    }

    pub fn stats(&self) -> TxStatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared handle to the live counters.
    pub fn stats_handle(&self) -> Arc<TxStats> {
        Arc::clone(&self.stats)
    }

    /// The masked consumer index last written back by the device.
    #[inline]
    fn hw_ci(&self) -> u16 {
        // SAFETY: the cell lives in ci_mem for the queue's lifetime; the
        // acquire load orders it before any descriptor reuse.
        unsafe { AtomicU16::from_ptr(self.ci_mem.as_ptr() as *mut u16).load(Ordering::Acquire) }
    }

    /// Submits one packet.
    ///
    /// When the ring is too full even after reclaiming completions the
    /// packet is handed back with [`TxErrorKind::RingFull`]; the caller
    /// treats that as back-pressure. An encoder rejection drops the packet,
    /// counts it, and never leaves a partial reservation behind.
    pub fn submit(&mut self, pkt: TxPacket) -> Result<(), SubmitError> {
        if self.state != QueueState::Running {
            return Err(SubmitError {
                kind: TxErrorKind::NotRunning,
                packet: Some(pkt),
            });
        }

        let lens: Vec<u32> = pkt.segs.iter().map(|s| s.len).collect();
        let plan = match offload::plan(&lens, &pkt.offload) {
            Ok(plan) => plan,
            Err(e) => {
                self.stats.on_offload_error();
                for seg in pkt.segs {
                    self.pool.free(seg.frame);
                }
                return Err(SubmitError {
                    kind: TxErrorKind::Offload(e),
                    packet: None,
                });
            }
        };

        // Reclaim before the ring saturates, not after: batching the
        // release here keeps the stall pattern amortized.
        if self.wq.distance_free() < plan.wqebb_cnt.max(self.free_thresh) {
            self.reclaim();
        }
        let free = self.wq.distance_free();
        if free < plan.wqebb_cnt {
            self.stats.on_ring_full();
            return Err(SubmitError {
                kind: TxErrorKind::RingFull {
                    need: plan.wqebb_cnt,
                    free,
                },
                packet: Some(pkt),
            });
        }

        // The bounce copy happens before the reservation so an exhausted
        // copy pool leaves no claim on the ring.
        let bounce = match plan.bounce {
            None => None,
            Some(bp) => {
                let Some(mut cb) = self.copy_pool.take() else {
                    self.stats.on_copy_buf_miss();
                    return Err(SubmitError {
                        kind: TxErrorKind::NoCopyBuffer,
                        packet: Some(pkt),
                    });
                };
                let mut at = 0usize;
                for seg in &pkt.segs[bp.first_seg..] {
                    let len = seg.len as usize;
                    cb.bytes_mut()[at..at + len].copy_from_slice(&seg.frame.bytes()[..len]);
                    at += len;
                }
                self.stats.on_bounce();
                Some((bp, cb))
            }
        };

        let mut sges: Vec<(u64, u32)> = Vec::with_capacity(plan.sge_cnt as usize);
        match &bounce {
            None => {
                for seg in &pkt.segs {
                    sges.push((seg.frame.iova(), seg.len));
                }
            }
            Some((bp, cb)) => {
                for seg in &pkt.segs[..bp.first_seg] {
                    sges.push((seg.frame.iova(), seg.len));
                }
                sges.push((cb.iova(), bp.copy_len));
            }
        }

        let range = match self.wq.reserve(plan.wqebb_cnt) {
            Some(range) => range,
            None => {
                if let Some((_, cb)) = bounce {
                    self.copy_pool.put(cb);
                }
                self.stats.on_ring_full();
                return Err(SubmitError {
                    kind: TxErrorKind::RingFull {
                        need: plan.wqebb_cnt,
                        free: self.wq.distance_free(),
                    },
                    packet: Some(pkt),
                });
            }
        };

        let wqe = if plan.extended {
            SqWqe::Extend {
                words: plan.words,
                pkt_len: plan.total_len,
                sges: &sges,
            }
        } else {
            SqWqe::Compact {
                addr: sges[0].0,
                len: sges[0].1,
            }
        };
        wqe.encode_into(&self.wq, range.base);

        self.entries[range.head as usize] = Some(TxEntry {
            segs: pkt.segs,
            bounce: bounce.map(|(_, cb)| cb),
            wqebb_cnt: plan.wqebb_cnt,
        });

        // Descriptor memory must be globally visible before the device
        // learns about the new producer index.
        fence(Ordering::Release);
        self.db
            .ring(self.id, QueueKind::Sq, self.wq.prod_idx() & self.wq.mask());

        self.stats.on_packet(plan.total_len as u64);
        Ok(())
    }

    /// Releases every packet the device has moved past, returning the
    /// number of slots freed. Non-blocking; returns 0 when nothing
    /// completed.
    pub fn reclaim(&mut self) -> u16 {
        let hw_ci = self.hw_ci();
        let mask = self.wq.mask();
        let mut released = 0u16;
        while self.wq.distance_used() != 0 {
            let cons = self.wq.cons_idx();
            let head = (cons & mask) as usize;
            let Some(entry) = self.entries[head].take() else {
                debug_assert!(false, "consumer index not at a packet head");
                break;
            };
            // The cell holds a masked index; with at most capacity - 1
            // slots outstanding the masked distance is unambiguous.
            let done = hw_ci.wrapping_sub(cons) & mask;
            if done < entry.wqebb_cnt {
                self.entries[head] = Some(entry);
                break;
            }
            let cnt = entry.wqebb_cnt;
            for seg in entry.segs {
                self.pool.free(seg.frame);
            }
            if let Some(cb) = entry.bounce {
                self.copy_pool.put(cb);
            }
            self.wq.release(cnt);
            released += cnt;
        }
        released
    }

    /// Stops the queue: asks the device to flush, drains within the
    /// configured bound, then releases whatever is left regardless of
    /// completion status.
    ///
    /// A [`DrainTimeout`] is reported but does not prevent teardown; the
    /// queue always ends up `Stopped` with every buffer returned exactly
    /// once.
    pub fn stop(&mut self, ctl: &dyn QueueCtl) -> Result<(), DrainTimeout> {
        if self.state != QueueState::Running {
            self.state = QueueState::Stopped;
            return Ok(());
        }
        self.state = QueueState::Stopping;

        if let Err(e) = ctl.flush_queue(self.id, QueueKind::Sq) {
            log::warn!("sq {}: flush request failed: {}", self.id, e);
        }

        let timeout = self.drain_timeout;
        let res = drain_bounded(timeout, || {
            self.reclaim();
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
                log::error!("sq {}: {}", self.id, err);
                Err(err)
            }
        };

        // After flush and drain no further device writes land in this
        // memory; unconditional release is correct only here.
        let forced = self.force_release_all();
        if forced > 0 {
            self.stats.on_force_release(forced);
        }
        self.state = QueueState::Stopped;
        res
    }

    /// Releases all remaining in-flight entries without looking at
    /// completion state. Returns the number of packets released.
    fn force_release_all(&mut self) -> u64 {
        let mask = self.wq.mask();
        let mut packets = 0u64;
        while self.wq.distance_used() != 0 {
            let head = (self.wq.cons_idx() & mask) as usize;
            let Some(entry) = self.entries[head].take() else {
                // No head entry where one is expected; step one slot so
                // teardown still terminates.
                self.wq.release(1);
                continue;
            };
            let cnt = entry.wqebb_cnt;
            for seg in entry.segs {
                self.pool.free(seg.frame);
            }
            if let Some(cb) = entry.bounce {
                self.copy_pool.put(cb);
            }
            self.wq.release(cnt);
            packets += 1;
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HwError;
    use crate::pool::FramePool;
    use std::sync::atomic::{AtomicU32, AtomicU64};
    use std::time::Duration;

    /// Control-plane stub that remembers the CI cell address so the test
    /// can play the device's role.
    #[derive(Default)]
    struct FakeDev {
        ci_addr: AtomicU64,
        doorbells: AtomicU32,
        last_pi: AtomicU32,
    }

    impl QueueCtl for FakeDev {
        fn program_queue_context(&self, ctx: &QueueContext) -> Result<(), HwError> {
            self.ci_addr.store(ctx.ci_addr, Ordering::Relaxed);
            Ok(())
        }

        fn flush_queue(&self, _q: QueueId, _k: QueueKind) -> Result<(), HwError> {
            Ok(())
        }
    }

    impl Doorbell for FakeDev {
        fn ring(&self, _q: QueueId, _k: QueueKind, pi: u16) {
            self.doorbells.fetch_add(1, Ordering::Relaxed);
            self.last_pi.store(pi as u32, Ordering::Relaxed);
        }
    }

    impl FakeDev {
        /// Acknowledge `wqebbs` more slots, the way hardware would: by
        /// writing the masked consumer index into the CI cell.
        fn ack(&self, current_ci: &mut u16, wqebbs: u16, mask: u16) {
            *current_ci = current_ci.wrapping_add(wqebbs) & mask;
            let addr = self.ci_addr.load(Ordering::Relaxed) as *mut u16;
            unsafe {
                AtomicU16::from_ptr(addr).store(*current_ci, Ordering::Release);
            }
        }
    }

    fn setup(depth: u32, frames: u16) -> (TxQueue, Arc<FakeDev>, Arc<FramePool>) {
        let dev = Arc::new(FakeDev::default());
        let pool = Arc::new(FramePool::new(frames, 2048, Some(false)).unwrap());
        let cfg = QueueConfig {
            depth,
            drain_timeout: Duration::from_millis(20),
            ..QueueConfig::default()
        };
        let txq = TxQueue::start(
            QueueId(0),
            &cfg,
            pool.clone() as Arc<dyn PacketPool>,
            dev.clone() as Arc<dyn Doorbell>,
            dev.as_ref(),
        )
        .unwrap();
        (txq, dev, pool)
    }

    fn one_frame_packet(pool: &FramePool, len: u32) -> TxPacket {
        TxPacket::single(pool.alloc().unwrap(), len)
    }

    #[test]
    fn submit_ack_reclaim_returns_every_buffer() {
        let (mut txq, dev, pool) = setup(64, 16);
        let mut ci = 0u16;
        for _ in 0..10 {
            txq.submit(one_frame_packet(&pool, 100)).unwrap();
        }
        assert_eq!(txq.distance_used(), 10);
        assert_eq!(dev.doorbells.load(Ordering::Relaxed), 10);
        assert_eq!(dev.last_pi.load(Ordering::Relaxed), 10);

        dev.ack(&mut ci, 10, 63);
        assert_eq!(txq.reclaim(), 10);
        assert_eq!(txq.distance_used(), 0);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(txq.stats().packets, 10);
    }

    #[test]
    fn multi_slot_packet_is_released_whole() {
        let (mut txq, dev, pool) = setup(64, 16);
        let mut ci = 0u16;
        let segs = (0..3)
            .map(|_| TxSeg {
                frame: pool.alloc().unwrap(),
                len: 500,
            })
            .collect();
        txq.submit(TxPacket {
            segs,
            offload: TxOffload::default(),
        })
        .unwrap();
        // 1 control slot + 3 SGEs.
        assert_eq!(txq.distance_used(), 4);

        // Partial progress must not release anything.
        dev.ack(&mut ci, 3, 63);
        assert_eq!(txq.reclaim(), 0);
        assert_eq!(pool.outstanding(), 3);

        dev.ack(&mut ci, 1, 63);
        assert_eq!(txq.reclaim(), 4);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn ring_full_hands_the_packet_back() {
        let (mut txq, _dev, pool) = setup(64, 80);
        // TSO keeps the segment ceiling above the 62 SGEs needed to fill
        // the ring with one packet: 1 + 62 slots = capacity - 1.
        let make = |pool: &FramePool| TxPacket {
            segs: (0..62)
                .map(|_| TxSeg {
                    frame: pool.alloc().unwrap(),
                    len: 100,
                })
                .collect(),
            offload: TxOffload {
                tso_mss: Some(1460),
                ..TxOffload::default()
            },
        };
        txq.submit(make(&pool)).unwrap();
        assert_eq!(txq.distance_free(), 0);

        let err = txq.submit(one_frame_packet(&pool, 64)).unwrap_err();
        assert!(matches!(err.kind, TxErrorKind::RingFull { need: 1, free: 0 }));
        let pkt = err.packet.expect("packet handed back");
        for seg in pkt.segs {
            pool.free(seg.frame);
        }
        assert_eq!(txq.stats().ring_full, 1);
    }

    #[test]
    fn encoder_rejection_drops_and_counts() {
        let (mut txq, _dev, pool) = setup(64, 8);
        let mut pkt = one_frame_packet(&pool, 100);
        pkt.segs[0].len = 0;
        let err = txq.submit(pkt).unwrap_err();
        assert!(matches!(err.kind, TxErrorKind::Offload(_)));
        assert!(err.packet.is_none());
        // The dropped packet's frame went straight back to the pool.
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(txq.stats().offload_errors, 1);
        assert_eq!(txq.distance_used(), 0);
    }

    #[test]
    fn stop_without_acks_times_out_but_frees_everything_once() {
        let (mut txq, dev, pool) = setup(64, 8);
        for _ in 0..3 {
            txq.submit(one_frame_packet(&pool, 100)).unwrap();
        }
        let err = txq.stop(dev.as_ref()).unwrap_err();
        assert_eq!(err.outstanding, 3);
        assert_eq!(txq.state(), QueueState::Stopped);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(txq.stats().force_released, 3);
    }

    #[test]
    fn stop_after_full_drain_is_clean() {
        let (mut txq, dev, pool) = setup(64, 8);
        let mut ci = 0u16;
        txq.submit(one_frame_packet(&pool, 100)).unwrap();
        dev.ack(&mut ci, 1, 63);
        txq.stop(dev.as_ref()).unwrap();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(txq.stats().force_released, 0);
        // Submitting on a stopped queue is refused.
        let f = pool.alloc().unwrap();
        let err = txq.submit(TxPacket::single(f, 10)).unwrap_err();
        assert!(matches!(err.kind, TxErrorKind::NotRunning));
        for seg in err.packet.unwrap().segs {
            pool.free(seg.frame);
        }
    }

    #[test]
    fn bounce_path_uses_and_returns_a_copy_buffer() {
        let (mut txq, dev, pool) = setup(256, 64);
        let mut ci = 0u16;
        let segs = (0..39)
            .map(|_| TxSeg {
                frame: pool.alloc().unwrap(),
                len: 64,
            })
            .collect();
        txq.submit(TxPacket {
            segs,
            offload: TxOffload::default(),
        })
        .unwrap();
        // 37 direct SGEs + 1 copy SGE + control slot.
        assert_eq!(txq.distance_used(), 39);
        assert_eq!(txq.stats().bounced, 1);

        dev.ack(&mut ci, 39, 255);
        assert_eq!(txq.reclaim(), 39);
        assert_eq!(pool.outstanding(), 0);
    }
}
