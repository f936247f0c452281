//! # Software NIC Model
//!
//! ## Purpose
//!
//! A device model for exercising the ring engine without hardware. It
//! plays the device's half of the contract: it learns the DMA addresses
//! from the queue context it is programmed with, consumes doorbells,
//! writes packet bytes into posted RX buffers, publishes completion
//! entries, and DMA-writes the TX consumer index cell.
//!
//! ## How it works
//!
//! `SimNic` implements the engine's `QueueCtl` and `Doorbell` seams. All
//! device-side memory access goes through the addresses carried by the
//! programmed `QueueContext`, exactly like a DMA engine would: RX buffer
//! addresses are decoded from the posted work queue entries, completion
//! publication is a release store of the status word after the data is in
//! place, and TX acknowledgment is a release store of the masked consumer
//! index into the CI cell.
//!
//! Fault injection: `set_auto_ack_tx(false)` stops TX progress,
//! `set_mute(true)` makes flush requests succeed without quiescing
//! anything, which is how the drain-timeout paths are tested. A delivery
//! longer than one buffer writes only the head completion's done bit and
//! leaves the chained entries untouched, matching the hardware contract
//! the consumer relies on.
//!
//! ## Main components
//!
//! - `SimNic`: the device model.
//! - `SimRxMeta`: completion metadata to attach to a delivery.
//! - `udp_frame()` / `tcp_frame()`: realistic test frames via etherparse.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering, fence};

use anyhow::{Context as _, bail};
use nicq::error::HwError;
use nicq::hw::{Doorbell, QueueContext, QueueCtl, QueueId, QueueKind};
use nicq::wqe::{
    CQE_SHIFT, RqCqe, RqWqe, RqWqeKind, mk_cqe_offload_type, mk_cqe_status, mk_cqe_vlan_len,
};

/// Completion metadata attached to one simulated delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimRxMeta {
    pub vlan: Option<u16>,
    pub rss: Option<u32>,
    pub csum_err: u32,
    pub lro_segs: u8,
}

struct SimSq {
    ctx: QueueContext,
    /// Masked consumer index the device has written back.
    ci: u16,
    /// Masked producer index from the last doorbell.
    pi: u16,
    doorbells: u32,
}

struct SimRq {
    ctx: QueueContext,
    /// Masked producer index from the last doorbell: slots posted by the
    /// driver.
    posted_pi: u16,
    /// Masked index of the next slot the device will fill.
    fill_ci: u16,
    doorbells: u32,
}

#[derive(Default)]
struct Inner {
    sqs: HashMap<u16, SimSq>,
    rqs: HashMap<u16, SimRq>,
    auto_ack_tx: bool,
    mute: bool,
}

/// The software device.
#[derive(Default)]
pub struct SimNic {
    inner: Mutex<Inner>,
}

impl SimNic {
    pub fn new() -> Self {
        SimNic::default()
    }

    /// Acknowledge every TX doorbell immediately.
    pub fn set_auto_ack_tx(&self, yes: bool) {
        lock(&self.inner).auto_ack_tx = yes;
    }

    /// When muted, flush requests succeed but quiesce nothing; TX acks
    /// stop too. Models an unresponsive device.
    pub fn set_mute(&self, yes: bool) {
        lock(&self.inner).mute = yes;
    }

    /// Device-side acknowledgment of `wqebbs` more TX slots.
    pub fn ack_tx(&self, queue: QueueId, wqebbs: u16) {
        let mut inner = lock(&self.inner);
        if inner.mute {
            return;
        }
        if let Some(sq) = inner.sqs.get_mut(&queue.0) {
            sq.ci = sq.ci.wrapping_add(wqebbs) & (sq.ctx.depth - 1);
            write_ci_cell(&sq.ctx, sq.ci);
        }
    }

    pub fn tx_doorbells(&self, queue: QueueId) -> u32 {
        lock(&self.inner).sqs.get(&queue.0).map_or(0, |q| q.doorbells)
    }

    pub fn rx_doorbells(&self, queue: QueueId) -> u32 {
        lock(&self.inner).rqs.get(&queue.0).map_or(0, |q| q.doorbells)
    }

    /// RX buffers posted by the driver and not yet filled.
    pub fn rx_available(&self, queue: QueueId) -> u16 {
        let inner = lock(&self.inner);
        inner.rqs.get(&queue.0).map_or(0, |rq| {
            rq.posted_pi.wrapping_sub(rq.fill_ci) & (rq.ctx.depth - 1)
        })
    }

    /// Delivers one packet into the posted RX buffers, spanning as many
    /// slots as its length requires, and publishes the head completion.
    ///
    /// Chained slots receive packet bytes but no completion of their own;
    /// the head's done bit covers them, per the hardware contract.
    pub fn deliver(&self, queue: QueueId, data: &[u8], meta: SimRxMeta) -> anyhow::Result<()> {
        let mut inner = lock(&self.inner);
        let rq = inner
            .rqs
            .get_mut(&queue.0)
            .context("rx queue not programmed")?;
        if data.is_empty() || data.len() > u16::MAX as usize {
            bail!("delivery of {} bytes is out of range", data.len());
        }
        let buf_len = rq.ctx.buf_len as usize;
        let mask = rq.ctx.depth - 1;
        let slots = data.len().div_ceil(buf_len) as u16;
        let available = rq.posted_pi.wrapping_sub(rq.fill_ci) & mask;
        if slots > available {
            bail!("{} slots needed, {} posted", slots, available);
        }

        let kind = match rq.ctx.wqe_type {
            0 => RqWqeKind::Normal,
            _ => RqWqeKind::Extend,
        };
        let head_slot = rq.fill_ci;
        for (i, chunk) in data.chunks(buf_len).enumerate() {
            let slot = head_slot.wrapping_add(i as u16) & mask;
            let wqe_ptr =
                (rq.ctx.wq_base + ((slot as u64) << rq.ctx.wqebb_shift)) as *const u8;
            let buf = RqWqe::decode_buf_addr(kind, wqe_ptr) as *mut u8;
            // SAFETY: the driver posted this buffer for exactly this
            // purpose; the model is the device.
            unsafe {
                std::ptr::copy_nonoverlapping(chunk.as_ptr(), buf, chunk.len());
            }
        }

        // Fill the head completion entry, then publish it with a release
        // store of the status word, the same order hardware must use.
        let cqe_ptr = (rq.ctx.cqe_base + ((head_slot as u64) << CQE_SHIFT)) as *mut RqCqe;
        unsafe {
            (*cqe_ptr).vlan_len = mk_cqe_vlan_len(data.len() as u32, meta.vlan.unwrap_or(0));
            (*cqe_ptr).offload_type =
                mk_cqe_offload_type(if meta.rss.is_some() { 0x5 } else { 0 }, meta.vlan.is_some());
            (*cqe_ptr).hash_val = meta.rss.unwrap_or(0);
        }
        fence(Ordering::Release);
        let status = mk_cqe_status(true, false, meta.lro_segs, meta.csum_err);
        unsafe {
            AtomicU32::from_ptr(cqe_ptr as *mut u32).store(status, Ordering::Release);
        }

        rq.fill_ci = rq.fill_ci.wrapping_add(slots) & mask;
        Ok(())
    }

    /// Delivery with default metadata.
    pub fn deliver_frame(&self, queue: QueueId, data: &[u8]) -> anyhow::Result<()> {
        self.deliver(queue, data, SimRxMeta::default())
    }
}

impl QueueCtl for SimNic {
    fn program_queue_context(&self, ctx: &QueueContext) -> Result<(), HwError> {
        if ctx.depth == 0 || !ctx.depth.is_power_of_two() {
            return Err(HwError::Rejected("queue depth must be a power of two"));
        }
        let mut inner = lock(&self.inner);
        match ctx.kind {
            QueueKind::Sq => {
                if ctx.ci_addr == 0 {
                    return Err(HwError::Rejected("sq context without a ci cell"));
                }
                if inner.sqs.contains_key(&ctx.queue.0) {
                    return Err(HwError::Rejected("sq context already programmed"));
                }
                inner.sqs.insert(
                    ctx.queue.0,
                    SimSq {
                        ctx: *ctx,
                        ci: 0,
                        pi: 0,
                        doorbells: 0,
                    },
                );
            }
            QueueKind::Rq => {
                if ctx.cqe_base == 0 || ctx.buf_len == 0 {
                    return Err(HwError::Rejected("rq context without cqe ring or buffers"));
                }
                if inner.rqs.contains_key(&ctx.queue.0) {
                    return Err(HwError::Rejected("rq context already programmed"));
                }
                inner.rqs.insert(
                    ctx.queue.0,
                    SimRq {
                        ctx: *ctx,
                        posted_pi: 0,
                        fill_ci: 0,
                        doorbells: 0,
                    },
                );
            }
        }
        log::debug!("sim: programmed {:?} {}", ctx.kind, ctx.queue);
        Ok(())
    }

    fn flush_queue(&self, queue: QueueId, kind: QueueKind) -> Result<(), HwError> {
        let mut inner = lock(&self.inner);
        if inner.mute {
            // The command "succeeds" but the device does nothing with it.
            return Ok(());
        }
        match kind {
            QueueKind::Sq => {
                if let Some(sq) = inner.sqs.get_mut(&queue.0) {
                    sq.ci = sq.pi;
                    write_ci_cell(&sq.ctx, sq.ci);
                }
            }
            QueueKind::Rq => {
                if let Some(rq) = inner.rqs.get_mut(&queue.0) {
                    // Return every posted-but-unfilled buffer with a flush
                    // completion, one slot each.
                    let mask = rq.ctx.depth - 1;
                    while rq.fill_ci != rq.posted_pi {
                        let cqe_ptr =
                            (rq.ctx.cqe_base + ((rq.fill_ci as u64) << CQE_SHIFT)) as *mut u32;
                        let status = mk_cqe_status(false, true, 0, 0);
                        unsafe {
                            AtomicU32::from_ptr(cqe_ptr).store(status, Ordering::Release);
                        }
                        rq.fill_ci = rq.fill_ci.wrapping_add(1) & mask;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Doorbell for SimNic {
    fn ring(&self, queue: QueueId, kind: QueueKind, pi: u16) {
        let mut inner = lock(&self.inner);
        match kind {
            QueueKind::Sq => {
                let auto = inner.auto_ack_tx && !inner.mute;
                if let Some(sq) = inner.sqs.get_mut(&queue.0) {
                    sq.doorbells += 1;
                    sq.pi = pi & (sq.ctx.depth - 1);
                    if auto {
                        sq.ci = sq.pi;
                        write_ci_cell(&sq.ctx, sq.ci);
                    }
                }
            }
            QueueKind::Rq => {
                if let Some(rq) = inner.rqs.get_mut(&queue.0) {
                    rq.doorbells += 1;
                    // The doorbell counts base-size slots; undo the
                    // WQE-type shift.
                    rq.posted_pi = (pi >> rq.ctx.wqe_type) & (rq.ctx.depth - 1);
                }
            }
        }
    }
}

/// DMA write of the masked TX consumer index, release-ordered like the
/// real write-back.
fn write_ci_cell(ctx: &QueueContext, ci: u16) {
    // SAFETY: ci_addr points into the queue's CI cell region for the
    // queue's lifetime; the model is the device.
    unsafe {
        AtomicU16::from_ptr(ctx.ci_addr as *mut u16).store(ci, Ordering::Release);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A complete Ethernet/IPv4/UDP frame around `payload`.
pub fn udp_frame(payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let builder = etherparse::PacketBuilder::ethernet2(
        [0x02, 0, 0, 0, 0, 0x01],
        [0x02, 0, 0, 0, 0, 0x02],
    )
    .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
    .udp(4000, 4001);
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload)?;
    Ok(out)
}

/// A complete Ethernet/IPv4/TCP frame around `payload`.
pub fn tcp_frame(payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let builder = etherparse::PacketBuilder::ethernet2(
        [0x02, 0, 0, 0, 0, 0x01],
        [0x02, 0, 0, 0, 0, 0x02],
    )
    .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
    .tcp(4000, 4001, 1, 64240);
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload)?;
    Ok(out)
}
