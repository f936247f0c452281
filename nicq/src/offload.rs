//! # Segmentation and Offload Encoder
//!
//! ## Purpose
//!
//! Given one logical outbound packet, its segment lengths and the
//! requested offloads, this module decides how many descriptor slots the
//! packet needs, whether the trailing segments must be bounced through a
//! copy buffer to satisfy the hardware's scatter-gather limits, and what
//! goes into the offload control words.
//!
//! ## How it works
//!
//! Planning is a pure pass over segment lengths; it touches no ring state,
//! so a failed plan leaves nothing to roll back and slot reservation only
//! happens after the plan succeeds. Non-TSO packets are bounded by the
//! 16-bit length field and one segment-count ceiling. TSO packets get a
//! larger ceiling but additionally every MSS-sized window of the byte
//! stream must stay within the per-window fragment limit, because the
//! device builds one transmit context per window. When either constraint
//! fails, the plan collapses a tail suffix of the segments into a single
//! bounce buffer; windows ahead of the copied tail only lose fragments by
//! that substitution, so one forward scan is enough.
//!
//! ## Main components
//!
//! - `TxOffload`: the caller's offload request.
//! - `plan()`: segment walk producing a [`TxPlan`] or a definite error.
//! - `first_invalid_window()`: the per-MSS-window fragment-count check.

use crate::error::OffloadError;
use crate::wqe::{
    SQ_TASK_L3_CSUM, SQ_TASK_L4_SHIFT, SQ_TASK_TSO, SQ_TASK_TUNNEL, SQ_TASK_VLAN_INSERT,
    SqOffloadWords,
};

/// Most scatter-gather entries a non-TSO packet may carry.
pub const SQ_MAX_NONTSO_SGE: usize = 38;
/// Most scatter-gather entries a TSO packet may carry.
pub const SQ_MAX_TSO_SGE: usize = 127;
/// Most fragments any single MSS window of a TSO packet may span.
pub const SQ_MAX_SGE_PER_MSS_WINDOW: usize = SQ_MAX_NONTSO_SGE;
/// Upper bound on one tail bounce copy.
pub const SQ_MAX_COPY_BYTES: u32 = 4096;
/// Hard length limit for non-TSO packets, the width of the descriptor
/// length field. Not a tunable.
pub const SQ_MAX_NONTSO_PKT_LEN: u32 = 65535;

/// L4 checksum offload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum L4Offload {
    #[default]
    None,
    Tcp,
    Udp,
    Sctp,
}

/// Offloads requested for one outbound packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOffload {
    /// IPv4/IPv6 header checksum.
    pub l3_csum: bool,
    pub l4: L4Offload,
    /// TCP segmentation offload with the given MSS.
    pub tso_mss: Option<u16>,
    /// VLAN tag to insert on the wire.
    pub vlan_tci: Option<u16>,
    /// Tunnel encapsulation: checksum requests apply to the outer headers.
    /// The flag is authoritative in both directions; a tunnel is never
    /// inferred from packet contents, and when the flag is present the
    /// tunneled interpretation always wins.
    pub tunnel: bool,
}

impl TxOffload {
    /// True when any offload is requested and the extended WQE format is
    /// required regardless of segment count.
    #[inline]
    pub fn any(&self) -> bool {
        self.l3_csum
            || self.l4 != L4Offload::None
            || self.tso_mss.is_some()
            || self.vlan_tci.is_some()
            || self.tunnel
    }

    /// The offload control words for the extended WQE header.
    pub fn words(&self) -> SqOffloadWords {
        let mut offload = 0u32;
        if self.l3_csum {
            offload |= SQ_TASK_L3_CSUM;
        }
        offload |= match self.l4 {
            L4Offload::None => 0,
            L4Offload::Tcp => 1 << SQ_TASK_L4_SHIFT,
            L4Offload::Udp => 2 << SQ_TASK_L4_SHIFT,
            L4Offload::Sctp => 3 << SQ_TASK_L4_SHIFT,
        };
        if self.tso_mss.is_some() {
            offload |= SQ_TASK_TSO;
        }
        if self.tunnel {
            offload |= SQ_TASK_TUNNEL;
        }
        if self.vlan_tci.is_some() {
            offload |= SQ_TASK_VLAN_INSERT;
        }
        SqOffloadWords {
            offload,
            mss_vlan: (self.tso_mss.unwrap_or(0) as u32)
                | ((self.vlan_tci.unwrap_or(0) as u32) << 16),
        }
    }
}

/// Tail segments to collapse into one copy buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BouncePlan {
    /// Index of the first segment to copy; everything from here to the end
    /// of the packet lands in the bounce buffer.
    pub first_seg: usize,
    pub copy_len: u32,
}

/// A fully determined descriptor-fill plan for one packet.
#[derive(Debug, Clone, Copy)]
pub struct TxPlan {
    /// Descriptor slots the packet will occupy.
    pub wqebb_cnt: u16,
    /// Scatter-gather entries after any bounce is applied.
    pub sge_cnt: u16,
    pub bounce: Option<BouncePlan>,
    pub total_len: u32,
    /// False only for the single-slot compact format.
    pub extended: bool,
    pub words: SqOffloadWords,
}

/// Plans the descriptor layout for one packet.
///
/// Pure: no ring state is touched, so a failure aborts that one packet and
/// nothing else.
pub fn plan(seg_lens: &[u32], off: &TxOffload) -> Result<TxPlan, OffloadError> {
    if seg_lens.is_empty() || seg_lens.iter().any(|&l| l == 0) {
        return Err(OffloadError::EmptyPacket);
    }
    let total_len: u32 = seg_lens.iter().sum();
    let nsegs = seg_lens.len();

    let (max_sge, bounce_from) = match off.tso_mss {
        None => {
            if total_len > SQ_MAX_NONTSO_PKT_LEN {
                return Err(OffloadError::PacketTooLong { len: total_len });
            }
            let from = (nsegs > SQ_MAX_NONTSO_SGE).then_some(SQ_MAX_NONTSO_SGE - 1);
            (SQ_MAX_NONTSO_SGE, from)
        }
        Some(0) => return Err(OffloadError::ZeroMss),
        Some(mss) => {
            let by_count = (nsegs > SQ_MAX_TSO_SGE).then_some(SQ_MAX_TSO_SGE - 1);
            let by_window =
                first_invalid_window(seg_lens, mss as u32, SQ_MAX_SGE_PER_MSS_WINDOW);
            let from = match (by_count, by_window) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(usize::MAX).min(b.unwrap_or(usize::MAX))),
            };
            (SQ_MAX_TSO_SGE, from)
        }
    };

    let (sge_cnt, bounce) = match bounce_from {
        None => (nsegs, None),
        Some(first_seg) => {
            let copy_len: u32 = seg_lens[first_seg..].iter().sum();
            if copy_len > SQ_MAX_COPY_BYTES {
                return Err(if nsegs > max_sge {
                    OffloadError::TooManySegments {
                        segs: nsegs,
                        max: max_sge,
                    }
                } else {
                    OffloadError::CopyTooLong {
                        len: copy_len,
                        max: SQ_MAX_COPY_BYTES,
                    }
                });
            }
            (first_seg + 1, Some(BouncePlan { first_seg, copy_len }))
        }
    };

    let extended = sge_cnt > 1 || off.any();
    Ok(TxPlan {
        wqebb_cnt: if extended { 1 + sge_cnt as u16 } else { 1 },
        sge_cnt: sge_cnt as u16,
        bounce,
        total_len,
        extended,
        words: off.words(),
    })
}

/// Finds the first MSS window whose fragment count exceeds `limit`.
///
/// Windows partition the packet's byte stream into `mss`-sized spans; a
/// segment contributes one fragment to every window it overlaps. Returns
/// the index of the first segment of the offending window, which is where
/// a tail bounce has to start.
fn first_invalid_window(lens: &[u32], mss: u32, limit: usize) -> Option<usize> {
    let mut seg = 0usize;
    let mut consumed = 0u32;
    loop {
        let start = seg;
        let mut remaining = mss;
        let mut frags = 0usize;
        while remaining > 0 && seg < lens.len() {
            frags += 1;
            let avail = lens[seg] - consumed;
            if avail > remaining {
                consumed += remaining;
                remaining = 0;
            } else {
                remaining -= avail;
                seg += 1;
                consumed = 0;
            }
        }
        if frags > limit {
            return Some(start);
        }
        if seg >= lens.len() {
            return None;
        }
    }
}
