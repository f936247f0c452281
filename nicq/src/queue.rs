//! # Queue Lifecycle
//!
//! ## Purpose
//!
//! Shared lifecycle pieces of the TX and RX queues: the linear state
//! machine, the validated queue configuration, and the bounded drain loop
//! used when a queue is stopped while packets may still be in flight.
//!
//! ## How it works
//!
//! A queue moves `Stopped -> Starting -> Running -> Stopping -> Stopped`
//! and nothing else; concurrent transitions on the same queue are ruled
//! out by `&mut` access. Configuration is validated once at start: the
//! requested depth is rounded up to a power of two and bounded, and the
//! free threshold has to stay strictly below `capacity - 1` so reclamation
//! happens before the ring saturates rather than after. The drain loop
//! polls a reclamation callback until the ring is empty or the deadline
//! passes; it never blocks on the hardware.

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{ConfigError, ConfigErrorKind};
use crate::ring::normalize_depth;
use crate::wqe::RqWqeKind;

/// Lifecycle state of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Caller-supplied queue configuration, validated at start.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Requested ring depth; rounded up to the next power of two.
    pub depth: u32,
    /// Free-slot threshold below which the consumer side reclaims or
    /// replenishes proactively. Must stay below `capacity - 1`.
    pub free_thresh: u16,
    /// RX buffer capacity; 0 means "whatever the pool hands out". Must not
    /// exceed the pool frame length.
    pub buf_len: u32,
    /// Shape of the RX descriptors.
    pub rq_wqe: RqWqeKind,
    /// Validate checksum indications from completions.
    pub csum_offload: bool,
    /// Bound on the stop-time drain loop.
    pub drain_timeout: Duration,
    /// Bounce buffers kept by a TX queue.
    pub copy_bufs: u16,
    /// Back the ring memory with huge pages; `None` probes the system.
    pub huge_pages: Option<bool>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            depth: 1024,
            free_thresh: 32,
            buf_len: 0,
            rq_wqe: RqWqeKind::Normal,
            csum_offload: true,
            drain_timeout: Duration::from_secs(3),
            copy_bufs: 64,
            huge_pages: Some(false),
        }
    }
}

/// A configuration that passed validation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CheckedConfig {
    pub depth: u16,
    pub free_thresh: u16,
    pub buf_len: u32,
    pub rq_wqe: RqWqeKind,
    pub csum_offload: bool,
    pub drain_timeout: Duration,
    pub copy_bufs: u16,
    pub huge_pages: Option<bool>,
}

impl QueueConfig {
    pub(crate) fn check(&self, pool_frame_len: u32) -> Result<CheckedConfig, ConfigError> {
        let depth = normalize_depth(self.depth)?;
        if self.free_thresh >= depth - 1 {
            return Err(ConfigError {
                name: "free_thresh",
                kind: ConfigErrorKind::ThresholdTooHigh {
                    thresh: self.free_thresh,
                    capacity: depth,
                },
            });
        }
        if self.buf_len > pool_frame_len {
            return Err(ConfigError {
                name: "buf_len",
                kind: ConfigErrorKind::BufferTooLong {
                    requested: self.buf_len,
                    frame: pool_frame_len,
                },
            });
        }
        Ok(CheckedConfig {
            depth,
            free_thresh: self.free_thresh,
            buf_len: if self.buf_len == 0 {
                pool_frame_len
            } else {
                self.buf_len
            },
            rq_wqe: self.rq_wqe,
            csum_offload: self.csum_offload,
            drain_timeout: self.drain_timeout,
            copy_bufs: self.copy_bufs,
            huge_pages: self.huge_pages,
        })
    }
}

/// Runs one reclamation `step` at a time until it reports an empty ring or
/// `timeout` elapses. The step returns the number of slots still
/// outstanding; the leftover count is handed back on timeout.
///
/// This is a polling loop with a deadline, not a blocking wait: stop must
/// never hang teardown on unresponsive hardware.
pub(crate) fn drain_bounded(
    timeout: Duration,
    mut step: impl FnMut() -> u16,
) -> Result<(), u16> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = step();
        if left == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(left);
        }
        thread::sleep(Duration::from_micros(50));
    }
}
