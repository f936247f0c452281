//! # DMA-Coherent Memory Regions
//!
//! ## Purpose
//!
//! This module provides the memory that both the driver and the device
//! read and write: descriptor rings, completion entry arrays, packet frame
//! storage and the TX consumer-index cell all live in a [`DmaRegion`].
//!
//! ## How it works
//!
//! A region is an anonymous, page-aligned `libc::mmap` allocation, zeroed by
//! the kernel, optionally backed by 2MB huge pages to cut TLB pressure for
//! large frame pools. The mapping is released with `munmap` when the region
//! is dropped. The bus address handed to the device is the identity-mapped
//! process address; a real PCI backend would substitute its IOMMU mapping
//! here, nothing else in the engine cares.
//!
//! ## Main components
//!
//! - `DmaRegion`: a safe owner of one mapped region.
//! - `hugepages_available()`: probes `/proc/meminfo` for free 2MB pages.

use std::fs::File;
use std::io::{BufRead as _, BufReader};
use std::{io, ptr};

/// A zeroed, page-aligned memory region shared with the device.
pub struct DmaRegion {
    ptr: *mut libc::c_void,
    len: usize,
}

// SAFETY: the region is plain memory; which context may touch which bytes is
// governed by the ring and pool that own the region.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Maps a new zeroed region of at least `size` bytes.
    ///
    /// If `huge_page` is `None` the allocator uses 2MB huge pages whenever
    /// `/proc/meminfo` reports free ones; `Some(..)` forces the choice. The
    /// actual length is rounded up to the page size in use.
    pub fn alloc(size: usize, huge_page: Option<bool>) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::other("zero-length DMA region"));
        }

        let huge_tlb = match huge_page {
            Some(yes) => yes,
            None => hugepages_available().unwrap_or(false),
        };
        let page_size = if huge_tlb {
            2 * 1024 * 1024
        } else {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        };
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | if huge_tlb {
                        libc::MAP_HUGETLB | libc::MAP_HUGE_2MB
                    } else {
                        0
                    },
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(DmaRegion {
            ptr,
            len: aligned_size,
        })
    }

    /// Base of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    /// Bus address of the region as seen by the device.
    #[inline]
    pub fn iova(&self) -> u64 {
        self.ptr as u64
    }

    /// Mapped length in bytes, page-rounded.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        unsafe {
            if self.ptr != libc::MAP_FAILED && !self.ptr.is_null() {
                if libc::munmap(self.ptr, self.len) < 0 {
                    log::error!("failed to unmap DMA region: {}", io::Error::last_os_error());
                }
            }
        }
    }
}

/// Checks `/proc/meminfo` for free 2MB huge pages.
pub fn hugepages_available() -> io::Result<bool> {
    let file = File::open("/proc/meminfo")?;
    let reader = BufReader::new(file);
    let mut size_kb = 0u64;
    let mut free = 0u64;
    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_end_matches(" kB");
        match key.trim() {
            "Hugepagesize" => size_kb = value.parse().map_err(io::Error::other)?,
            "HugePages_Free" => free = value.parse().map_err(io::Error::other)?,
            _ => {}
        }
    }
    Ok(size_kb == 2048 && free > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zeroed_and_page_rounded() {
        let region = DmaRegion::alloc(1000, Some(false)).unwrap();
        assert!(region.len() >= 1000);
        assert_eq!(region.len() % 4096, 0);
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_length_rejected() {
        assert!(DmaRegion::alloc(0, Some(false)).is_err());
    }

    #[test]
    fn iova_matches_pointer() {
        let region = DmaRegion::alloc(4096, Some(false)).unwrap();
        assert_eq!(region.iova(), region.as_ptr() as u64);
    }
}
