//! # Region Allocator
//!
//! Page-backed memory regions for the probe, using raw libc syscalls.
//! Regions are anonymous `mmap` mappings, optionally bound to a node
//! with `mbind`, and released with `munmap` exactly once on drop.

use std::ptr::{self, NonNull};

use serde::{Deserialize, Serialize};

use super::{NumaError, TopologyService};

/// Where the pages of a region should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Let the kernel's first-touch policy decide.
    #[default]
    FirstTouch,
    /// Strictly bind to one NUMA node (`MPOL_BIND`).
    Node(usize),
    /// Interleave pages across all nodes (`MPOL_INTERLEAVE`).
    Interleaved,
}

/// Allocates [`MemoryRegion`]s against a topology.
///
/// Uses `mmap` + `mbind` on Linux and the global allocator elsewhere.
#[derive(Debug)]
pub struct NumaAllocator<'t, T: TopologyService + ?Sized> {
    topology: &'t T,
    huge_pages: bool,
}

impl<'t, T: TopologyService + ?Sized> NumaAllocator<'t, T> {
    /// Create a new allocator over the given topology.
    #[must_use]
    pub fn new(topology: &'t T) -> Self {
        Self {
            topology,
            huge_pages: false,
        }
    }

    /// Advise transparent huge pages for new regions.
    #[must_use]
    pub fn with_huge_pages(mut self, enabled: bool) -> Self {
        self.huge_pages = enabled;
        self
    }

    /// Allocate a zero-filled region of `size` bytes aligned to at least `align`.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero, the alignment is not a power of
    /// two no larger than a page, the placement names an unknown node, or
    /// the mapping itself fails.
    pub fn allocate(
        &self,
        size: usize,
        align: usize,
        placement: Placement,
    ) -> Result<MemoryRegion, NumaError> {
        if size == 0 {
            return Err(NumaError::AllocationFailed(
                "zero-length region".to_string(),
            ));
        }
        if !align.is_power_of_two() || align > super::page_size() {
            return Err(NumaError::InvalidAlignment(align));
        }
        if let Placement::Node(node) = placement {
            if node >= self.topology.num_nodes() {
                return Err(NumaError::InvalidNode {
                    node,
                    available: self.topology.num_nodes(),
                });
            }
        }

        let ptr = self.map(size, align)?;
        let region = MemoryRegion {
            ptr,
            size,
            align,
            placement,
        };

        #[cfg(target_os = "linux")]
        {
            if self.topology.num_nodes() > 1 {
                match placement {
                    Placement::FirstTouch => {}
                    Placement::Node(node) => self.bind(&region, MPOL_BIND, &nodemask([node])),
                    Placement::Interleaved => {
                        let mask = nodemask(0..self.topology.num_nodes());
                        self.bind(&region, MPOL_INTERLEAVE, &mask);
                    }
                }
            }
        }

        Ok(region)
    }

    #[cfg(target_os = "linux")]
    #[allow(unused_variables)]
    #[allow(unsafe_code)]
    fn map(&self, size: usize, align: usize) -> Result<NonNull<u8>, NumaError> {
        // SAFETY: mmap with MAP_ANONYMOUS | MAP_PRIVATE and no fixed address is safe
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(NumaError::AllocationFailed(format!(
                "mmap of {size} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        if self.huge_pages {
            // SAFETY: `ptr`/`size` describe the mapping just created; MADV_HUGEPAGE
            // is advisory and cannot affect memory safety.
            let rc = unsafe { libc::madvise(ptr, size, libc::MADV_HUGEPAGE) };
            if rc != 0 {
                tracing::debug!(
                    "madvise(MADV_HUGEPAGE) failed (non-fatal): {}",
                    std::io::Error::last_os_error()
                );
            }
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| NumaError::AllocationFailed("mmap returned null".to_string()))
    }

    #[cfg(not(target_os = "linux"))]
    #[allow(unsafe_code)]
    fn map(&self, size: usize, align: usize) -> Result<NonNull<u8>, NumaError> {
        let layout = std::alloc::Layout::from_size_align(size, align)
            .map_err(|e| NumaError::AllocationFailed(e.to_string()))?;

        // SAFETY: layout has non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            NumaError::AllocationFailed("std::alloc::alloc_zeroed failed".to_string())
        })
    }

    /// Apply an `mbind` policy to a region. Failures are logged, not fatal.
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn bind(&self, region: &MemoryRegion, mode: i32, nodemask: &[u64]) {
        // MPOL_MF_MOVE: migrate pages already faulted in
        const MPOL_MF_MOVE: u32 = 2;

        // The kernel reads `maxnode - 1` bits
        let maxnode = nodemask.len() * 64 + 1;

        // SAFETY: the region is a live mapping of `region.size` bytes and the
        // nodemask holds `maxnode - 1` bits and outlives the call.
        let result = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                region.ptr.as_ptr(),
                region.size,
                mode,
                nodemask.as_ptr(),
                maxnode,
                MPOL_MF_MOVE,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            tracing::warn!(
                "mbind({:?}) of {} bytes at {:p} failed (non-fatal): {}",
                region.placement,
                region.size,
                region.ptr,
                err
            );
        }
    }
}

/// Packs node ids into the word array `mbind(2)` expects.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn nodemask(nodes: impl IntoIterator<Item = usize>) -> Vec<u64> {
    let mut mask = Vec::new();
    for node in nodes {
        let word = node / 64;
        if word >= mask.len() {
            mask.resize(word + 1, 0u64);
        }
        mask[word] |= 1u64 << (node % 64);
    }
    mask
}

#[cfg(target_os = "linux")]
const MPOL_BIND: i32 = 2;
#[cfg(target_os = "linux")]
const MPOL_INTERLEAVE: i32 = 3;

/// An owned, zero-initialised memory region.
///
/// The region is exclusively owned: mutable access requires `&mut self`,
/// and the backing mapping is released exactly once when dropped.
#[derive(Debug)]
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
    placement: Placement,
}

// SAFETY: MemoryRegion uniquely owns its mapping, like a Box<[u8]>.
#[allow(unsafe_code)]
unsafe impl Send for MemoryRegion {}
// SAFETY: shared access only hands out `&[u8]`.
#[allow(unsafe_code)]
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Base address of the region.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Region length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always `false`: zero-length regions cannot be allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Alignment requested at allocation time.
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.align
    }

    /// Placement requested at allocation time.
    #[must_use]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// View the region as bytes.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is `size` bytes, zero-initialised at creation
        // and owned by `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// View the region as mutable bytes.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for MemoryRegion {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        // SAFETY: ptr/size describe a mapping created by `NumaAllocator::map`
        // that has not been unmapped yet.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.size);
        }

        #[cfg(not(target_os = "linux"))]
        // SAFETY: allocated with exactly this layout in `NumaAllocator::map`.
        unsafe {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, self.align) {
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::NumaTopology;

    #[test]
    fn test_allocate_zeroed_and_aligned() {
        let topo = NumaTopology::detect();
        let allocator = NumaAllocator::new(&topo);

        let region = allocator.allocate(4096, 64, Placement::FirstTouch).unwrap();
        assert_eq!(region.len(), 4096);
        assert_eq!(region.as_ptr() as usize % 64, 0);
        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocate_byte_alignment() {
        let topo = NumaTopology::detect();
        let allocator = NumaAllocator::new(&topo);

        let region = allocator.allocate(100, 1, Placement::FirstTouch).unwrap();
        assert_eq!(region.len(), 100);
        assert_eq!(region.alignment(), 1);
    }

    #[test]
    fn test_allocate_zero_size_rejected() {
        let topo = NumaTopology::detect();
        let allocator = NumaAllocator::new(&topo);

        assert!(matches!(
            allocator.allocate(0, 64, Placement::FirstTouch),
            Err(NumaError::AllocationFailed(_))
        ));
    }

    #[test]
    fn test_allocate_bad_alignment_rejected() {
        let topo = NumaTopology::detect();
        let allocator = NumaAllocator::new(&topo);

        assert!(matches!(
            allocator.allocate(4096, 48, Placement::FirstTouch),
            Err(NumaError::InvalidAlignment(48))
        ));
    }

    #[test]
    fn test_allocate_invalid_node() {
        let topo = NumaTopology::detect();
        let allocator = NumaAllocator::new(&topo);

        let result = allocator.allocate(4096, 64, Placement::Node(999));
        assert!(matches!(result, Err(NumaError::InvalidNode { node: 999, .. })));
    }

    #[test]
    fn test_allocate_with_placements() {
        let topo = NumaTopology::detect();
        let allocator = NumaAllocator::new(&topo).with_huge_pages(true);

        for placement in [Placement::Node(0), Placement::Interleaved] {
            let mut region = allocator.allocate(64 * 1024, 64, placement).unwrap();
            assert_eq!(region.placement(), placement);
            region.as_mut_slice()[0] = 42;
            assert_eq!(region.as_slice()[0], 42);
        }
    }

    #[test]
    fn test_nodemask_spans_words() {
        assert_eq!(nodemask([0]), vec![1]);
        assert_eq!(nodemask([63]), vec![1 << 63]);
        assert_eq!(nodemask([64]), vec![0, 1]);
        assert_eq!(nodemask([1, 130]), vec![0b10, 0, 1 << 2]);
        assert_eq!(nodemask(0..66), vec![u64::MAX, 0b11]);
        assert!(nodemask(std::iter::empty()).is_empty());
    }

    #[test]
    fn test_allocate_last_node() {
        let topo = NumaTopology::detect();
        let allocator = NumaAllocator::new(&topo);
        let last = topo.num_nodes() - 1;

        let mut region = allocator
            .allocate(16 * 1024, 64, Placement::Node(last))
            .unwrap();
        region.as_mut_slice().fill(7);
        assert_eq!(region.placement(), Placement::Node(last));
        assert!(region.as_slice().iter().all(|&b| b == 7));
    }
}
