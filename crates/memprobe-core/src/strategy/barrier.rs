//! Fences and cache-line flushes.
//!
//! On x86-64 these map to `sfence`, `lfence`, `mfence` and `clflush`.
//! Other targets get the closest portable ordering (a sequentially
//! consistent fence) and no flush, which keeps the crate building but
//! makes the cache-bypass properties x86-64 only.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{_mm_clflush, _mm_lfence, _mm_mfence, _mm_sfence};

/// Cache line size assumed by every strategy.
pub const CACHE_LINE: usize = 64;

/// Orders all preceding stores, including non-temporal ones, before any
/// later store.
#[inline]
#[allow(unsafe_code)]
pub fn store_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: SSE is part of the x86-64 baseline
    unsafe {
        _mm_sfence();
    }

    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Orders all preceding loads, including streaming loads, before any
/// later load.
#[inline]
#[allow(unsafe_code)]
pub fn load_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: SSE2 is part of the x86-64 baseline
    unsafe {
        _mm_lfence();
    }

    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Full load/store fence.
#[inline]
#[allow(unsafe_code)]
pub fn full_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: SSE2 is part of the x86-64 baseline
    unsafe {
        _mm_mfence();
    }

    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Evicts the cache line containing `line` from every cache level.
#[inline]
#[allow(unsafe_code)]
pub fn flush_line(line: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: clflush never faults on a mapped address and callers only pass
    // addresses inside a live slice.
    unsafe {
        _mm_clflush(line);
    }

    #[cfg(not(target_arch = "x86_64"))]
    let _ = line;
}

/// Flushes every cache line that overlaps `buf`.
///
/// Not ordered on its own; bracket with [`full_fence`] where ordering matters.
pub fn flush_range(buf: &[u8]) {
    if buf.is_empty() {
        return;
    }
    let base = buf.as_ptr();
    let misalign = base as usize % CACHE_LINE;

    // Step from the line boundary at or before `base`; every probe address
    // is clamped into the slice so only our own bytes are named.
    let mut offset = 0usize;
    while offset < buf.len() + misalign {
        let index = offset.saturating_sub(misalign).min(buf.len() - 1);
        flush_line(buf[index..].as_ptr());
        offset += CACHE_LINE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fences_do_not_disturb_data() {
        let mut buf = vec![0u8; 1024];
        buf.fill(7);
        full_fence();
        flush_range(&buf);
        full_fence();
        store_fence();
        load_fence();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_flush_range_handles_unaligned_and_tiny_slices() {
        let buf = vec![3u8; 300];
        flush_range(&buf[1..]);
        flush_range(&buf[63..65]);
        flush_range(&buf[..1]);
        flush_range(&[]);
        assert_eq!(buf[299], 3);
    }
}
