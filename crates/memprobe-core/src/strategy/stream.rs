//! Fixed-stride non-temporal stores and touch-and-flush reads.

use std::hint::black_box;

use super::barrier::{self, CACHE_LINE};

/// Store granularity of [`stream_fill`].
pub const WRITE_STRIDE: usize = 8;

/// Read granularity of [`touch_and_flush`]: one byte per cache line.
pub const READ_STRIDE: usize = CACHE_LINE;

/// Broadcasts a byte into all eight bytes of a word.
#[must_use]
pub const fn broadcast(value: u8) -> u64 {
    value as u64 * 0x0101_0101_0101_0101
}

/// Fills `buf` with `value` using 8-byte non-temporal stores.
///
/// Bytes before the first 8-byte boundary and after the last one are
/// written with ordinary stores. Post-condition: a store fence has retired
/// every streaming store.
#[allow(unsafe_code)]
pub fn stream_fill(buf: &mut [u8], value: u8) {
    let pattern = broadcast(value);

    // SAFETY: every bit pattern is a valid u64
    let (head, words, tail) = unsafe { buf.align_to_mut::<u64>() };
    head.fill(value);
    for word in words {
        stream_store_u64(word, pattern);
    }
    tail.fill(value);

    barrier::store_fence();
}

#[inline]
#[allow(unsafe_code)]
fn stream_store_u64(dst: &mut u64, value: u64) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: `dst` is a valid, 8-byte aligned u64; movnti is SSE2 (baseline)
    unsafe {
        std::arch::x86_64::_mm_stream_si64(
            std::ptr::from_mut(dst).cast::<i64>(),
            i64::from_ne_bytes(value.to_ne_bytes()),
        );
    }

    #[cfg(not(target_arch = "x86_64"))]
    // SAFETY: `dst` is a valid, aligned u64
    unsafe {
        std::ptr::write_volatile(dst, value);
    }
}

/// Touches one byte per cache line with a volatile load and flushes that
/// line straight after. Returns the number of lines touched.
///
/// No trailing fence: each line is flushed independently.
#[allow(unsafe_code)]
pub fn touch_and_flush(buf: &[u8]) -> usize {
    let mut lines = 0;
    for offset in (0..buf.len()).step_by(READ_STRIDE) {
        let byte = &buf[offset];
        // SAFETY: `byte` is a valid reference into `buf`
        black_box(unsafe { std::ptr::read_volatile(byte) });
        barrier::flush_line(byte);
        lines += 1;
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast() {
        assert_eq!(broadcast(0x00), 0);
        assert_eq!(broadcast(0xAB), 0xABAB_ABAB_ABAB_ABAB);
        assert_eq!(broadcast(0x01).to_ne_bytes(), [1; 8]);
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_stream_fill_broadcasts_every_word() {
        let mut buf = vec![0u64; 512]; // 4 KiB, 8-byte aligned
        // SAFETY: u64 -> u8 reinterpretation of an owned buffer
        let bytes = unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<u8>(), 4096) };
        stream_fill(bytes, 0x3C);
        assert!(buf.iter().all(|&w| w == broadcast(0x3C)));
    }

    #[test]
    fn test_stream_fill_unaligned_edges() {
        let mut buf = vec![0u8; 4096 + 11];
        stream_fill(&mut buf[3..], 0xEE);
        assert_eq!(buf[..3], [0, 0, 0]);
        assert!(buf[3..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_touch_and_flush_counts_lines() {
        let buf = vec![1u8; 4096];
        assert_eq!(touch_and_flush(&buf), 64);
        assert_eq!(touch_and_flush(&buf[..65]), 2);
        assert_eq!(touch_and_flush(&[]), 0);
    }
}
