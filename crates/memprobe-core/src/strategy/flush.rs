//! Cached write, explicit flush, byte-wise read.

use std::hint::black_box;

use super::barrier;

/// Fills `buf` with `value` through the cache, then evicts every line.
///
/// Post-condition: the fill is globally visible and no line of `buf` is
/// resident in any cache level (fill, `mfence`, per-line `clflush`, `mfence`).
pub fn fill_and_flush(buf: &mut [u8], value: u8) {
    buf.fill(value);
    barrier::full_fence();
    barrier::flush_range(buf);
    barrier::full_fence();
}

/// Reads every byte of `buf` in order and returns their wrapping sum.
///
/// The sum is a diagnostic that keeps the reads from being elided; it is
/// not checked against anything.
#[must_use]
pub fn checksum(buf: &[u8]) -> u64 {
    let mut sum = 0u64;
    for &byte in black_box(buf) {
        sum = sum.wrapping_add(u64::from(byte));
    }
    black_box(sum)
}
