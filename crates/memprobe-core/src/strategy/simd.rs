//! Width-adaptive streaming copies.
//!
//! Stores go through `vmovntdq`/`movntdq`, loads through
//! `vmovntdqa`/`movntdqa`, using the widest vector the CPU supports.
//! Any tail shorter than one vector (and any unaligned head) is copied
//! byte by byte.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::barrier;
use crate::ProbeError;

/// Vector width used by the adaptive streaming strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimdWidth {
    /// Plain byte copies, no streaming instructions
    Scalar,
    /// 128-bit SSE (stream loads need SSE4.1)
    W128,
    /// 256-bit AVX2
    W256,
    /// 512-bit AVX-512F
    W512,
}

impl SimdWidth {
    /// Widest width supported by the running CPU.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx512f") {
                return Self::W512;
            }
            if std::arch::is_x86_feature_detected!("avx2") {
                return Self::W256;
            }
            if std::arch::is_x86_feature_detected!("sse4.1") {
                return Self::W128;
            }
        }

        Self::Scalar
    }

    /// Returns `true` if the running CPU can execute this width.
    #[must_use]
    pub fn is_supported(self) -> bool {
        self <= Self::detect()
    }

    /// Vector size in bytes (1 for scalar).
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::W128 => 16,
            Self::W256 => 32,
            Self::W512 => 64,
        }
    }
}

impl fmt::Display for SimdWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::W128 => write!(f, "128"),
            Self::W256 => write!(f, "256"),
            Self::W512 => write!(f, "512"),
        }
    }
}

impl FromStr for SimdWidth {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scalar" | "none" | "8" => Ok(Self::Scalar),
            "128" | "sse" => Ok(Self::W128),
            "256" | "avx2" => Ok(Self::W256),
            "512" | "avx512" => Ok(Self::W512),
            other => Err(ProbeError::InvalidConfig(format!(
                "unknown SIMD width '{other}' (expected 512, 256, 128 or scalar)"
            ))),
        }
    }
}

/// Copies `src` into `dst` with streaming (cache-bypassing) stores.
///
/// `width` is capped at what the CPU supports. Post-condition: a store
/// fence has retired every streaming store.
///
/// # Panics
///
/// Panics if the slices differ in length.
#[allow(unsafe_code)]
pub fn stream_store_copy(dst: &mut [u8], src: &[u8], width: SimdWidth) {
    assert_eq!(dst.len(), src.len(), "streaming copy needs equal lengths");
    let width = width.min(SimdWidth::detect());
    let len = dst.len();

    // Non-temporal stores need an aligned destination
    let head = if width == SimdWidth::Scalar {
        len
    } else {
        dst.as_ptr().align_offset(width.bytes()).min(len)
    };
    dst[..head].copy_from_slice(&src[..head]);

    let body = &mut dst[head..];
    let body_src = &src[head..];
    let done = match width {
        SimdWidth::Scalar => 0,
        #[cfg(target_arch = "x86_64")]
        // SAFETY: the width is supported (capped above), `body` is aligned to
        // the vector size, and both slices hold `body.len()` bytes.
        SimdWidth::W512 => unsafe { x86::store_512(body.as_mut_ptr(), body_src.as_ptr(), body.len()) },
        #[cfg(target_arch = "x86_64")]
        // SAFETY: as above
        SimdWidth::W256 => unsafe { x86::store_256(body.as_mut_ptr(), body_src.as_ptr(), body.len()) },
        #[cfg(target_arch = "x86_64")]
        // SAFETY: as above
        SimdWidth::W128 => unsafe { x86::store_128(body.as_mut_ptr(), body_src.as_ptr(), body.len()) },
        #[cfg(not(target_arch = "x86_64"))]
        _ => 0,
    };
    body[done..].copy_from_slice(&body_src[done..]);

    barrier::store_fence();
}

/// Copies `src` into `dst` with streaming (non-temporal) loads.
///
/// `width` is capped at what the CPU supports. Post-condition: a load
/// fence has retired every streaming load.
///
/// # Panics
///
/// Panics if the slices differ in length.
#[allow(unsafe_code)]
pub fn stream_load_copy(dst: &mut [u8], src: &[u8], width: SimdWidth) {
    assert_eq!(dst.len(), src.len(), "streaming copy needs equal lengths");
    let width = width.min(SimdWidth::detect());
    let len = src.len();

    // Streaming loads need an aligned source
    let head = if width == SimdWidth::Scalar {
        len
    } else {
        src.as_ptr().align_offset(width.bytes()).min(len)
    };
    dst[..head].copy_from_slice(&src[..head]);

    let body = &mut dst[head..];
    let body_src = &src[head..];
    let done = match width {
        SimdWidth::Scalar => 0,
        #[cfg(target_arch = "x86_64")]
        // SAFETY: the width is supported (capped above), `body_src` is aligned
        // to the vector size, and both slices hold `body.len()` bytes.
        SimdWidth::W512 => unsafe { x86::load_512(body.as_mut_ptr(), body_src.as_ptr(), body.len()) },
        #[cfg(target_arch = "x86_64")]
        // SAFETY: as above
        SimdWidth::W256 => unsafe { x86::load_256(body.as_mut_ptr(), body_src.as_ptr(), body.len()) },
        #[cfg(target_arch = "x86_64")]
        // SAFETY: as above
        SimdWidth::W128 => unsafe { x86::load_128(body.as_mut_ptr(), body_src.as_ptr(), body.len()) },
        #[cfg(not(target_arch = "x86_64"))]
        _ => 0,
    };
    body[done..].copy_from_slice(&body_src[done..]);

    barrier::load_fence();
}

/// Vector kernels. Each returns the number of bytes it processed, always a
/// multiple of its vector size; the caller copies the rest.
#[cfg(target_arch = "x86_64")]
#[allow(unsafe_code)]
mod x86 {
    use std::arch::x86_64::{
        _mm256_loadu_si256, _mm256_storeu_si256, _mm256_stream_load_si256, _mm256_stream_si256,
        _mm512_loadu_si512, _mm512_storeu_si512, _mm512_stream_load_si512, _mm512_stream_si512,
        _mm_loadu_si128, _mm_storeu_si128, _mm_stream_load_si128, _mm_stream_si128,
    };

    #[target_feature(enable = "avx512f")]
    pub(super) unsafe fn store_512(dst: *mut u8, src: *const u8, len: usize) -> usize {
        let mut i = 0;
        while i + 64 <= len {
            let v = _mm512_loadu_si512(src.add(i).cast());
            _mm512_stream_si512(dst.add(i).cast(), v);
            i += 64;
        }
        i
    }

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn store_256(dst: *mut u8, src: *const u8, len: usize) -> usize {
        let mut i = 0;
        while i + 32 <= len {
            let v = _mm256_loadu_si256(src.add(i).cast());
            _mm256_stream_si256(dst.add(i).cast(), v);
            i += 32;
        }
        i
    }

    #[target_feature(enable = "sse4.1")]
    pub(super) unsafe fn store_128(dst: *mut u8, src: *const u8, len: usize) -> usize {
        let mut i = 0;
        while i + 16 <= len {
            let v = _mm_loadu_si128(src.add(i).cast());
            _mm_stream_si128(dst.add(i).cast(), v);
            i += 16;
        }
        i
    }

    #[target_feature(enable = "avx512f")]
    pub(super) unsafe fn load_512(dst: *mut u8, src: *const u8, len: usize) -> usize {
        let mut i = 0;
        while i + 64 <= len {
            let v = _mm512_stream_load_si512(src.add(i).cast());
            _mm512_storeu_si512(dst.add(i).cast(), v);
            i += 64;
        }
        i
    }

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn load_256(dst: *mut u8, src: *const u8, len: usize) -> usize {
        let mut i = 0;
        while i + 32 <= len {
            let v = _mm256_stream_load_si256(src.add(i).cast());
            _mm256_storeu_si256(dst.add(i).cast(), v);
            i += 32;
        }
        i
    }

    #[target_feature(enable = "sse4.1")]
    pub(super) unsafe fn load_128(dst: *mut u8, src: *const u8, len: usize) -> usize {
        let mut i = 0;
        while i + 16 <= len {
            let v = _mm_stream_load_si128(src.add(i).cast());
            _mm_storeu_si128(dst.add(i).cast(), v);
            i += 16;
        }
        i
    }
}
