//! # Memory Access Strategies
//!
//! Three ways of pushing a region through the memory hierarchy, selected
//! at configuration time:
//!
//! | Strategy | Write | Read |
//! |----------|-------|------|
//! | [`StrategyKind::FlushBased`] | cached fill, `mfence`, `clflush` per line, `mfence` | byte-wise checksum |
//! | [`StrategyKind::StreamingFixedStride`] | 8-byte `movnti`, `sfence` | volatile touch + `clflush` every 64 bytes |
//! | [`StrategyKind::StreamingAdaptiveWidth`] | widest streaming store from a source buffer, `sfence` | widest streaming load into a read-back buffer, `lfence` |
//!
//! Fence placement is part of each operation's contract: when `write` or
//! `read` returns, the fence listed above has retired, so any locality or
//! scheduling query that follows observes post-fence state.

pub mod barrier;
pub mod flush;
pub mod simd;
pub mod stream;

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use simd::SimdWidth;

use crate::numa::{MemoryRegion, NumaAllocator, Placement, TopologyService};
use crate::{ProbeError, Result};

/// Strategy selector, without parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Cached write, explicit flush, byte-wise read
    #[default]
    FlushBased,
    /// 8-byte non-temporal stores, touch-and-flush reads
    StreamingFixedStride,
    /// Widest SIMD streaming stores and loads with a verified round trip
    StreamingAdaptiveWidth,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlushBased => write!(f, "flush"),
            Self::StreamingFixedStride => write!(f, "stream"),
            Self::StreamingAdaptiveWidth => write!(f, "simd"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = ProbeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flush" | "flush_based" => Ok(Self::FlushBased),
            "stream" | "streaming" | "streaming_fixed_stride" => Ok(Self::StreamingFixedStride),
            "simd" | "adaptive" | "streaming_adaptive_width" => Ok(Self::StreamingAdaptiveWidth),
            other => Err(ProbeError::InvalidConfig(format!(
                "unknown strategy '{other}' (expected flush, stream or simd)"
            ))),
        }
    }
}

/// A fully parameterised access strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStrategy {
    /// Fill with `fill` through the cache, then flush every line.
    FlushBased {
        /// Byte written over the whole region
        fill: u8,
    },
    /// Broadcast `fill` into 64-bit words and stream them out.
    StreamingFixedStride {
        /// Byte broadcast into every 8-byte word
        fill: u8,
    },
    /// Copy a source buffer in and back out with streaming instructions.
    StreamingAdaptiveWidth {
        /// Upper bound on the vector width; capped at what the CPU supports
        width: SimdWidth,
    },
}

impl AccessStrategy {
    /// Parameter-free selector for this strategy.
    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::FlushBased { .. } => StrategyKind::FlushBased,
            Self::StreamingFixedStride { .. } => StrategyKind::StreamingFixedStride,
            Self::StreamingAdaptiveWidth { .. } => StrategyKind::StreamingAdaptiveWidth,
        }
    }

    /// Alignment the target region must satisfy.
    #[must_use]
    pub fn required_alignment(&self) -> usize {
        match self {
            Self::FlushBased { .. } => 1,
            Self::StreamingFixedStride { .. } | Self::StreamingAdaptiveWidth { .. } => {
                barrier::CACHE_LINE
            }
        }
    }

    /// Allocates the auxiliary buffers this strategy needs.
    ///
    /// Only the adaptive strategy stages anything: a source buffer of `size`
    /// bytes filled with `source_byte`, and an equally sized read-back buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Allocation`] if either buffer cannot be mapped.
    pub fn prepare<T: TopologyService + ?Sized>(
        &self,
        allocator: &NumaAllocator<'_, T>,
        size: usize,
        source_byte: u8,
    ) -> Result<Staging> {
        if !matches!(self, Self::StreamingAdaptiveWidth { .. }) {
            return Ok(Staging::Empty);
        }

        let align = self.required_alignment();
        let allocate = |size| {
            allocator
                .allocate(size, align, Placement::FirstTouch)
                .map_err(|source| ProbeError::Allocation {
                    size,
                    align,
                    source,
                })
        };

        let mut source = allocate(size)?;
        source.as_mut_slice().fill(source_byte);
        let readback = allocate(size)?;
        debug!(size, source_byte, "staged round-trip buffers");

        Ok(Staging::RoundTrip { source, readback })
    }

    /// Runs the write phase over `region` and times it.
    ///
    /// The timing brackets exactly the fenced write sequence.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidConfig`] if `staging` does not match this
    /// strategy or the region size.
    pub fn write(&self, region: &mut MemoryRegion, staging: &Staging) -> Result<PhaseReport> {
        let buf = region.as_mut_slice();
        let elapsed = match *self {
            Self::FlushBased { fill } => timed(|| flush::fill_and_flush(buf, fill)),
            Self::StreamingFixedStride { fill } => timed(|| stream::stream_fill(buf, fill)),
            Self::StreamingAdaptiveWidth { width } => {
                let (source, _) = staging.round_trip(buf.len())?;
                timed(|| simd::stream_store_copy(buf, source.as_slice(), width))
            }
        };

        Ok(PhaseReport {
            elapsed,
            checksum: None,
        })
    }

    /// Runs the read phase over `region` and times it.
    ///
    /// Only [`AccessStrategy::FlushBased`] produces a checksum.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidConfig`] if `staging` does not match this
    /// strategy or the region size.
    pub fn read(&self, region: &MemoryRegion, staging: &mut Staging) -> Result<PhaseReport> {
        let buf = region.as_slice();
        let mut checksum = None;
        let elapsed = match *self {
            Self::FlushBased { .. } => timed(|| checksum = Some(flush::checksum(buf))),
            Self::StreamingFixedStride { .. } => timed(|| {
                stream::touch_and_flush(buf);
            }),
            Self::StreamingAdaptiveWidth { width } => {
                let (_, readback) = staging.round_trip_mut(buf.len())?;
                timed(|| simd::stream_load_copy(readback.as_mut_slice(), buf, width))
            }
        };

        Ok(PhaseReport { elapsed, checksum })
    }
}

fn timed(op: impl FnOnce()) -> Duration {
    let start = Instant::now();
    op();
    start.elapsed()
}

/// Timing (and optional checksum) of one phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseReport {
    /// Wall-clock time of the fenced operation
    pub elapsed: Duration,
    /// Diagnostic byte sum, flush-based reads only
    pub checksum: Option<u64>,
}

impl PhaseReport {
    /// Elapsed time in microseconds.
    #[must_use]
    pub fn micros(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1_000_000.0
    }
}

/// Auxiliary buffers owned for the length of one run.
#[derive(Debug)]
pub enum Staging {
    /// Nothing staged
    Empty,
    /// Source and read-back buffers of the adaptive strategy
    RoundTrip {
        /// Bytes streamed into the region
        source: MemoryRegion,
        /// Bytes streamed back out of the region
        readback: MemoryRegion,
    },
}

impl Staging {
    fn round_trip(&self, len: usize) -> Result<(&MemoryRegion, &MemoryRegion)> {
        match self {
            Self::RoundTrip { source, readback } if source.len() == len && readback.len() == len => {
                Ok((source, readback))
            }
            _ => Err(staging_mismatch(len)),
        }
    }

    fn round_trip_mut(&mut self, len: usize) -> Result<(&MemoryRegion, &mut MemoryRegion)> {
        match self {
            Self::RoundTrip { source, readback } if source.len() == len && readback.len() == len => {
                Ok((&*source, readback))
            }
            _ => Err(staging_mismatch(len)),
        }
    }

    /// Compares the read-back buffer against its source.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::DataIntegrity`] at the first differing byte.
    pub fn verify(&self) -> Result<Verification> {
        match self {
            Self::Empty => Ok(Verification::Skipped),
            Self::RoundTrip { source, readback } => {
                verify_round_trip(source.as_slice(), readback.as_slice())?;
                Ok(Verification::Passed)
            }
        }
    }
}

fn staging_mismatch(len: usize) -> ProbeError {
    ProbeError::InvalidConfig(format!(
        "round-trip buffers missing or not sized for a {len}-byte region"
    ))
}

/// Outcome of the read-back comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    /// The strategy has no round trip to check
    Skipped,
    /// Every byte matched
    Passed,
}

/// Byte-compares `readback` against `source`.
///
/// # Errors
///
/// Returns [`ProbeError::DataIntegrity`] naming the first mismatching offset.
/// A length difference is reported at the end of the shorter buffer.
pub fn verify_round_trip(source: &[u8], readback: &[u8]) -> Result<()> {
    if let Some(offset) = source.iter().zip(readback).position(|(a, b)| a != b) {
        return Err(ProbeError::DataIntegrity {
            offset,
            expected: source[offset],
            actual: readback[offset],
        });
    }
    if source.len() != readback.len() {
        let offset = source.len().min(readback.len());
        return Err(ProbeError::DataIntegrity {
            offset,
            expected: source.get(offset).copied().unwrap_or_default(),
            actual: readback.get(offset).copied().unwrap_or_default(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::NumaTopology;

    const SIZE: usize = 16 * 1024;

    fn run(strategy: AccessStrategy) -> (MemoryRegion, Staging, PhaseReport, PhaseReport) {
        let topo = NumaTopology::detect();
        let allocator = NumaAllocator::new(&topo);
        let mut region = allocator
            .allocate(SIZE, strategy.required_alignment(), Placement::FirstTouch)
            .unwrap();
        let mut staging = strategy.prepare(&allocator, SIZE, 0xAA).unwrap();

        let write = strategy.write(&mut region, &staging).unwrap();
        let read = strategy.read(&region, &mut staging).unwrap();
        (region, staging, write, read)
    }

    #[test]
    fn test_flush_based_round_trip_and_checksum() {
        let (region, staging, write, read) = run(AccessStrategy::FlushBased { fill: 3 });
        assert!(region.as_slice().iter().all(|&b| b == 3));
        assert_eq!(read.checksum, Some(3 * SIZE as u64));
        assert!(write.checksum.is_none());
        assert!(write.micros() >= 0.0);
        assert_eq!(staging.verify().unwrap(), Verification::Skipped);
    }

    #[test]
    fn test_fixed_stride_broadcast() {
        let (region, _, _, read) = run(AccessStrategy::StreamingFixedStride { fill: 0x81 });
        assert!(region.as_slice().iter().all(|&b| b == 0x81));
        assert!(read.checksum.is_none());
    }

    #[test]
    fn test_adaptive_round_trip_passes() {
        let (region, staging, _, _) = run(AccessStrategy::StreamingAdaptiveWidth {
            width: SimdWidth::detect(),
        });
        assert!(region.as_slice().iter().all(|&b| b == 0xAA));
        assert_eq!(staging.verify().unwrap(), Verification::Passed);
    }

    #[test]
    fn test_adaptive_detects_corruption_between_phases() {
        let strategy = AccessStrategy::StreamingAdaptiveWidth {
            width: SimdWidth::detect(),
        };
        let topo = NumaTopology::detect();
        let allocator = NumaAllocator::new(&topo);
        let mut region = allocator.allocate(SIZE, 64, Placement::FirstTouch).unwrap();
        let mut staging = strategy.prepare(&allocator, SIZE, 0xAA).unwrap();

        strategy.write(&mut region, &staging).unwrap();
        region.as_mut_slice()[100] = 0x00;
        strategy.read(&region, &mut staging).unwrap();

        match staging.verify() {
            Err(ProbeError::DataIntegrity {
                offset,
                expected,
                actual,
            }) => {
                assert_eq!(offset, 100);
                assert_eq!(expected, 0xAA);
                assert_eq!(actual, 0x00);
            }
            other => panic!("expected DataIntegrity, got {other:?}"),
        }
    }

    #[test]
    fn test_adaptive_without_staging_is_rejected() {
        let strategy = AccessStrategy::StreamingAdaptiveWidth {
            width: SimdWidth::Scalar,
        };
        let topo = NumaTopology::detect();
        let allocator = NumaAllocator::new(&topo);
        let mut region = allocator.allocate(4096, 64, Placement::FirstTouch).unwrap();

        let err = strategy.write(&mut region, &Staging::Empty).unwrap_err();
        assert!(matches!(err, ProbeError::InvalidConfig(_)));
    }

    #[test]
    fn test_verify_round_trip_length_mismatch() {
        assert!(verify_round_trip(&[1, 2, 3], &[1, 2, 3]).is_ok());
        let err = verify_round_trip(&[1, 2, 3], &[1, 2]).unwrap_err();
        assert!(matches!(err, ProbeError::DataIntegrity { offset: 2, expected: 3, actual: 0 }));
    }

    #[test]
    fn test_kind_parse_and_alignment() {
        assert_eq!("flush".parse::<StrategyKind>().unwrap(), StrategyKind::FlushBased);
        assert_eq!("SIMD".parse::<StrategyKind>().unwrap(), StrategyKind::StreamingAdaptiveWidth);
        assert!("random".parse::<StrategyKind>().is_err());
        assert_eq!(StrategyKind::StreamingFixedStride.to_string(), "stream");

        assert_eq!(AccessStrategy::FlushBased { fill: 0 }.required_alignment(), 1);
        assert_eq!(AccessStrategy::StreamingFixedStride { fill: 0 }.required_alignment(), 64);
        assert_eq!(
            AccessStrategy::StreamingAdaptiveWidth { width: SimdWidth::W128 }.kind(),
            StrategyKind::StreamingAdaptiveWidth
        );
    }
}
