//! # Probe Error Types
//!
//! Every variant is fatal for a run: nothing here is retried, and no
//! telemetry record is emitted once one has been raised.

use crate::numa::{CpuSet, NumaError};
use crate::telemetry::SinkError;

/// Errors raised by a probe run.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// A buffer could not be allocated
    #[error("unable to allocate {size} bytes (alignment {align}): {source}")]
    Allocation {
        /// Requested size in bytes
        size: usize,
        /// Requested alignment in bytes
        align: usize,
        /// Underlying allocator error
        #[source]
        source: NumaError,
    },

    /// The topology could not report node placement for a region
    #[error("failed to retrieve memory binding for address {address:#x} ({size} bytes): {source}")]
    LocalityQuery {
        /// Region start address
        address: usize,
        /// Region length in bytes
        size: usize,
        /// Underlying topology error (carries the errno)
        #[source]
        source: NumaError,
    },

    /// The calling thread's CPU location could not be read
    #[error("failed to get the calling thread's CPU location: {0}")]
    CpuLocation(#[source] NumaError),

    /// No core object encloses the thread's CPU binding
    #[error("failed to get core object for CPU set [{cpus}]")]
    CoreResolution {
        /// CPU binding that could not be resolved
        cpus: CpuSet,
    },

    /// The OS scheduling-statistics source is missing or unreadable
    #[error("scheduling statistics unavailable: {0}")]
    SchedulingStatsUnavailable(String),

    /// A streamed round trip did not reproduce its source
    #[error(
        "data mismatch after read-back at offset {offset}: expected {expected:#04x}, found {actual:#04x}"
    )]
    DataIntegrity {
        /// First differing byte offset
        offset: usize,
        /// Source byte
        expected: u8,
        /// Read-back byte
        actual: u8,
    },

    /// Configuration rejected before any allocation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The telemetry sink refused the record
    #[error("telemetry sink error: {0}")]
    Telemetry(#[from] SinkError),
}

impl ProbeError {
    /// Process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        1
    }

    /// `true` for failures caused by the environment rather than by the
    /// measured memory path.
    #[must_use]
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            Self::LocalityQuery { .. }
                | Self::CpuLocation(_)
                | Self::CoreResolution { .. }
                | Self::SchedulingStatsUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locality_message_has_address_and_errno() {
        let err = ProbeError::LocalityQuery {
            address: 0x7f00_0000_1000,
            size: 4096,
            source: NumaError::SyscallFailed(std::io::Error::from_raw_os_error(libc::EFAULT)),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x7f0000001000"));
        assert!(msg.contains("4096 bytes"));
        assert!(err.is_environmental());
    }

    #[test]
    fn test_integrity_message() {
        let err = ProbeError::DataIntegrity {
            offset: 17,
            expected: 0xAA,
            actual: 0x00,
        };
        assert_eq!(
            err.to_string(),
            "data mismatch after read-back at offset 17: expected 0xaa, found 0x00"
        );
        assert_eq!(err.exit_code(), 1);
        assert!(!err.is_environmental());
    }

    #[test]
    fn test_core_resolution_lists_cpus() {
        let err = ProbeError::CoreResolution {
            cpus: [2, 3].into_iter().collect(),
        };
        assert_eq!(err.to_string(), "failed to get core object for CPU set [2,3]");
    }
}
