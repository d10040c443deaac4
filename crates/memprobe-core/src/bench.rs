//! # Benchmark Orchestrator
//!
//! Runs one probe from allocation to teardown:
//!
//! ```text
//! Init → Allocate → WritePhase → CaptureWriteLocality → ReadPhase
//!      → ReadbackVerify → CaptureReadLocality → CaptureScheduling → Emit → Teardown
//! ```
//!
//! The sequence is linear; any error aborts the run before `Emit`, so a
//! sink only ever sees complete records. The region, staging buffers and
//! topology are owned values and are released on every exit path when they
//! go out of scope.

use std::fmt;

use serde::Serialize;
use tracing::{debug, error, info, info_span};

use crate::config::ProbeConfig;
use crate::locality::{self, NumaNodeSet};
use crate::numa::{NumaAllocator, NumaTopology, TopologyService};
use crate::sched::{self, ThreadLocalitySnapshot};
use crate::strategy::{StrategyKind, Verification};
use crate::telemetry::TelemetrySink;
use crate::{ProbeError, Result};

/// The single record produced by a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkResult {
    /// Strategy that produced this record
    pub strategy: StrategyKind,
    /// Thread state after the read phase
    #[serde(flatten)]
    pub thread: ThreadLocalitySnapshot,
    /// Byte sum from the read phase (flush-based only); diagnostic, unchecked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u64>,
    /// Read-back comparison outcome
    pub verification: Verification,
    /// Nodes backing the region after the write phase
    pub numa_write_nodes: NumaNodeSet,
    /// Nodes backing the region after the read phase
    pub numa_read_nodes: NumaNodeSet,
    /// Write phase duration
    pub write_time_us: f64,
    /// Read phase duration
    pub read_time_us: f64,
    /// Region size
    pub payload_bytes: u64,
}

impl fmt::Display for BenchmarkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.thread;
        write!(
            f,
            "numa_id: {}, core_id: {}, vcs: {}, ics: {}, mig: {}, ",
            t.numa_id, t.core_id, t.voluntary_switches, t.involuntary_switches, t.core_migrations
        )?;
        if let Some(checksum) = self.checksum {
            write!(f, "checksum: {checksum}, ")?;
        }
        write!(
            f,
            "numa_write: [{}], numa_read: [{}], write_time_us: {:.6}, read_time_us: {:.6}, payload: {}.",
            self.numa_write_nodes,
            self.numa_read_nodes,
            self.write_time_us,
            self.read_time_us,
            self.payload_bytes
        )
    }
}

/// Orchestrator state, used to report where a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Configuration check
    Init,
    /// Region and staging allocation
    Allocate,
    /// Strategy write phase
    WritePhase,
    /// Locality query after the write phase
    CaptureWriteLocality,
    /// Strategy read phase
    ReadPhase,
    /// Read-back comparison
    ReadbackVerify,
    /// Locality query after the read phase
    CaptureReadLocality,
    /// Thread scheduling snapshot
    CaptureScheduling,
    /// Hand-off to the telemetry sink
    Emit,
    /// Buffer release
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Allocate => "allocate",
            Self::WritePhase => "write_phase",
            Self::CaptureWriteLocality => "capture_write_locality",
            Self::ReadPhase => "read_phase",
            Self::ReadbackVerify => "readback_verify",
            Self::CaptureReadLocality => "capture_read_locality",
            Self::CaptureScheduling => "capture_scheduling",
            Self::Emit => "emit",
            Self::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// A configured probe bound to a topology.
#[derive(Debug)]
pub struct Benchmark<T: TopologyService = NumaTopology> {
    config: ProbeConfig,
    topology: T,
}

impl Benchmark<NumaTopology> {
    /// Validates `config` and detects the machine topology.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidConfig`] if the configuration is invalid.
    pub fn detect(config: ProbeConfig) -> Result<Self> {
        config.validate()?;
        let topology = NumaTopology::detect();
        topology.log_topology();
        Ok(Self { config, topology })
    }
}

impl<T: TopologyService> Benchmark<T> {
    /// Validates `config` and binds it to an existing topology.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidConfig`] if the configuration is invalid.
    pub fn with_topology(config: ProbeConfig, topology: T) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, topology })
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// The topology queried by the run.
    #[must_use]
    pub fn topology(&self) -> &T {
        &self.topology
    }

    /// Executes one run and emits its record to `sink`.
    ///
    /// The returned record is the one handed to the sink.
    ///
    /// # Errors
    ///
    /// Returns the first failure; nothing is emitted in that case.
    pub fn run(&self, sink: &mut dyn TelemetrySink) -> Result<BenchmarkResult> {
        let span = info_span!(
            "probe_run",
            strategy = %self.config.strategy,
            payload_bytes = self.config.payload_bytes
        );
        let _guard = span.enter();

        let mut stage = Stage::Init;
        let result = self.execute(sink, &mut stage);
        if let Err(e) = &result {
            error!(%stage, error = %e, "probe run failed");
        }
        result
    }

    fn execute(&self, sink: &mut dyn TelemetrySink, stage: &mut Stage) -> Result<BenchmarkResult> {
        self.config.validate()?;
        let strategy = self.config.access_strategy();

        *stage = Stage::Allocate;
        let size = self.config.payload_bytes;
        let align = strategy.required_alignment();
        let allocator = NumaAllocator::new(&self.topology).with_huge_pages(self.config.huge_pages);
        let mut region = allocator
            .allocate(size, align, self.config.placement)
            .map_err(|source| ProbeError::Allocation {
                size,
                align,
                source,
            })?;
        let mut staging = strategy.prepare(&allocator, size, self.config.source_byte)?;
        debug!(size, align, placement = ?self.config.placement, "allocated region");

        *stage = Stage::WritePhase;
        let write = strategy.write(&mut region, &staging)?;
        debug!(write_time_us = write.micros(), "write phase complete");

        *stage = Stage::CaptureWriteLocality;
        let numa_write_nodes = locality::resolve(&self.topology, &region)?;

        *stage = Stage::ReadPhase;
        let read = strategy.read(&region, &mut staging)?;
        debug!(read_time_us = read.micros(), "read phase complete");

        *stage = Stage::ReadbackVerify;
        let verification = staging.verify()?;

        *stage = Stage::CaptureReadLocality;
        let numa_read_nodes = locality::resolve(&self.topology, &region)?;

        *stage = Stage::CaptureScheduling;
        let thread = sched::capture(&self.topology)?;

        let record = BenchmarkResult {
            strategy: strategy.kind(),
            thread,
            checksum: read.checksum,
            verification,
            numa_write_nodes,
            numa_read_nodes,
            write_time_us: write.micros(),
            read_time_us: read.micros(),
            payload_bytes: size as u64,
        };

        *stage = Stage::Emit;
        sink.emit(&record)?;
        sink.flush()?;

        *stage = Stage::Teardown;
        drop(staging);
        drop(region);
        info!(
            write_time_us = record.write_time_us,
            read_time_us = record.read_time_us,
            "probe run complete"
        );

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::BufferingSink;

    fn sample() -> BenchmarkResult {
        BenchmarkResult {
            strategy: StrategyKind::FlushBased,
            thread: ThreadLocalitySnapshot {
                numa_id: 1,
                core_id: 7,
                voluntary_switches: 3,
                involuntary_switches: 0,
                core_migrations: 2,
            },
            checksum: Some(0),
            verification: Verification::Skipped,
            numa_write_nodes: [1].into_iter().collect(),
            numa_read_nodes: [0, 1].into_iter().collect(),
            write_time_us: 1.5,
            read_time_us: 2.0,
            payload_bytes: 4096,
        }
    }

    #[test]
    fn test_display_line_format() {
        assert_eq!(
            sample().to_string(),
            "numa_id: 1, core_id: 7, vcs: 3, ics: 0, mig: 2, checksum: 0, numa_write: [1], \
             numa_read: [0,1], write_time_us: 1.500000, read_time_us: 2.000000, payload: 4096."
        );
    }

    #[test]
    fn test_display_omits_missing_checksum() {
        let mut record = sample();
        record.checksum = None;
        assert!(!record.to_string().contains("checksum"));
    }

    #[test]
    fn test_serialized_record_is_flat() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["numa_id"], 1);
        assert_eq!(value["core_migrations"], 2);
        assert_eq!(value["verification"], "skipped");
        assert!(value.get("thread").is_none());
    }

    #[test]
    fn test_zero_payload_rejected_up_front() {
        let config = ProbeConfig {
            payload_bytes: 0,
            ..ProbeConfig::default()
        };
        let err = Benchmark::with_topology(config, NumaTopology::detect()).unwrap_err();
        assert!(matches!(err, ProbeError::InvalidConfig(_)));
    }

    #[test]
    fn test_closed_sink_fails_run() {
        let config = ProbeConfig::builder().payload_bytes(4096).build().unwrap();
        let bench = Benchmark::with_topology(config, NumaTopology::detect()).unwrap();
        let mut sink = BufferingSink::new();
        sink.close();

        match bench.run(&mut sink) {
            // Environments without scheduler stats fail earlier
            Err(ProbeError::Telemetry(_) | ProbeError::SchedulingStatsUnavailable(_)) => {}
            other => panic!("expected telemetry failure, got {other:?}"),
        }
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::CaptureWriteLocality.to_string(), "capture_write_locality");
        assert_eq!(Stage::Teardown.to_string(), "teardown");
    }
}
