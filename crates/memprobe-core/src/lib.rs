//! # memprobe core
//!
//! Memory-subsystem probe: drives a region through one of three access
//! strategies and reports where its pages live and where the issuing thread
//! was scheduled.
//!
//! This crate provides:
//! - **Strategies**: flush-based, fixed-stride streaming and width-adaptive
//!   SIMD streaming, each with a documented fence post-condition
//! - **Locality**: NUMA nodes backing a region after each phase
//! - **Scheduling**: node, core, context switches and migrations of the
//!   calling thread
//! - **Orchestrator**: one linear run ending in a single telemetry record
//!
//! ## Example
//!
//! ```rust,ignore
//! use memprobe_core::{Benchmark, LogSink, ProbeConfig, StrategyKind};
//!
//! let config = ProbeConfig::builder()
//!     .strategy(StrategyKind::StreamingAdaptiveWidth)
//!     .payload_bytes(64 << 20)
//!     .build()?;
//! let record = Benchmark::detect(config)?.run(&mut LogSink)?;
//! println!("{record}");
//! ```

#![deny(unsafe_code)] // raw syscalls and intrinsics opt in per item
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bench;
pub mod config;
pub mod error;
pub mod locality;
pub mod numa;
pub mod sched;
pub mod strategy;
pub mod telemetry;

pub use bench::{Benchmark, BenchmarkResult, Stage};
pub use config::{ProbeConfig, ProbeConfigBuilder};
pub use error::ProbeError;
pub use locality::NumaNodeSet;
pub use numa::{NumaTopology, Placement, TopologyService};
pub use sched::ThreadLocalitySnapshot;
pub use strategy::{AccessStrategy, SimdWidth, StrategyKind, Verification};
pub use telemetry::{BufferingSink, JsonLinesSink, LogSink, SinkError, TelemetrySink};

/// Result type for memprobe operations
pub type Result<T> = std::result::Result<T, ProbeError>;
