//! # Thread Scheduling Snapshot
//!
//! Where the calling thread is running (NUMA node, core) and how much the
//! scheduler has moved it around (context switches, migrations).
//!
//! Counters come from two per-thread kernel interfaces:
//! - `/proc/thread-self/sched` for `se.nr_migrations`
//! - `getrusage(RUSAGE_THREAD)` for `ru_nvcsw` / `ru_nivcsw`
//!
//! Both are cumulative, so consecutive snapshots on one thread never go
//! backwards.

use std::fs;

use serde::Serialize;
use tracing::debug;

use crate::numa::{CpuSet, ObjectKind, TopologyService};
use crate::{ProbeError, Result};

/// Per-thread scheduling statistics, newest kernels first.
const SCHED_SOURCES: [&str; 2] = ["/proc/thread-self/sched", "/proc/self/sched"];

/// Label suffix of the migration counter line.
const MIGRATIONS_LABEL: &str = "nr_migrations";

/// Scheduling state of the calling thread at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadLocalitySnapshot {
    /// First NUMA node local to the thread's CPU, `-1` if the CPU has no node
    pub numa_id: i32,
    /// Logical index of the enclosing core (always `>= 0`)
    pub core_id: i32,
    /// Voluntary context switches so far
    pub voluntary_switches: i64,
    /// Involuntary context switches so far
    pub involuntary_switches: i64,
    /// Migrations between CPUs so far
    pub core_migrations: i64,
}

/// Captures the calling thread's scheduling state.
///
/// Read-only; each call returns an independent snapshot.
///
/// # Errors
///
/// - [`ProbeError::CpuLocation`] if the thread's CPU cannot be read
/// - [`ProbeError::CoreResolution`] if no core encloses that CPU
/// - [`ProbeError::SchedulingStatsUnavailable`] if a counter source is
///   missing or lacks the migration counter
pub fn capture<T: TopologyService + ?Sized>(topology: &T) -> Result<ThreadLocalitySnapshot> {
    let cpus = topology
        .last_cpu_location()
        .map_err(ProbeError::CpuLocation)?;

    let numa_id = topology
        .cpuset_to_nodeset(&cpus)
        .first()
        .and_then(|node| i32::try_from(node).ok())
        .unwrap_or(-1);

    let core_id = enclosing_core(topology, &cpus)
        .ok_or_else(|| ProbeError::CoreResolution { cpus: cpus.clone() })?;

    let core_migrations = read_migrations()?;
    let (voluntary_switches, involuntary_switches) = read_context_switches()?;

    let snapshot = ThreadLocalitySnapshot {
        numa_id,
        core_id,
        voluntary_switches,
        involuntary_switches,
        core_migrations,
    };
    debug!(cpus = %cpus, ?snapshot, "captured thread locality");
    Ok(snapshot)
}

/// `true` when a per-thread scheduler statistics source with a migration
/// counter is readable. Kernels built without `CONFIG_SCHED_DEBUG` hide it.
#[must_use]
pub fn stats_available() -> bool {
    read_migrations().is_ok()
}

/// Walks up from the smallest object covering `cpus` to the first core.
fn enclosing_core<T: TopologyService + ?Sized>(
    topology: &T,
    cpus: &CpuSet,
) -> Option<i32> {
    let mut object = topology.covering_object(cpus)?;
    while object.kind != ObjectKind::Core {
        object = topology.parent(object)?;
    }
    i32::try_from(object.logical_index).ok()
}

fn read_migrations() -> Result<i64> {
    let mut last_err = None;
    for path in SCHED_SOURCES {
        match fs::read_to_string(path) {
            Ok(contents) => {
                return parse_migrations(&contents).ok_or_else(|| {
                    ProbeError::SchedulingStatsUnavailable(format!(
                        "{path} has no {MIGRATIONS_LABEL} counter"
                    ))
                });
            }
            Err(e) => last_err = Some(format!("{path}: {e}")),
        }
    }
    Err(ProbeError::SchedulingStatsUnavailable(
        last_err.unwrap_or_else(|| "no scheduling statistics source".to_string()),
    ))
}

/// Extracts the migration counter from a `/proc/<pid>/sched` dump.
///
/// Matches the first line whose label ends in `nr_migrations` (with or
/// without the `se.` prefix) and parses the integer after the `:`.
#[must_use]
pub fn parse_migrations(contents: &str) -> Option<i64> {
    contents.lines().find_map(|line| {
        let (label, value) = line.split_once(':')?;
        let label = label.trim();
        if label.rsplit('.').next()? != MIGRATIONS_LABEL {
            return None;
        }
        value.trim().parse().ok()
    })
}

#[allow(unsafe_code)]
fn read_context_switches() -> Result<(i64, i64)> {
    #[cfg(target_os = "linux")]
    let who = libc::RUSAGE_THREAD;
    #[cfg(not(target_os = "linux"))]
    let who = libc::RUSAGE_SELF;

    // SAFETY: rusage is plain old data; all-zero is a valid value
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: `usage` is a valid, writable rusage
    let rc = unsafe { libc::getrusage(who, &mut usage) };
    if rc != 0 {
        return Err(ProbeError::SchedulingStatsUnavailable(format!(
            "getrusage failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok((i64::from(usage.ru_nvcsw), i64::from(usage.ru_nivcsw)))
}
