//! # NUMA Topology and Region Allocation
//!
//! The topology layer the probe queries: which nodes back a range of
//! memory, which CPU the calling thread last ran on, and which core
//! encloses that CPU.
//!
//! ```text
//! ┌─────────────────────┐         ┌─────────────────────┐
//! │      Socket 0       │         │      Socket 1       │
//! │  ┌───────────────┐  │         │  ┌───────────────┐  │
//! │  │  Core → PUs   │  │         │  │  Core → PUs   │  │
//! │  └───────┬───────┘  │         │  └───────┬───────┘  │
//! │  ┌───────▼───────┐  │   QPI   │  ┌───────▼───────┐  │
//! │  │  Local DRAM   │◄─┼─────────┼─►│  Local DRAM   │  │
//! │  └───────────────┘  │         │  └───────────────┘  │
//! └─────────────────────┘         └─────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`TopologyService`] - Query interface consumed by the probe
//! - [`NumaTopology`] - hwloc-backed with the `hwloc` feature, sysfs otherwise
//! - [`NumaAllocator`] / [`MemoryRegion`] - Page-backed buffers with optional node placement
//!
//! ## Platform Support
//!
//! | Platform | Support |
//! |----------|---------|
//! | Linux | Full (sysfs, `move_pages`, `mbind`, `sched_getcpu`) |
//! | Other | Degraded (single node, no CPU location) |

mod bitmap;
mod error;
#[cfg(feature = "hwloc")]
mod hwloc;
mod region;
mod topology;

pub use bitmap::{CpuIndex, CpuSet, IndexSet, NodeIndex, NodeSet};
pub use error::NumaError;
pub use region::{MemoryRegion, NumaAllocator, Placement};
pub use topology::{NumaTopology, ObjectKind, TopologyObject};

/// Query interface over a discovered machine topology.
///
/// The probe only ever reads from the topology; implementations must not
/// change process or memory state while answering.
pub trait TopologyService {
    /// Number of NUMA nodes; valid node ids are `0..num_nodes()`.
    fn num_nodes(&self) -> usize;

    /// NUMA nodes holding at least one page of `[addr, addr + len)`.
    ///
    /// Pages that have never been touched are not reported. The range must
    /// be mapped for the duration of the call.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying query fails for the region or for
    /// any page in it (e.g. an unmapped page).
    fn query_region_nodeset(&self, addr: *const u8, len: usize) -> Result<NodeSet, NumaError>;

    /// The CPU(s) the calling thread last ran on.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot report a CPU location.
    fn last_cpu_location(&self) -> Result<CpuSet, NumaError>;

    /// NUMA nodes local to the given CPUs.
    fn cpuset_to_nodeset(&self, cpus: &CpuSet) -> NodeSet;

    /// Smallest object whose CPU set includes `cpus`.
    fn covering_object(&self, cpus: &CpuSet) -> Option<&TopologyObject>;

    /// Parent of `object` in the hierarchy, `None` at the root.
    fn parent(&self, object: &TopologyObject) -> Option<&TopologyObject>;
}

/// System page size in bytes.
#[must_use]
#[allow(unsafe_code)]
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if let Ok(size) = usize::try_from(size) {
            if size > 0 {
                return size;
            }
        }
    }

    4096
}
