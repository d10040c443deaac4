//! Locality resolver: which NUMA nodes back a memory region.

use tracing::{debug, error};

use crate::numa::{MemoryRegion, NodeSet, NumaError, TopologyService};
use crate::{ProbeError, Result};

/// Node ids backing some page of a region, in ascending order.
pub type NumaNodeSet = NodeSet;

/// Returns the nodes holding at least one page of `region`.
///
/// Call only after the phase that touched the region has fenced, so the
/// answer reflects post-write (or post-read) placement.
///
/// # Errors
///
/// Returns [`ProbeError::LocalityQuery`] with the region's address and size
/// if the topology query fails or finds no resident page. Never retried.
pub fn resolve<T: TopologyService + ?Sized>(
    topology: &T,
    region: &MemoryRegion,
) -> Result<NumaNodeSet> {
    let address = region.as_ptr() as usize;
    let size = region.len();

    let queried = topology
        .query_region_nodeset(region.as_ptr(), size)
        .and_then(|nodes| {
            if nodes.is_empty() {
                Err(NumaError::NoResidentPages(size))
            } else {
                Ok(nodes)
            }
        });

    match queried {
        Ok(nodes) => {
            debug!(address = %format!("{address:#x}"), size, nodes = %nodes, "resolved region locality");
            Ok(nodes)
        }
        Err(source) => {
            error!(
                address = %format!("{address:#x}"),
                size,
                errno = ?source.raw_os_error(),
                error = %source,
                "failed to retrieve memory binding"
            );
            Err(ProbeError::LocalityQuery {
                address,
                size,
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::{CpuSet, NumaAllocator, NumaTopology, Placement, TopologyObject};

    /// Answers every region query with a fixed outcome.
    enum Canned {
        /// `EFAULT`, as for an unmapped range
        Unmapped,
        /// Success with no node, as for a range nothing has touched
        Empty,
    }

    impl TopologyService for Canned {
        fn num_nodes(&self) -> usize {
            1
        }

        fn query_region_nodeset(&self, _: *const u8, _: usize) -> std::result::Result<NodeSet, NumaError> {
            match self {
                Canned::Unmapped => Err(NumaError::SyscallFailed(std::io::Error::from_raw_os_error(
                    libc::EFAULT,
                ))),
                Canned::Empty => Ok(NodeSet::new()),
            }
        }

        fn last_cpu_location(&self) -> std::result::Result<CpuSet, NumaError> {
            Err(NumaError::NotAvailable)
        }

        fn cpuset_to_nodeset(&self, _: &CpuSet) -> NodeSet {
            NodeSet::new()
        }

        fn covering_object(&self, _: &CpuSet) -> Option<&TopologyObject> {
            None
        }

        fn parent(&self, _: &TopologyObject) -> Option<&TopologyObject> {
            None
        }
    }

    #[test]
    fn test_resolve_touched_region() {
        let topo = NumaTopology::detect();
        let mut region = NumaAllocator::new(&topo)
            .allocate(64 * 1024, 64, Placement::FirstTouch)
            .unwrap();
        region.as_mut_slice().fill(0x11);

        let nodes = resolve(&topo, &region).unwrap();
        assert!(!nodes.is_empty());
        assert!(nodes.iter().all(|n| n < topo.num_nodes()));
    }

    #[test]
    fn test_query_failure_carries_region_and_errno() {
        let topo = NumaTopology::detect();
        let region = NumaAllocator::new(&topo)
            .allocate(4096, 1, Placement::FirstTouch)
            .unwrap();

        let err = resolve(&Canned::Unmapped, &region).unwrap_err();
        match err {
            ProbeError::LocalityQuery {
                address,
                size,
                source,
            } => {
                assert_eq!(address, region.as_ptr() as usize);
                assert_eq!(size, 4096);
                assert_eq!(source.raw_os_error(), Some(libc::EFAULT));
            }
            other => panic!("expected LocalityQuery, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_nodeset_is_an_error() {
        let topo = NumaTopology::detect();
        let region = NumaAllocator::new(&topo)
            .allocate(8192, 1, Placement::FirstTouch)
            .unwrap();

        match resolve(&Canned::Empty, &region).unwrap_err() {
            ProbeError::LocalityQuery { size, source, .. } => {
                assert_eq!(size, 8192);
                assert!(matches!(source, NumaError::NoResidentPages(8192)));
            }
            other => panic!("expected LocalityQuery, got {other:?}"),
        }
    }

    #[test]
    #[cfg(all(target_os = "linux", not(feature = "hwloc")))]
    fn test_untouched_region_is_an_error() {
        let topo = NumaTopology::detect();
        let region = NumaAllocator::new(&topo)
            .allocate(64 * 1024, 64, Placement::FirstTouch)
            .unwrap();

        // Nothing has faulted the pages in. Newer kernels report them absent,
        // older ones as EFAULT; without move_pages the single-node answer stands.
        match resolve(&topo, &region) {
            Err(ProbeError::LocalityQuery { source, .. }) => {
                assert!(
                    matches!(source, NumaError::NoResidentPages(_))
                        || source.raw_os_error() == Some(libc::EFAULT)
                );
            }
            Ok(nodes) => assert_eq!(nodes.to_vec(), vec![0]),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
