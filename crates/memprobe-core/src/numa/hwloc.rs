//! # hwloc Backend
//!
//! Topology queries answered by hwloc through the `hwlocality` crate,
//! enabled with the `hwloc` feature. [`NumaTopology`](super::NumaTopology)
//! prefers this backend and falls back to sysfs when hwloc cannot load.
//!
//! The object arena is mirrored from hwloc's tree at load time so that
//! callers keep a single [`TopologyObject`] type. Live queries (area
//! memory location, last CPU location, cpuset → nodeset, smallest covering
//! object) go to hwloc on every call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hwlocality::cpu::binding::CpuBindingFlags;
use hwlocality::cpu::cpuset::CpuSet as HwlocCpuSet;
use hwlocality::memory::binding::MemoryBindingFlags;
use hwlocality::memory::nodeset::NodeSet as HwlocNodeSet;
use hwlocality::object::types::ObjectType;
use hwlocality::object::TopologyObject as HwlocObject;
use hwlocality::Topology;

use super::topology::{ObjectKind, TopologyObject};
use super::{CpuSet, NodeSet, NumaError};

/// Shared handle on a loaded hwloc topology.
#[derive(Clone)]
pub(crate) struct HwlocBackend {
    topology: Arc<Topology>,
}

impl fmt::Debug for HwlocBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwlocBackend").finish_non_exhaustive()
    }
}

impl HwlocBackend {
    /// Loads the machine topology.
    pub(crate) fn load() -> Result<Self, NumaError> {
        let topology = Topology::new()
            .map_err(|e| NumaError::TopologyError(format!("hwlocality init failed: {e}")))?;
        Ok(Self {
            topology: Arc::new(topology),
        })
    }

    /// `(os node id, cpus)` for every NUMA node hwloc reports.
    pub(crate) fn nodes(&self) -> Vec<(usize, Vec<usize>)> {
        self.topology
            .objects_with_type(ObjectType::NUMANode)
            .enumerate()
            .map(|(i, node)| (node.os_index().unwrap_or(i), cpus_of(node).to_vec()))
            .collect()
    }

    /// OS indices of every processing unit.
    pub(crate) fn pus(&self) -> Vec<usize> {
        self.topology
            .objects_with_type(ObjectType::PU)
            .filter_map(HwlocObject::os_index)
            .collect()
    }

    /// Mirrors hwloc's Machine → Package → Core → PU objects into an arena.
    ///
    /// Intermediate hwloc levels (caches, dies, groups) are skipped: each
    /// object's parent is its nearest ancestor of a mirrored kind. Slot 0 is
    /// the machine.
    pub(crate) fn objects(&self) -> Vec<TopologyObject> {
        let mut objects = Vec::new();
        let mut slots: HashMap<(ObjectKind, usize), usize> = HashMap::new();

        for (ty, kind) in [
            (ObjectType::Machine, ObjectKind::Machine),
            (ObjectType::Package, ObjectKind::Package),
            (ObjectType::Core, ObjectKind::Core),
            (ObjectType::PU, ObjectKind::Pu),
        ] {
            for object in self.topology.objects_with_type(ty) {
                let parent = mirrored_ancestor(object)
                    .and_then(|(k, index)| slots.get(&(k, index)).copied());
                slots.insert((kind, object.logical_index()), objects.len());
                objects.push(TopologyObject {
                    kind,
                    logical_index: object.logical_index(),
                    os_index: object.os_index(),
                    parent,
                    cpuset: cpus_of(object),
                });
            }
        }

        objects
    }

    /// Nodes holding the pages of `[addr, addr + len)`.
    #[allow(unsafe_code)]
    pub(crate) fn area_nodeset(&self, addr: *const u8, len: usize) -> Result<NodeSet, NumaError> {
        if addr.is_null() || len == 0 {
            return Err(NumaError::AllocationFailed("empty region".into()));
        }

        // SAFETY: callers pass a live mapping of `len` bytes; hwloc hands the
        // range to the kernel and never reads through it.
        let area = unsafe { std::slice::from_raw_parts(addr, len) };
        let nodes: HwlocNodeSet = self
            .topology
            .area_memory_location(area, MemoryBindingFlags::ASSUME_SINGLE_THREAD)
            .map_err(|e| NumaError::TopologyError(format!("area memory location: {e}")))?;

        Ok(nodes.iter_set().map(usize::from).collect())
    }

    /// CPU the calling thread last ran on.
    pub(crate) fn last_cpu_location(&self) -> Result<CpuSet, NumaError> {
        let cpus = self
            .topology
            .last_cpu_location(CpuBindingFlags::THREAD)
            .map_err(|e| NumaError::TopologyError(format!("last cpu location: {e}")))?;
        Ok(cpus.iter_set().map(usize::from).collect())
    }

    /// Nodes local to any CPU of `cpus`.
    pub(crate) fn cpuset_to_nodeset(&self, cpus: &CpuSet) -> NodeSet {
        let nodes = HwlocNodeSet::from_cpuset(&self.topology, &to_hwloc(cpus));
        nodes.iter_set().map(usize::from).collect()
    }

    /// Kind and logical index of the smallest mirrored object covering `cpus`.
    pub(crate) fn covering(&self, cpus: &CpuSet) -> Option<(ObjectKind, usize)> {
        if cpus.is_empty() {
            return None;
        }
        let object = self
            .topology
            .smallest_object_covering_cpuset(&to_hwloc(cpus))?;
        match kind_of(object.object_type()) {
            Some(kind) => Some((kind, object.logical_index())),
            None => mirrored_ancestor(object),
        }
    }
}

fn kind_of(ty: ObjectType) -> Option<ObjectKind> {
    match ty {
        ObjectType::Machine => Some(ObjectKind::Machine),
        ObjectType::Package => Some(ObjectKind::Package),
        ObjectType::Core => Some(ObjectKind::Core),
        ObjectType::PU => Some(ObjectKind::Pu),
        _ => None,
    }
}

/// Nearest strict ancestor whose type is mirrored in the arena.
fn mirrored_ancestor(object: &HwlocObject) -> Option<(ObjectKind, usize)> {
    let mut current = object.parent();
    while let Some(ancestor) = current {
        if let Some(kind) = kind_of(ancestor.object_type()) {
            return Some((kind, ancestor.logical_index()));
        }
        current = ancestor.parent();
    }
    None
}

fn cpus_of(object: &HwlocObject) -> CpuSet {
    object
        .cpuset()
        .map(|set| set.iter_set().map(usize::from).collect())
        .unwrap_or_else(CpuSet::new)
}

fn to_hwloc(cpus: &CpuSet) -> HwlocCpuSet {
    let mut set = HwlocCpuSet::new();
    for cpu in cpus.iter() {
        set.set(cpu);
    }
    set
}
