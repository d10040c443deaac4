//! # NUMA Topology Detection
//!
//! Detects system topology using:
//! 1. hwloc via `hwlocality` (when the `hwloc` feature is enabled)
//! 2. sysfs parsing on Linux (`/sys/devices/system/node`, `/sys/devices/system/cpu`)
//! 3. Single-node fallback on other platforms
//!
//! Besides the node/CPU maps, detection builds a small object hierarchy
//! (Machine → Package → Core → PU) so a CPU can be resolved to the core
//! that encloses it.

use std::collections::BTreeMap;
use std::fmt;

use super::{CpuSet, NodeSet, NumaError, TopologyService};

/// Kind of an object in the topology hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    /// The whole machine (root).
    Machine,
    /// A physical processor package (socket).
    Package,
    /// A physical core.
    Core,
    /// A processing unit (logical CPU / hardware thread).
    Pu,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Machine => write!(f, "Machine"),
            ObjectKind::Package => write!(f, "Package"),
            ObjectKind::Core => write!(f, "Core"),
            ObjectKind::Pu => write!(f, "PU"),
        }
    }
}

/// One node of the topology hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyObject {
    /// Object kind
    pub kind: ObjectKind,
    /// Index among objects of the same kind, in topology order
    pub logical_index: usize,
    /// OS-assigned index (package id, core id, CPU number), if any
    pub os_index: Option<usize>,
    /// Arena slot of the parent object (`None` for the root)
    pub parent: Option<usize>,
    /// CPUs covered by this object
    pub cpuset: CpuSet,
}

/// Placement of one logical CPU in the package/core hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuPlacement {
    cpu: usize,
    package: usize,
    core: usize,
}

/// NUMA topology information for the system.
///
/// Provides information about NUMA nodes, which CPUs belong to each node,
/// memory available per node, and the package/core hierarchy.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    /// Number of NUMA nodes
    num_nodes: usize,
    /// CPUs per node (index = node ID)
    cpus_per_node: Vec<Vec<usize>>,
    /// Memory per node in bytes (index = node ID)
    memory_per_node: Vec<u64>,
    /// Total number of CPUs
    num_cpus: usize,
    /// CPU to NUMA node mapping
    cpu_to_node: Vec<usize>,
    /// Object arena; slot 0 is the machine
    objects: Vec<TopologyObject>,
    /// Live query backend, when hwloc loaded
    #[cfg(feature = "hwloc")]
    hwloc: Option<super::hwloc::HwlocBackend>,
}

impl NumaTopology {
    /// Detect the system's topology.
    ///
    /// Uses the best available method for the platform:
    /// - With `hwloc` feature: Uses hwlocality
    /// - Linux: Reads from sysfs
    /// - Other: Returns a single-node topology
    ///
    /// This method never fails - it falls back to a single-node topology
    /// if detection fails.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(feature = "hwloc")]
        {
            match Self::detect_hwlocality() {
                Ok(topo) => return topo,
                Err(e) => tracing::debug!("hwlocality detection failed, trying sysfs: {e}"),
            }
        }

        #[cfg(target_os = "linux")]
        {
            match Self::detect_sysfs() {
                Ok(topo) => return topo,
                Err(e) => tracing::debug!("sysfs topology detection failed, using fallback: {e}"),
            }
        }

        Self::single_node_fallback()
    }

    /// Detect topology using hwlocality; later queries go through hwloc too.
    #[cfg(feature = "hwloc")]
    fn detect_hwlocality() -> Result<Self, NumaError> {
        let backend = super::hwloc::HwlocBackend::load()?;

        let nodes = backend.nodes();
        if nodes.is_empty() {
            return Err(NumaError::TopologyError(
                "No NUMA nodes found via hwlocality".to_string(),
            ));
        }
        let objects = backend.objects();
        if !objects.iter().any(|o| o.kind == ObjectKind::Core) {
            return Err(NumaError::TopologyError(
                "No cores found via hwlocality".to_string(),
            ));
        }

        let num_nodes = nodes.iter().map(|(id, _)| id + 1).max().unwrap_or(1);
        let num_cpus = backend.pus().into_iter().max().map_or(1, |m| m + 1);
        let mut cpus_per_node = vec![Vec::new(); num_nodes];
        let mut memory_per_node = vec![0u64; num_nodes];
        let mut cpu_to_node = vec![0usize; num_cpus];

        for (node_id, cpus) in nodes {
            for &cpu in &cpus {
                if cpu < num_cpus {
                    cpu_to_node[cpu] = node_id;
                }
            }
            cpus_per_node[node_id] = cpus;
            memory_per_node[node_id] = Self::node_memory(node_id);
        }

        tracing::debug!("topology detected via hwlocality");
        Ok(Self {
            num_nodes,
            cpus_per_node,
            memory_per_node,
            num_cpus,
            cpu_to_node,
            objects,
            hwloc: Some(backend),
        })
    }

    /// Total memory of one node from its sysfs meminfo, 0 if unreadable.
    #[cfg(feature = "hwloc")]
    fn node_memory(node: usize) -> u64 {
        std::fs::read_to_string(format!("/sys/devices/system/node/node{node}/meminfo"))
            .map(|meminfo| Self::parse_meminfo(&meminfo))
            .unwrap_or(0)
    }

    /// `true` when live queries are answered by hwloc.
    #[must_use]
    pub fn uses_hwloc(&self) -> bool {
        #[cfg(feature = "hwloc")]
        {
            self.hwloc.is_some()
        }
        #[cfg(not(feature = "hwloc"))]
        {
            false
        }
    }

    /// Detect topology from sysfs on Linux.
    #[cfg(target_os = "linux")]
    fn detect_sysfs() -> Result<Self, NumaError> {
        use std::fs;
        use std::path::Path;

        let node_path = Path::new("/sys/devices/system/node");
        if !node_path.exists() {
            return Err(NumaError::TopologyError(
                "sysfs node path not found".to_string(),
            ));
        }

        let mut node_dirs: Vec<usize> = Vec::new();
        for entry in fs::read_dir(node_path)
            .map_err(|e| NumaError::TopologyError(format!("Failed to read node dir: {e}")))?
        {
            let entry = entry
                .map_err(|e| NumaError::TopologyError(format!("Failed to read entry: {e}")))?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if let Some(id) = name_str.strip_prefix("node") {
                if let Ok(node_id) = id.parse::<usize>() {
                    node_dirs.push(node_id);
                }
            }
        }

        if node_dirs.is_empty() {
            return Err(NumaError::TopologyError("No NUMA nodes found".to_string()));
        }

        node_dirs.sort_unstable();
        let num_nodes = node_dirs.iter().max().map_or(1, |m| m + 1);

        let online = Self::online_cpus();
        let num_cpus = online.iter().max().map_or(0, |m| m + 1);

        let mut cpus_per_node = vec![Vec::new(); num_nodes];
        let mut memory_per_node = vec![0u64; num_nodes];
        let mut cpu_to_node = vec![0usize; num_cpus];

        for node_id in &node_dirs {
            let node_dir = node_path.join(format!("node{node_id}"));

            if let Ok(cpulist) = fs::read_to_string(node_dir.join("cpulist")) {
                let cpus = Self::parse_cpulist(cpulist.trim());
                for cpu in &cpus {
                    if *cpu < num_cpus {
                        cpu_to_node[*cpu] = *node_id;
                    }
                }
                cpus_per_node[*node_id] = cpus;
            }

            if let Ok(meminfo) = fs::read_to_string(node_dir.join("meminfo")) {
                memory_per_node[*node_id] = Self::parse_meminfo(&meminfo);
            }
        }

        let placements: Vec<CpuPlacement> = online
            .iter()
            .map(|&cpu| Self::read_cpu_placement(cpu))
            .collect();

        Ok(Self {
            num_nodes,
            cpus_per_node,
            memory_per_node,
            num_cpus,
            cpu_to_node,
            objects: Self::build_objects(&placements),
            #[cfg(feature = "hwloc")]
            hwloc: None,
        })
    }

    /// Online CPU ids from sysfs, falling back to `0..num_cpus::get()`.
    fn online_cpus() -> Vec<usize> {
        #[cfg(target_os = "linux")]
        {
            if let Ok(online) = std::fs::read_to_string("/sys/devices/system/cpu/online") {
                let cpus = Self::parse_cpulist(online.trim());
                if !cpus.is_empty() {
                    return cpus;
                }
            }
        }
        (0..num_cpus::get()).collect()
    }

    /// Reads the package and core id of a CPU; missing files make the CPU
    /// its own core on package 0.
    #[cfg(target_os = "linux")]
    fn read_cpu_placement(cpu: usize) -> CpuPlacement {
        let read_id = |name: &str| -> Option<usize> {
            let path = format!("/sys/devices/system/cpu/cpu{cpu}/topology/{name}");
            std::fs::read_to_string(path).ok()?.trim().parse().ok()
        };

        CpuPlacement {
            cpu,
            package: read_id("physical_package_id").unwrap_or(0),
            core: read_id("core_id").unwrap_or(cpu),
        }
    }

    /// Parse a CPU list string like "0-7,16-23".
    pub(crate) fn parse_cpulist(s: &str) -> Vec<usize> {
        let mut cpus = Vec::new();

        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if let Some((start, end)) = part.split_once('-') {
                if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                    cpus.extend(start..=end);
                }
            } else if let Ok(cpu) = part.parse::<usize>() {
                cpus.push(cpu);
            }
        }

        cpus
    }

    /// Parse a node meminfo file for total memory.
    pub(crate) fn parse_meminfo(s: &str) -> u64 {
        for line in s.lines() {
            // "Node X MemTotal:       NNNN kB"
            if line.contains("MemTotal") {
                let parts: Vec<&str> = line.split_whitespace().collect();
                for (i, part) in parts.iter().enumerate() {
                    if let Ok(val) = part.parse::<u64>() {
                        if parts.get(i + 1).is_some_and(|&u| u == "kB") {
                            return val * 1024;
                        }
                        // Node index, keep scanning
                        if i + 1 < parts.len() && parts[i + 1].starts_with("Mem") {
                            continue;
                        }
                        return val;
                    }
                }
            }
        }
        0
    }

    /// Builds the Machine → Package → Core → PU arena from per-CPU placements.
    ///
    /// Logical indices follow (package, core, cpu) order.
    fn build_objects(placements: &[CpuPlacement]) -> Vec<TopologyObject> {
        let mut sorted = placements.to_vec();
        sorted.sort_by_key(|p| (p.package, p.core, p.cpu));

        let mut objects = vec![TopologyObject {
            kind: ObjectKind::Machine,
            logical_index: 0,
            os_index: None,
            parent: None,
            cpuset: sorted.iter().map(|p| p.cpu).collect(),
        }];

        let mut packages: BTreeMap<usize, usize> = BTreeMap::new();
        let mut cores: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        let mut counts = [0usize; 3];

        for p in &sorted {
            let package_slot = *packages.entry(p.package).or_insert_with(|| {
                objects.push(TopologyObject {
                    kind: ObjectKind::Package,
                    logical_index: counts[0],
                    os_index: Some(p.package),
                    parent: Some(0),
                    cpuset: CpuSet::new(),
                });
                counts[0] += 1;
                objects.len() - 1
            });
            objects[package_slot].cpuset.insert(p.cpu);

            let core_slot = *cores.entry((p.package, p.core)).or_insert_with(|| {
                objects.push(TopologyObject {
                    kind: ObjectKind::Core,
                    logical_index: counts[1],
                    os_index: Some(p.core),
                    parent: Some(package_slot),
                    cpuset: CpuSet::new(),
                });
                counts[1] += 1;
                objects.len() - 1
            });
            objects[core_slot].cpuset.insert(p.cpu);

            objects.push(TopologyObject {
                kind: ObjectKind::Pu,
                logical_index: counts[2],
                os_index: Some(p.cpu),
                parent: Some(core_slot),
                cpuset: CpuSet::single(p.cpu),
            });
            counts[2] += 1;
        }

        objects
    }

    /// Create a single-node fallback topology where every CPU is its own core.
    pub(crate) fn single_node_fallback() -> Self {
        let cpus = Self::online_cpus();
        let num_cpus = cpus.iter().max().map_or(1, |m| m + 1);
        let placements: Vec<CpuPlacement> = cpus
            .iter()
            .map(|&cpu| CpuPlacement {
                cpu,
                package: 0,
                core: cpu,
            })
            .collect();

        Self {
            num_nodes: 1,
            cpus_per_node: vec![cpus],
            memory_per_node: vec![0],
            num_cpus,
            cpu_to_node: vec![0; num_cpus],
            objects: Self::build_objects(&placements),
            #[cfg(feature = "hwloc")]
            hwloc: None,
        }
    }

    /// Returns the number of NUMA nodes.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Returns the total number of CPUs.
    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Returns the CPUs belonging to a specific NUMA node.
    ///
    /// Returns an empty slice if the node ID is invalid.
    #[must_use]
    pub fn cpus_for_node(&self, node: usize) -> &[usize] {
        self.cpus_per_node.get(node).map_or(&[], Vec::as_slice)
    }

    /// Returns the memory (in bytes) for a specific NUMA node.
    #[must_use]
    pub fn memory_for_node(&self, node: usize) -> u64 {
        self.memory_per_node.get(node).copied().unwrap_or(0)
    }

    /// Returns the NUMA node for a given CPU, if known.
    #[must_use]
    pub fn node_for_cpu(&self, cpu: usize) -> Option<usize> {
        self.cpu_to_node.get(cpu).copied()
    }

    /// Check if the system has multiple NUMA nodes.
    #[must_use]
    pub fn is_numa(&self) -> bool {
        self.num_nodes > 1
    }

    /// All objects of a given kind, in logical order.
    pub fn objects_of_kind(&self, kind: ObjectKind) -> impl Iterator<Item = &TopologyObject> {
        self.objects.iter().filter(move |o| o.kind == kind)
    }

    /// Log the detected topology for debugging.
    pub fn log_topology(&self) {
        let backend = if self.uses_hwloc() { "hwloc" } else { "sysfs" };
        tracing::info!(
            backend,
            "Topology: {} NUMA nodes, {} CPUs, {} cores",
            self.num_nodes,
            self.num_cpus,
            self.objects_of_kind(ObjectKind::Core).count()
        );
        for node in 0..self.num_nodes {
            let cpus = self.cpus_for_node(node);
            let memory_mb = self.memory_for_node(node) / (1024 * 1024);
            tracing::debug!(
                "  Node {}: {} CPUs ({:?}), {} MB memory",
                node,
                cpus.len(),
                cpus,
                memory_mb
            );
        }
    }

    /// Get a summary string of the topology.
    #[must_use]
    pub fn summary(&self) -> String {
        use std::fmt::Write;

        let mut s = format!(
            "NUMA: {} nodes, {} CPUs, {} cores",
            self.num_nodes,
            self.num_cpus,
            self.objects_of_kind(ObjectKind::Core).count()
        );
        for node in 0..self.num_nodes {
            let cpus = self.cpus_for_node(node);
            let memory_mb = self.memory_for_node(node) / (1024 * 1024);
            let _ = write!(s, "\n  Node {}: {} CPUs, {} MB", node, cpus.len(), memory_mb);
        }
        s
    }

    /// Page-by-page `move_pages(2)` query of a region's node placement.
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn query_region_move_pages(&self, addr: *const u8, len: usize) -> Result<NodeSet, NumaError> {
        // Pages per move_pages call
        const BATCH: usize = 4096;

        let page = super::page_size();
        let start = (addr as usize) & !(page - 1);
        let end = (addr as usize)
            .checked_add(len)
            .ok_or_else(|| NumaError::AllocationFailed("region wraps the address space".into()))?;
        let pages = (end - start).div_ceil(page);

        let mut nodes = NodeSet::new();
        let mut addrs: Vec<*mut libc::c_void> = Vec::with_capacity(BATCH.min(pages));
        let mut status = vec![0i32; BATCH.min(pages)];

        let mut first_page = 0;
        while first_page < pages {
            let count = (pages - first_page).min(BATCH);
            addrs.clear();
            addrs.extend(
                (first_page..first_page + count).map(|p| (start + p * page) as *mut libc::c_void),
            );

            // SAFETY: `addrs` and `status` both hold `count` entries; a null
            // `nodes` argument makes this a query that never moves pages.
            let result = unsafe {
                libc::syscall(
                    libc::SYS_move_pages,
                    0i32, // self
                    count as libc::c_ulong,
                    addrs.as_ptr(),
                    std::ptr::null::<i32>(),
                    status.as_mut_ptr(),
                    0i32,
                )
            };

            if result < 0 {
                return Err(NumaError::SyscallFailed(std::io::Error::last_os_error()));
            }

            for &s in &status[..count] {
                match usize::try_from(s) {
                    Ok(node) => {
                        nodes.insert(node);
                    }
                    // Mapped but not faulted in yet
                    Err(_) if s == -libc::ENOENT => {}
                    // Unmapped, or untouched anonymous memory on older kernels
                    Err(_) => {
                        return Err(NumaError::SyscallFailed(
                            std::io::Error::from_raw_os_error(-s),
                        ));
                    }
                }
            }

            first_page += count;
        }

        Ok(nodes)
    }
}

impl TopologyService for NumaTopology {
    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    #[cfg(target_os = "linux")]
    fn query_region_nodeset(&self, addr: *const u8, len: usize) -> Result<NodeSet, NumaError> {
        #[cfg(feature = "hwloc")]
        if let Some(hwloc) = &self.hwloc {
            return hwloc.area_nodeset(addr, len);
        }

        match self.query_region_move_pages(addr, len) {
            Ok(nodes) => Ok(nodes),
            // Kernels without CONFIG_NUMA, or sandboxes filtering move_pages:
            // with a single node the answer is still known.
            Err(e)
                if !self.is_numa()
                    && matches!(e.raw_os_error(), Some(libc::ENOSYS | libc::EPERM)) =>
            {
                tracing::debug!("move_pages unavailable on single-node system ({e}), assuming node 0");
                Ok(NodeSet::single(0))
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn query_region_nodeset(&self, addr: *const u8, len: usize) -> Result<NodeSet, NumaError> {
        #[cfg(feature = "hwloc")]
        if let Some(hwloc) = &self.hwloc {
            return hwloc.area_nodeset(addr, len);
        }

        if addr.is_null() || len == 0 {
            return Err(NumaError::AllocationFailed("empty region".into()));
        }
        Ok(NodeSet::single(0))
    }

    #[allow(unsafe_code)]
    fn last_cpu_location(&self) -> Result<CpuSet, NumaError> {
        #[cfg(feature = "hwloc")]
        if let Some(hwloc) = &self.hwloc {
            return hwloc.last_cpu_location();
        }

        #[cfg(target_os = "linux")]
        {
            // SAFETY: sched_getcpu takes no arguments and only reads scheduler state
            let cpu = unsafe { libc::sched_getcpu() };
            usize::try_from(cpu)
                .map(CpuSet::single)
                .map_err(|_| NumaError::SyscallFailed(std::io::Error::last_os_error()))
        }

        #[cfg(not(target_os = "linux"))]
        {
            Err(NumaError::NotAvailable)
        }
    }

    fn cpuset_to_nodeset(&self, cpus: &CpuSet) -> NodeSet {
        #[cfg(feature = "hwloc")]
        if let Some(hwloc) = &self.hwloc {
            return hwloc.cpuset_to_nodeset(cpus);
        }

        cpus.iter().filter_map(|cpu| self.node_for_cpu(cpu)).collect()
    }

    fn covering_object(&self, cpus: &CpuSet) -> Option<&TopologyObject> {
        #[cfg(feature = "hwloc")]
        if let Some(hwloc) = &self.hwloc {
            let (kind, index) = hwloc.covering(cpus)?;
            return self
                .objects_of_kind(kind)
                .find(|o| o.logical_index == index);
        }

        if cpus.is_empty() {
            return None;
        }
        // Smallest covering set wins; on a tie the deeper kind wins.
        self.objects
            .iter()
            .filter(|o| o.cpuset.includes(cpus))
            .min_by_key(|o| (o.cpuset.len(), std::cmp::Reverse(o.kind)))
    }

    fn parent(&self, object: &TopologyObject) -> Option<&TopologyObject> {
        object.parent.and_then(|slot| self.objects.get(slot))
    }
}
