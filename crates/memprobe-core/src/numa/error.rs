//! # NUMA Error Types
//!
//! Error types for topology queries and region allocation.

/// Errors that can occur while talking to the topology layer.
#[derive(Debug, thiserror::Error)]
pub enum NumaError {
    /// Allocation failed
    #[error("NUMA allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid NUMA node
    #[error("Invalid NUMA node: {node} (system has {available} nodes)")]
    InvalidNode {
        /// The requested node
        node: usize,
        /// Number of available nodes
        available: usize,
    },

    /// Invalid alignment request
    #[error("Invalid alignment: {0} (must be a power of two no larger than the page size)")]
    InvalidAlignment(usize),

    /// Topology detection failed
    #[error("Topology detection failed: {0}")]
    TopologyError(String),

    /// System call failed
    #[error("System call failed: {0}")]
    SyscallFailed(#[from] std::io::Error),

    /// None of the queried pages is resident
    #[error("No resident pages in {0} byte region")]
    NoResidentPages(usize),

    /// NUMA not available on this platform
    #[error("NUMA not available on this platform")]
    NotAvailable,
}

impl NumaError {
    /// Returns the OS error code behind this error, if there is one.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SyscallFailed(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
