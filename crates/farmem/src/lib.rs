//! farmem pools the physical memory of many networked nodes into one
//! large virtual address space presented to an unmodified program on a
//! designated master node. Accesses outside the locally cached window
//! trap; the missing page is fetched from the peer holding it, a
//! resident page is evicted to make room, and the access resumes.
//!
//! The workspace splits along the natural seams:
//!
//! - [`farmem_types`]: page/rank/layout types and `FM_*` configuration;
//! - [`farmem_error`]: the error taxonomy;
//! - [`farmem_transport`]: the peer page-server protocol and the
//!   transports that carry it;
//! - [`farmem_pager`]: the page table, the replacement policies, and
//!   the fault-service engine;
//! - [`farmem_host`]: hosted Linux integration (signals, mmap, thread
//!   freezing, the allocator split).
//!
//! [`sim::SimNode`] assembles the entire stack against an in-memory
//! region for deterministic testing and single-process experiments;
//! [`farmem_host::bootstrap`] assembles it against real memory.

#![forbid(unsafe_code)]

pub mod sim;

pub use farmem_error::{ErrorCategory, FarmemError, Result};
pub use farmem_host::{bootstrap, HostRuntime};
pub use farmem_pager::{
    AccessKind, EngineOptions, EngineStats, FaultOutcome, PagingEngine,
};
pub use farmem_types::{
    EngineConfig, PageDistribution, PageIndex, PageSize, PeerRank, PolicyKind, PrefetchKind,
    Protection, RegionLayout,
};
