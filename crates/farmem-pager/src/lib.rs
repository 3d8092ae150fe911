//! The master-side software paging engine of the farmem memory server.
//!
//! A user program on the master sees one huge contiguous memory region.
//! Only a small window of it is backed locally; the rest lives in the
//! RAM of peer nodes. When the program touches an unbacked page the
//! access traps, [`PagingEngine::service_fault`] fetches the page from
//! its holder, evicts a resident page chosen by the configured
//! [`policy`], and the trapped instruction resumes.

#![forbid(unsafe_code)]

pub mod clock;
pub mod engine;
pub mod page_table;
pub mod policy;
pub mod region;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineOptions, FaultOutcome, PagingEngine};
pub use page_table::PageTable;
pub use policy::{
    build_policy, FifoPolicy, NrePolicy, NruOptions, NruPolicy, Placement, PolicyConfig,
    RandomPolicy, ReplacementPolicy, Residency,
};
pub use region::{MemRegion, RegionMemory};
pub use stats::EngineStats;

pub use farmem_types::AccessKind;
