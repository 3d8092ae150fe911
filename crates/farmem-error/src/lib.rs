//! Error types for the farmem memory server.
//!
//! Every failure the engine can report falls into one of three
//! categories (see [`ErrorCategory`]):
//!
//! - **Invariant** violations mean the paging subsystem itself is
//!   corrupt. They are fatal: the caller is expected to run the abort
//!   path, not to recover.
//! - **Environment** failures happen at startup when a required OS
//!   resource cannot be obtained. Also fatal, with a diagnostic naming
//!   the offending resource.
//! - **Transient** conditions are recovered locally and never surface
//!   to the user program; the variants exist so recovery sites can log
//!   a structured reason.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for farmem operations.
#[derive(Error, Debug)]
pub enum FarmemError {
    // === Page-table / engine invariants ===
    /// A page was deleted from the page table twice without an
    /// intervening insert.
    #[error("internal error: two page-table deletions with no intervening insertion")]
    DoubleDelete,

    /// Deletion of a page that is not in the table.
    #[error("internal error: attempted to delete nonexistent page {page}")]
    DeleteMissing { page: u32 },

    /// More pages inserted than the table was sized for.
    #[error("a page table with {capacity} entries overflowed")]
    PageTableOverflow { capacity: usize },

    /// A rank query outside `[0, len)`.
    #[error("page-table rank {rank} is out of bounds (len {len})")]
    RankOutOfBounds { rank: usize, len: usize },

    /// The fault handler was reentered for a different address while a
    /// fault was already being serviced.
    #[error("faulted on page {page} while processing the fault on page {pending}")]
    ReentrantFault { page: u32, pending: u32 },

    /// An asynchronous operation slot was reused while still occupied.
    #[error("too many concurrent {kind} operations are outstanding")]
    SlotBusy { kind: &'static str },

    /// An internal allocation landed inside the managed region.
    #[error("internal error: internal buffer {addr:#x} is within the managed region")]
    InternalAllocInRegion { addr: usize },

    /// A page was evicted before the cache had even filled.
    #[error("page {page} was evicted prematurely")]
    PrematureEviction { page: u32 },

    // === Wire protocol ===
    /// A message tag arrived out of sequence.
    #[error("expected wire tag {expected} but received tag {actual}")]
    ProtocolSequence { expected: u8, actual: u8 },

    /// An unknown tag arrived.
    #[error("unrecognized wire tag {tag}")]
    UnknownTag { tag: u8 },

    /// A message body had the wrong length for its tag.
    #[error("wire message with tag {tag} has length {actual}, expected {expected}")]
    WireLength {
        tag: u8,
        expected: usize,
        actual: usize,
    },

    /// The fabric failed to deliver or accept a message.
    #[error("transport failure: {detail}")]
    Transport { detail: String },

    // === Startup / environment ===
    /// Available physical memory could not be determined.
    #[error(
        "failed to determine the available physical memory; \
         FM_SLAVEMEM and either FM_MASTERMEM or FM_LOCAL_PAGES need to be set explicitly"
    )]
    NoPhysicalMemory,

    /// Not even one page of cache memory could be obtained.
    #[error("too little memory is available to cache locally even one remote page")]
    NoCachePage,

    /// A replacement policy needs more local pages than are available.
    #[error("a minimum of {needed} local pages is needed for {policy} page replacement")]
    TooFewLocalPages { policy: &'static str, needed: usize },

    /// The access-violation handler could not be installed or restored.
    #[error("failed to install the access-violation handler: {detail}")]
    SignalInstall { detail: String },

    /// Transport/cluster initialization failed.
    #[error("transport initialization failed: {detail}")]
    TransportInit { detail: String },

    /// The managed region could not be reserved at a mandated address.
    #[error("failed to map {bytes} bytes of address space at {addr:#x}: {detail}")]
    RegionReserve {
        addr: usize,
        bytes: usize,
        detail: String,
    },

    /// Assigning or removing backing store failed.
    #[error("failed to {op} backing store for {bytes} bytes at {addr:#x}: {detail}")]
    BackingStore {
        op: &'static str,
        addr: usize,
        bytes: usize,
        detail: String,
    },

    /// Changing page protections failed.
    #[error("failed to set access permissions on page at {addr:#x}: {detail}")]
    Protect { addr: usize, detail: String },

    /// A configuration variable had a malformed value.
    #[error("{key} has invalid value \"{value}\": {reason}")]
    Config {
        key: String,
        value: String,
        reason: &'static str,
    },

    /// A required file could not be read (e.g. the kernel meminfo file).
    #[error("unable to read {path}: {detail}")]
    ProcRead { path: PathBuf, detail: String },

    /// Plain I/O error from the host layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Transient, recovered locally ===
    /// A peer thread did not freeze within the timeout; the fault
    /// proceeded anyway.
    #[error("thread {tid} failed to freeze after {timeout_ms} ms")]
    FreezeTimeout { tid: i32, timeout_ms: u64 },

    /// Catch-all internal error with a human-readable detail string.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the abort path and by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Subsystem corruption; the process must abort.
    Invariant,
    /// A required startup resource was unavailable; abort with a
    /// diagnostic naming it.
    Environment,
    /// Recovered locally; never user-visible.
    Transient,
}

impl FarmemError {
    /// Build an [`FarmemError::Internal`] from anything stringifiable.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// Which of the three failure classes this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DoubleDelete
            | Self::DeleteMissing { .. }
            | Self::PageTableOverflow { .. }
            | Self::RankOutOfBounds { .. }
            | Self::ReentrantFault { .. }
            | Self::SlotBusy { .. }
            | Self::InternalAllocInRegion { .. }
            | Self::PrematureEviction { .. }
            | Self::ProtocolSequence { .. }
            | Self::UnknownTag { .. }
            | Self::WireLength { .. }
            | Self::Internal(_) => ErrorCategory::Invariant,

            Self::NoPhysicalMemory
            | Self::NoCachePage
            | Self::TooFewLocalPages { .. }
            | Self::SignalInstall { .. }
            | Self::TransportInit { .. }
            | Self::RegionReserve { .. }
            | Self::BackingStore { .. }
            | Self::Protect { .. }
            | Self::Config { .. }
            | Self::ProcRead { .. }
            | Self::Transport { .. }
            | Self::Io(_) => ErrorCategory::Environment,

            Self::FreezeTimeout { .. } => ErrorCategory::Transient,
        }
    }

    /// True when the process has no sane way to continue.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Transient)
    }
}

/// Result alias used throughout the workspace.
pub type Result<T, E = FarmemError> = std::result::Result<T, E>;
