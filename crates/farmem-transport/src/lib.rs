//! Peer page-server protocol and transports.
//!
//! The master moves logical pages to and from peers over a reliable,
//! ordered, tag-demultiplexed messaging layer (the [`Fabric`]). Two
//! transport variants implement the same split-phase contract:
//!
//! - [`MessageTransport`] (message passing): a GET elicits a RESPONSE;
//!   a put is a `PUT_OFFSET · PUT_DATA` two-message sequence. Peers run
//!   an event loop serving their buffer.
//! - [`SharedTransport`] (one-sided): peers publish their buffers and
//!   the master reads/writes them directly, keyed by `(holder, offset)`.
//!
//! The master never communicates with itself; rank 0 holds no buffer.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod fabric;
pub mod message;
pub mod onesided;
pub mod peer;
pub mod wire;

pub use cluster::{spawn_cluster, ClusterOptions, FaultProbe, NoFaultProbe};
pub use fabric::{ChannelFabric, Fabric, Message};
pub use message::MessageTransport;
pub use onesided::{SharedCluster, SharedTransport};
pub use peer::PeerServer;
pub use wire::{OffsetCodec, Tag};

use farmem_error::Result;
use farmem_types::RemoteRef;

/// Handle to an in-flight page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket(pub(crate) usize);

/// Handle to an in-flight page eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictTicket(pub(crate) usize);

/// Split-phase page movement between the master and the holder peers.
///
/// At most [`MAX_PENDING_FETCHES`] fetches and
/// [`MAX_PENDING_EVICTIONS`] evictions may be outstanding; exceeding a
/// cap is an invariant error, not a queueing request.
pub trait PageTransport: Send {
    /// The logical page size every transfer moves.
    fn page_size(&self) -> usize;

    /// Begin reading one page from `src`.
    fn fetch_begin(&mut self, src: RemoteRef) -> Result<FetchTicket>;

    /// Block until the fetch completes and copy the page into `dst`.
    fn fetch_end(&mut self, ticket: FetchTicket, dst: &mut [u8]) -> Result<()>;

    /// Begin writing one page (`data`) to `dst`.
    fn evict_begin(&mut self, dst: RemoteRef, data: &[u8]) -> Result<EvictTicket>;

    /// Block until the eviction completes.
    fn evict_end(&mut self, ticket: EvictTicket) -> Result<()>;

    /// Broadcast a termination command to all peers.
    fn finalize(&mut self) -> Result<()>;
}

/// Cap on concurrently outstanding fetches.
pub const MAX_PENDING_FETCHES: usize = 2;

/// Cap on concurrently outstanding evictions.
pub const MAX_PENDING_EVICTIONS: usize = 2;
