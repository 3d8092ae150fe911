//! One-sided transport (variant B).
//!
//! Peers publish their buffer once at startup; the master then moves
//! pages with direct put/get operations keyed by `(holder, offset)` and
//! waits on opaque handles. There is no peer event loop — the holder
//! side is passive storage, which is exactly the published-segment
//! model.

use std::sync::Arc;

use farmem_error::{FarmemError, Result};
use farmem_types::{PeerRank, RemoteRef};
use parking_lot::Mutex;
use tracing::debug;

use crate::{EvictTicket, FetchTicket, PageTransport, MAX_PENDING_EVICTIONS, MAX_PENDING_FETCHES};

/// One peer's published buffer.
type Segment = Arc<Mutex<Vec<u8>>>;

/// The published buffers of every peer, indexable by holder rank.
#[derive(Clone)]
pub struct SharedCluster {
    segments: Vec<Segment>,
}

impl SharedCluster {
    /// Publish `num_peers` zeroed buffers of `per_peer_bytes` each.
    #[must_use]
    pub fn new(num_peers: u32, per_peer_bytes: usize) -> Self {
        Self {
            segments: (0..num_peers)
                .map(|_| Arc::new(Mutex::new(vec![0u8; per_peer_bytes])))
                .collect(),
        }
    }

    /// The segment published by `holder` (ranks `1..=num_peers`).
    fn segment(&self, holder: PeerRank) -> Result<&Segment> {
        if holder.is_master() {
            return Err(FarmemError::internal("the master publishes no buffer"));
        }
        self.segments
            .get(holder.get() as usize - 1)
            .ok_or_else(|| FarmemError::Transport {
                detail: format!("no published buffer for rank {holder}"),
            })
    }

    /// Direct read access for tests.
    #[must_use]
    pub fn snapshot(&self, holder: PeerRank) -> Option<Vec<u8>> {
        self.segments
            .get(holder.get() as usize - 1)
            .map(|s| s.lock().clone())
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingFetch {
    src: RemoteRef,
}

#[derive(Debug)]
struct PendingEvict {
    dst: RemoteRef,
    data: Vec<u8>,
}

/// Master-side one-sided transport.
pub struct SharedTransport {
    cluster: SharedCluster,
    page_size: usize,
    fetches: [Option<PendingFetch>; MAX_PENDING_FETCHES],
    evicts: [Option<PendingEvict>; MAX_PENDING_EVICTIONS],
    terminated: bool,
}

impl SharedTransport {
    #[must_use]
    pub fn new(cluster: SharedCluster, page_size: usize) -> Self {
        Self {
            cluster,
            page_size,
            fetches: Default::default(),
            evicts: Default::default(),
            terminated: false,
        }
    }

    fn check_range(&self, remote: RemoteRef) -> Result<std::ops::Range<usize>> {
        let seg = self.cluster.segment(remote.holder)?;
        let len = seg.lock().len();
        let start = usize::try_from(remote.offset)
            .map_err(|_| FarmemError::internal("offset exceeds address width"))?;
        match start.checked_add(self.page_size).filter(|&e| e <= len) {
            Some(end) => Ok(start..end),
            None => Err(FarmemError::internal(format!(
                "offset {} is outside rank {}'s {len}-byte buffer",
                remote.offset, remote.holder
            ))),
        }
    }
}

impl PageTransport for SharedTransport {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn fetch_begin(&mut self, src: RemoteRef) -> Result<FetchTicket> {
        self.check_range(src)?;
        let slot = self
            .fetches
            .iter()
            .position(Option::is_none)
            .ok_or(FarmemError::SlotBusy { kind: "fetch" })?;
        self.fetches[slot] = Some(PendingFetch { src });
        Ok(FetchTicket(slot))
    }

    fn fetch_end(&mut self, ticket: FetchTicket, dst: &mut [u8]) -> Result<()> {
        let pending = self.fetches[ticket.0]
            .take()
            .ok_or_else(|| FarmemError::internal("fetch_end on an idle slot"))?;
        let range = self.check_range(pending.src)?;
        let seg = self.cluster.segment(pending.src.holder)?;
        dst.copy_from_slice(&seg.lock()[range]);
        Ok(())
    }

    fn evict_begin(&mut self, dst: RemoteRef, data: &[u8]) -> Result<EvictTicket> {
        if data.len() != self.page_size {
            return Err(FarmemError::WireLength {
                tag: crate::wire::Tag::PutData.raw(),
                expected: self.page_size,
                actual: data.len(),
            });
        }
        self.check_range(dst)?;
        let slot = self
            .evicts
            .iter()
            .position(Option::is_none)
            .ok_or(FarmemError::SlotBusy { kind: "evict" })?;
        self.evicts[slot] = Some(PendingEvict {
            dst,
            data: data.to_vec(),
        });
        Ok(EvictTicket(slot))
    }

    fn evict_end(&mut self, ticket: EvictTicket) -> Result<()> {
        let pending = self.evicts[ticket.0]
            .take()
            .ok_or_else(|| FarmemError::internal("evict_end on an idle slot"))?;
        let range = self.check_range(pending.dst)?;
        let seg = self.cluster.segment(pending.dst.holder)?;
        seg.lock()[range].copy_from_slice(&pending.data);
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        debug!("one-sided transport finalizing");
        self.terminated = true;
        Ok(())
    }
}
