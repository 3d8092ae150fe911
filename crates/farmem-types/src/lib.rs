//! Core types for the farmem memory server.
//!
//! farmem presents the pooled RAM of many peers as one contiguous
//! virtual region on the master. The types here describe that region:
//! page indices and peer ranks, page protections, and the
//! [`RegionLayout`] that maps every byte of the region to the peer
//! holding its authoritative copy.

#![forbid(unsafe_code)]

pub mod config;

pub use config::{
    AmountSpec, BaseAddr, CountSpec, EngineConfig, PageSizeSpec, PolicyKind, PrefetchKind,
};

use std::fmt;

use farmem_error::{FarmemError, Result};

/// Index of a logical page within the managed region.
///
/// Page 0 is the first page of the region; indices are dense in
/// `[0, extent / page_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[repr(transparent)]
pub struct PageIndex(u32);

impl PageIndex {
    /// Create a page index from a raw u32.
    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Get the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The page `delta` pages after this one, or `None` on overflow or
    /// when a negative delta underflows.
    #[inline]
    #[must_use]
    pub fn offset_by(self, delta: i64) -> Option<Self> {
        let n = i64::from(self.0).checked_add(delta)?;
        u32::try_from(n).ok().map(Self)
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A rank in the deployment. Rank 0 is the master; ranks `1..=n` are
/// peers holding memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[repr(transparent)]
pub struct PeerRank(u32);

impl PeerRank {
    /// The master rank.
    pub const MASTER: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// True for rank 0.
    #[inline]
    #[must_use]
    pub const fn is_master(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PeerRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical page size in bytes.
///
/// Must be a nonzero multiple of the OS page size. Unlike a database
/// page size there is no power-of-two requirement; the minimum safe
/// size is derived from the kernel's per-process mapping limit and can
/// be any multiple of the OS page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct PageSize(usize);

impl PageSize {
    /// Validate `bytes` against the OS page size `os_page`.
    pub fn new(bytes: usize, os_page: usize) -> Result<Self> {
        if bytes == 0 || os_page == 0 || bytes % os_page != 0 {
            return Err(FarmemError::Config {
                key: "FM_PAGESIZE".into(),
                value: bytes.to_string(),
                reason: "must be a positive multiple of the OS page size",
            });
        }
        Ok(Self(bytes))
    }

    /// Construct without validation. Reserved for layouts built from
    /// already-validated sizes (and for tests).
    #[inline]
    #[must_use]
    pub const fn from_raw(bytes: usize) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a user access wants to do to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum AccessKind {
    Read,
    Write,
}

/// Page protection, in increasing order of access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Protection {
    /// No access; touching the page faults.
    None,
    /// Read-only; writes fault.
    Read,
    /// Full access.
    ReadWrite,
}

impl Protection {
    /// True when writes are permitted.
    #[inline]
    #[must_use]
    pub const fn allows_write(self) -> bool {
        matches!(self, Self::ReadWrite)
    }

    /// True when reads are permitted.
    #[inline]
    #[must_use]
    pub const fn allows_read(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// How logical pages are distributed among peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PageDistribution {
    /// Adjacent pages go to adjacent peers.
    RoundRobin,
    /// One peer's memory is filled before the next peer's is used.
    Block,
}

/// The holder-side location of a logical page: which peer stores it and
/// at what byte offset inside that peer's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteRef {
    /// The peer holding the authoritative bytes (never the master).
    pub holder: PeerRank,
    /// Byte offset within the holder's buffer.
    pub offset: u64,
}

/// Geometry of the managed region.
///
/// Every byte of the region has exactly one holder peer and one offset
/// in that peer's buffer; [`RegionLayout::remote_ref`] computes it. All
/// offsets here are region-relative; the host layer owns the mapping to
/// absolute addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    page_size: usize,
    per_peer_bytes: usize,
    num_peers: u32,
    distribution: PageDistribution,
}

impl RegionLayout {
    /// Build a layout. `per_peer_bytes` must be a nonzero multiple of
    /// the page size and the total page count must fit in a `u32`.
    pub fn new(
        page_size: PageSize,
        per_peer_bytes: usize,
        num_peers: u32,
        distribution: PageDistribution,
    ) -> Result<Self> {
        let page = page_size.get();
        if num_peers == 0 {
            return Err(FarmemError::TransportInit {
                detail: "at least one peer is required".into(),
            });
        }
        if per_peer_bytes == 0 || per_peer_bytes % page != 0 {
            return Err(FarmemError::Config {
                key: "FM_SLAVEMEM".into(),
                value: per_peer_bytes.to_string(),
                reason: "per-peer bytes must be a positive multiple of the page size",
            });
        }
        let extent = per_peer_bytes
            .checked_mul(num_peers as usize)
            .ok_or_else(|| FarmemError::internal("region extent overflows usize"))?;
        if u32::try_from(extent / page).is_err() {
            return Err(FarmemError::internal("region page count overflows u32"));
        }
        Ok(Self {
            page_size: page,
            per_peer_bytes,
            num_peers,
            distribution,
        })
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    #[must_use]
    pub const fn per_peer_bytes(&self) -> usize {
        self.per_peer_bytes
    }

    #[inline]
    #[must_use]
    pub const fn num_peers(&self) -> u32 {
        self.num_peers
    }

    #[inline]
    #[must_use]
    pub const fn distribution(&self) -> PageDistribution {
        self.distribution
    }

    /// Total bytes in the region.
    #[inline]
    #[must_use]
    pub const fn extent(&self) -> usize {
        self.per_peer_bytes * self.num_peers as usize
    }

    /// Total logical pages in the region.
    #[inline]
    #[must_use]
    pub fn num_pages(&self) -> u32 {
        (self.extent() / self.page_size) as u32
    }

    /// True when the region-relative byte offset lies inside the region.
    #[inline]
    #[must_use]
    pub fn contains(&self, offset: usize) -> bool {
        offset < self.extent()
    }

    /// Round a byte offset down to its page start.
    #[inline]
    #[must_use]
    pub fn round_down(&self, offset: usize) -> usize {
        offset - offset % self.page_size
    }

    /// The page containing a byte offset.
    #[inline]
    #[must_use]
    pub fn page_of(&self, offset: usize) -> PageIndex {
        PageIndex::new((offset / self.page_size) as u32)
    }

    /// Byte offset of the start of a page.
    #[inline]
    #[must_use]
    pub fn page_start(&self, page: PageIndex) -> usize {
        page.get() as usize * self.page_size
    }

    /// The holder peer and holder-buffer offset for a page.
    ///
    /// Holder ranks are `1..=num_peers`; rank 0 (the master) never
    /// holds pages.
    #[must_use]
    pub fn remote_ref(&self, page: PageIndex) -> RemoteRef {
        let page_no = page.get() as usize;
        match self.distribution {
            PageDistribution::RoundRobin => RemoteRef {
                holder: PeerRank::new(1 + (page_no % self.num_peers as usize) as u32),
                offset: ((page_no / self.num_peers as usize) * self.page_size) as u64,
            },
            PageDistribution::Block => {
                let byte_offset = page_no * self.page_size;
                RemoteRef {
                    holder: PeerRank::new(1 + (byte_offset / self.per_peer_bytes) as u32),
                    offset: (byte_offset % self.per_peer_bytes) as u64,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn layout(dist: PageDistribution) -> RegionLayout {
        RegionLayout::new(PageSize::from_raw(4096), 16 * 4096, 3, dist).unwrap()
    }

    #[test]
    fn page_index_offsets() {
        let p = PageIndex::new(10);
        assert_eq!(p.offset_by(5), Some(PageIndex::new(15)));
        assert_eq!(p.offset_by(-10), Some(PageIndex::new(0)));
        assert_eq!(p.offset_by(-11), None);
    }

    #[test]
    fn page_size_rejects_non_multiples() {
        assert!(PageSize::new(4096, 4096).is_ok());
        assert!(PageSize::new(8192, 4096).is_ok());
        assert!(PageSize::new(6000, 4096).is_err());
        assert!(PageSize::new(0, 4096).is_err());
    }

    #[test]
    fn round_robin_spreads_adjacent_pages() {
        let l = layout(PageDistribution::RoundRobin);
        assert_eq!(l.remote_ref(PageIndex::new(0)).holder, PeerRank::new(1));
        assert_eq!(l.remote_ref(PageIndex::new(1)).holder, PeerRank::new(2));
        assert_eq!(l.remote_ref(PageIndex::new(2)).holder, PeerRank::new(3));
        assert_eq!(l.remote_ref(PageIndex::new(3)).holder, PeerRank::new(1));
        assert_eq!(l.remote_ref(PageIndex::new(3)).offset, 4096);
    }

    #[test]
    fn block_fills_one_peer_first() {
        let l = layout(PageDistribution::Block);
        assert_eq!(l.remote_ref(PageIndex::new(0)).holder, PeerRank::new(1));
        assert_eq!(l.remote_ref(PageIndex::new(15)).holder, PeerRank::new(1));
        assert_eq!(l.remote_ref(PageIndex::new(16)).holder, PeerRank::new(2));
        assert_eq!(l.remote_ref(PageIndex::new(16)).offset, 0);
        assert_eq!(l.remote_ref(PageIndex::new(47)).holder, PeerRank::new(3));
    }

    #[test]
    fn offsets_round_trip_through_pages() {
        let l = layout(PageDistribution::RoundRobin);
        assert_eq!(l.page_of(0), PageIndex::new(0));
        assert_eq!(l.page_of(4095), PageIndex::new(0));
        assert_eq!(l.page_of(4096), PageIndex::new(1));
        assert_eq!(l.round_down(4097), 4096);
        assert_eq!(l.page_start(PageIndex::new(2)), 8192);
    }

    #[test]
    fn master_never_holds_pages() {
        for dist in [PageDistribution::RoundRobin, PageDistribution::Block] {
            let l = layout(dist);
            for p in 0..l.num_pages() {
                let r = l.remote_ref(PageIndex::new(p));
                assert!(!r.holder.is_master());
                assert!(r.holder.get() <= l.num_peers());
            }
        }
    }

    proptest! {
        /// Every page's (holder, offset) pair is unique and offsets stay
        /// within the holder's buffer, for both distributions.
        #[test]
        fn holder_mapping_is_injective(
            peers in 1u32..8,
            pages_per_peer in 1usize..64,
            block in proptest::bool::ANY,
        ) {
            let page = 4096usize;
            let dist = if block { PageDistribution::Block } else { PageDistribution::RoundRobin };
            let l = RegionLayout::new(
                PageSize::from_raw(page),
                pages_per_peer * page,
                peers,
                dist,
            ).unwrap();

            let mut seen = std::collections::HashSet::new();
            for p in 0..l.num_pages() {
                let r = l.remote_ref(PageIndex::new(p));
                prop_assert!(r.holder.get() >= 1 && r.holder.get() <= peers);
                prop_assert!((r.offset as usize) < l.per_peer_bytes());
                prop_assert_eq!(r.offset as usize % page, 0);
                prop_assert!(seen.insert((r.holder, r.offset)), "duplicate holder slot");
            }
        }
    }
}
