//! Backing-store abstraction for the managed region.
//!
//! The engine manipulates the region only through [`RegionMemory`]:
//! assigning zero-filled backing to a page range, dropping a page's
//! backing, changing protections, and reaching the bytes of a backed
//! page. The hosted implementation maps real memory; [`MemRegion`]
//! here is the in-memory implementation used by tests and by the
//! simulated single-process deployment, and additionally models the
//! MMU's view so callers can ask whether an access would trap.

use farmem_error::{FarmemError, Result};
use farmem_types::{AccessKind, PageIndex, Protection, RegionLayout};

/// The managed region as the engine sees it.
pub trait RegionMemory: Send {
    /// Bytes per page.
    fn page_size(&self) -> usize;

    /// Assign zero-filled backing to `count` pages starting at `start`,
    /// with the given protection. Re-backing a page discards its bytes.
    fn back(&mut self, start: PageIndex, count: usize, protection: Protection) -> Result<()>;

    /// Drop a page's backing; subsequent accesses trap.
    fn unback(&mut self, page: PageIndex) -> Result<()>;

    /// Change a backed page's protection.
    fn protect(&mut self, page: PageIndex, protection: Protection) -> Result<()>;

    /// Read access to a backed page's bytes (engine-side; ignores
    /// protection, like the kernel servicing its own fault handler).
    fn page(&self, page: PageIndex) -> &[u8];

    /// Write access to a backed page's bytes.
    fn page_mut(&mut self, page: PageIndex) -> &mut [u8];

    /// Whether a user-mode access of `kind` would proceed without
    /// trapping.
    fn accessible(&self, page: PageIndex, kind: AccessKind) -> bool;
}

/// In-memory region with modeled protections.
pub struct MemRegion {
    page_size: usize,
    data: Vec<u8>,
    /// Per-page protection; `None` protection means any access traps.
    protections: Vec<Protection>,
    backed: Vec<bool>,
}

impl MemRegion {
    #[must_use]
    pub fn new(layout: &RegionLayout) -> Self {
        let pages = layout.num_pages() as usize;
        Self {
            page_size: layout.page_size(),
            data: vec![0u8; layout.extent()],
            protections: vec![Protection::None; pages],
            backed: vec![false; pages],
        }
    }

    fn range(&self, page: PageIndex) -> std::ops::Range<usize> {
        let start = page.get() as usize * self.page_size;
        start..start + self.page_size
    }

    fn check_page(&self, page: PageIndex) -> Result<()> {
        if (page.get() as usize) < self.backed.len() {
            Ok(())
        } else {
            Err(FarmemError::internal(format!(
                "page {page} is outside the region"
            )))
        }
    }

    /// Current protection of a page (tests).
    #[must_use]
    pub fn protection(&self, page: PageIndex) -> Protection {
        self.protections[page.get() as usize]
    }

    /// Whether a page currently has backing (tests).
    #[must_use]
    pub fn is_backed(&self, page: PageIndex) -> bool {
        self.backed[page.get() as usize]
    }
}

impl RegionMemory for MemRegion {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn back(&mut self, start: PageIndex, count: usize, protection: Protection) -> Result<()> {
        let first = start.get() as usize;
        let last = first
            .checked_add(count)
            .filter(|&end| end <= self.backed.len())
            .ok_or_else(|| FarmemError::BackingStore {
                op: "assign",
                addr: first * self.page_size,
                bytes: count * self.page_size,
                detail: "range exceeds the region".into(),
            })?;
        for p in first..last {
            let range = self.range(PageIndex::new(p as u32));
            self.data[range].fill(0);
            self.backed[p] = true;
            self.protections[p] = protection;
        }
        Ok(())
    }

    fn unback(&mut self, page: PageIndex) -> Result<()> {
        self.check_page(page)?;
        let idx = page.get() as usize;
        self.backed[idx] = false;
        self.protections[idx] = Protection::None;
        Ok(())
    }

    fn protect(&mut self, page: PageIndex, protection: Protection) -> Result<()> {
        self.check_page(page)?;
        let idx = page.get() as usize;
        if !self.backed[idx] {
            return Err(FarmemError::Protect {
                addr: idx * self.page_size,
                detail: "page has no backing".into(),
            });
        }
        self.protections[idx] = protection;
        Ok(())
    }

    fn page(&self, page: PageIndex) -> &[u8] {
        let range = self.range(page);
        &self.data[range]
    }

    fn page_mut(&mut self, page: PageIndex) -> &mut [u8] {
        let range = self.range(page);
        &mut self.data[range]
    }

    fn accessible(&self, page: PageIndex, kind: AccessKind) -> bool {
        let idx = page.get() as usize;
        if idx >= self.backed.len() || !self.backed[idx] {
            return false;
        }
        match kind {
            AccessKind::Read => self.protections[idx].allows_read(),
            AccessKind::Write => self.protections[idx].allows_write(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmem_types::{PageDistribution, PageSize};

    fn region() -> MemRegion {
        let layout = RegionLayout::new(
            PageSize::from_raw(256),
            4 * 256,
            2,
            PageDistribution::RoundRobin,
        )
        .unwrap();
        MemRegion::new(&layout)
    }

    #[test]
    fn unbacked_pages_trap_every_access() {
        let r = region();
        assert!(!r.accessible(PageIndex::new(0), AccessKind::Read));
        assert!(!r.accessible(PageIndex::new(0), AccessKind::Write));
    }

    #[test]
    fn backing_zero_fills_and_applies_protection() {
        let mut r = region();
        r.page_mut(PageIndex::new(1)).fill(0xFF); // stale bytes
        r.back(PageIndex::new(0), 2, Protection::Read).unwrap();

        assert!(r.page(PageIndex::new(1)).iter().all(|&b| b == 0));
        assert!(r.accessible(PageIndex::new(1), AccessKind::Read));
        assert!(!r.accessible(PageIndex::new(1), AccessKind::Write));
    }

    #[test]
    fn protect_upgrades_and_downgrades() {
        let mut r = region();
        r.back(PageIndex::new(3), 1, Protection::ReadWrite).unwrap();
        assert!(r.accessible(PageIndex::new(3), AccessKind::Write));

        r.protect(PageIndex::new(3), Protection::Read).unwrap();
        assert!(!r.accessible(PageIndex::new(3), AccessKind::Write));
        assert!(r.accessible(PageIndex::new(3), AccessKind::Read));
    }

    #[test]
    fn unback_revokes_everything() {
        let mut r = region();
        r.back(PageIndex::new(2), 1, Protection::ReadWrite).unwrap();
        r.unback(PageIndex::new(2)).unwrap();
        assert!(!r.accessible(PageIndex::new(2), AccessKind::Read));
        assert!(r.protect(PageIndex::new(2), Protection::Read).is_err());
    }

    #[test]
    fn backing_out_of_range_is_rejected() {
        let mut r = region();
        assert!(r.back(PageIndex::new(7), 2, Protection::Read).is_err());
    }
}
