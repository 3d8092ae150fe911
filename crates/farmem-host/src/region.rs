//! The managed region as real mapped memory.
//!
//! One contiguous virtual range is reserved up front with no access;
//! pages gain zero-filled backing on demand and lose it on eviction.
//! "Removing" backing maps fresh no-access anonymous memory over the
//! page, which both discards the bytes and keeps the range reserved so
//! no foreign mapping can land in the middle of it.
//!
//! This is the only module in the workspace that hands out raw memory;
//! the unsafe blocks are confined to the mmap family and slice
//! construction over pages this type itself mapped.

use farmem_error::{FarmemError, Result};
use farmem_pager::region::RegionMemory;
use farmem_types::{AccessKind, BaseAddr, PageIndex, Protection, RegionLayout};
use tracing::{debug, warn};

fn prot_flags(protection: Protection) -> libc::c_int {
    match protection {
        Protection::None => libc::PROT_NONE,
        Protection::Read => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

fn last_os_error() -> String {
    std::io::Error::last_os_error().to_string()
}

/// End of the data segment, rounded up to `align`.
pub fn data_segment_end(align: usize) -> usize {
    // SAFETY: sbrk(0) only queries the current break.
    let brk = unsafe { libc::sbrk(0) } as usize;
    brk.div_ceil(align) * align
}

/// Resolve the preferred region base from the configuration.
pub fn preferred_base(base_addr: Option<BaseAddr>, default_base: usize) -> usize {
    match base_addr {
        None => default_base,
        Some(BaseAddr::Absolute(addr)) => addr,
        Some(BaseAddr::Delta(delta)) => (default_base as i64 + delta).max(0) as usize,
    }
}

/// The managed region, backed by anonymous mappings.
pub struct MappedRegion {
    base: *mut u8,
    extent: usize,
    page_size: usize,
    mlock: bool,
    /// Mirror of each page's protection, for the access model.
    protections: Vec<Protection>,
    backed: Vec<bool>,
}

// The engine mutates the region only under the global lock.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Reserve the whole region with no access.
    ///
    /// The preferred start is the end of the data segment rounded up to
    /// the logical page size, so not-quite-64-bit-clean programs can
    /// still keep small structures in low memory. A configured override
    /// must be honored exactly; without one, any placement the kernel
    /// offers is accepted.
    pub fn reserve(
        layout: &RegionLayout,
        base_addr: Option<BaseAddr>,
        mlock: bool,
    ) -> Result<Self> {
        let extent = layout.extent();
        let page_size = layout.page_size();
        let default_base = data_segment_end(page_size);
        let hint = preferred_base(base_addr, default_base);
        let must_be_exact = base_addr.is_some();

        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        // SAFETY: anonymous PROT_NONE reservation; MAP_FIXED_NOREPLACE
        // never clobbers existing mappings.
        let mut base = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                extent,
                libc::PROT_NONE,
                flags | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            if must_be_exact {
                return Err(FarmemError::RegionReserve {
                    addr: hint,
                    bytes: extent,
                    detail: last_os_error(),
                });
            }
            debug!(hint, "preferred placement unavailable, letting the kernel choose");
            // SAFETY: as above, minus the placement constraint.
            base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    extent,
                    libc::PROT_NONE,
                    flags,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(FarmemError::RegionReserve {
                    addr: 0,
                    bytes: extent,
                    detail: last_os_error(),
                });
            }
        }

        let pages = layout.num_pages() as usize;
        debug!(base = base as usize, extent, "managed region reserved");
        Ok(Self {
            base: base.cast(),
            extent,
            page_size,
            mlock,
            protections: vec![Protection::None; pages],
            backed: vec![false; pages],
        })
    }

    /// Absolute address of the region start.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base as usize
    }

    /// Total bytes in the region.
    #[must_use]
    pub fn extent(&self) -> usize {
        self.extent
    }

    /// Translate an absolute faulting address into a region-relative
    /// offset, or `None` when the address is not ours.
    #[must_use]
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        addr.checked_sub(self.base as usize)
            .filter(|&off| off < self.extent)
    }

    fn page_addr(&self, page: PageIndex) -> *mut u8 {
        // Pages are validated against the mirror vectors before use.
        unsafe { self.base.add(page.get() as usize * self.page_size) }
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

    /// Current protection of a page, from the mirror.
    #[must_use]
    pub fn protection(&self, page: PageIndex) -> Protection {
        self.protections[page.get() as usize]
    }
}

impl RegionMemory for MappedRegion {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn back(&mut self, start: PageIndex, count: usize, protection: Protection) -> Result<()> {
        let first = start.get() as usize;
        if first + count > self.backed.len() {
            return Err(FarmemError::BackingStore {
                op: "assign",
                addr: self.base as usize + first * self.page_size,
                bytes: count * self.page_size,
                detail: "range exceeds the region".into(),
            });
        }
        let addr = self.page_addr(start);
        let bytes = count * self.page_size;
        // SAFETY: fixed anonymous mapping entirely inside our reserved
        // range; MAP_FIXED replacement of our own pages is the intended
        // mechanism here.
        let mapped = unsafe {
            libc::mmap(
                addr.cast(),
                bytes,
                prot_flags(protection),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(FarmemError::BackingStore {
                op: "assign",
                addr: addr as usize,
                bytes,
                detail: last_os_error(),
            });
        }
        if self.mlock {
            // Best effort; a failed lock costs performance, not
            // correctness.
            // SAFETY: locking pages we just mapped.
            if unsafe { libc::mlock(addr.cast(), bytes) } != 0 {
                warn!(addr = addr as usize, bytes, "mlock failed: {}", last_os_error());
            }
        }
        for p in first..first + count {
            self.backed[p] = true;
            self.protections[p] = protection;
        }
        Ok(())
    }

    fn unback(&mut self, page: PageIndex) -> Result<()> {
        self.check_page(page)?;
        let addr = self.page_addr(page);
        // Replace with a fresh no-access reservation: the bytes are
        // discarded and the address range stays ours.
        // SAFETY: fixed anonymous mapping inside our reserved range.
        let mapped = unsafe {
            libc::mmap(
                addr.cast(),
                self.page_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(FarmemError::BackingStore {
                op: "remove",
                addr: addr as usize,
                bytes: self.page_size,
                detail: last_os_error(),
            });
        }
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
                addr: self.page_addr(page) as usize,
                detail: "page has no backing".into(),
            });
        }
        let addr = self.page_addr(page);
        // SAFETY: mprotect over one backed page of our own mapping.
        if unsafe { libc::mprotect(addr.cast(), self.page_size, prot_flags(protection)) } != 0 {
            return Err(FarmemError::Protect {
                addr: addr as usize,
                detail: last_os_error(),
            });
        }
        self.protections[idx] = protection;
        Ok(())
    }

    fn page(&self, page: PageIndex) -> &[u8] {
        debug_assert!(self.backed[page.get() as usize]);
        // SAFETY: the page is backed memory owned by this mapping. The
        // engine holds the global lock, so no user thread is mutating
        // the region concurrently.
        unsafe { std::slice::from_raw_parts(self.page_addr(page), self.page_size) }
    }

    fn page_mut(&mut self, page: PageIndex) -> &mut [u8] {
        debug_assert!(self.backed[page.get() as usize]);
        // SAFETY: as above, with exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.page_addr(page), self.page_size) }
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

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact range reserved at construction.
        unsafe {
            libc::munmap(self.base.cast(), self.extent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmem_types::{PageDistribution, PageSize};

    fn small_layout() -> RegionLayout {
        let os_page = crate::sysinfo::os_page_size();
        RegionLayout::new(
            PageSize::from_raw(os_page),
            4 * os_page,
            2,
            PageDistribution::RoundRobin,
        )
        .unwrap()
    }

    #[test]
    fn reserve_back_write_read_unback() {
        let layout = small_layout();
        let mut region = MappedRegion::reserve(&layout, None, false).unwrap();
        let p0 = PageIndex::new(0);

        assert!(!region.accessible(p0, AccessKind::Read));
        region.back(p0, 1, Protection::ReadWrite).unwrap();
        assert!(region.accessible(p0, AccessKind::Write));

        region.page_mut(p0)[7] = 0xAA;
        assert_eq!(region.page(p0)[7], 0xAA);

        region.unback(p0).unwrap();
        assert!(!region.accessible(p0, AccessKind::Read));

        // Backing again yields zeroed memory.
        region.back(p0, 1, Protection::ReadWrite).unwrap();
        assert_eq!(region.page(p0)[7], 0);
    }

    #[test]
    fn protections_are_mirrored() {
        let layout = small_layout();
        let mut region = MappedRegion::reserve(&layout, None, false).unwrap();
        let p1 = PageIndex::new(1);
        region.back(p1, 1, Protection::ReadWrite).unwrap();
        region.protect(p1, Protection::Read).unwrap();
        assert_eq!(region.protection(p1), Protection::Read);
        assert!(region.accessible(p1, AccessKind::Read));
        assert!(!region.accessible(p1, AccessKind::Write));
    }

    #[test]
    fn offsets_translate_only_inside_the_region() {
        let layout = small_layout();
        let region = MappedRegion::reserve(&layout, None, false).unwrap();
        let base = region.base();
        assert_eq!(region.offset_of(base), Some(0));
        assert_eq!(region.offset_of(base + 17), Some(17));
        assert_eq!(region.offset_of(base + region.extent()), None);
        assert_eq!(region.offset_of(base.wrapping_sub(1)), None);
    }

    #[test]
    fn delta_base_addresses_resolve() {
        assert_eq!(preferred_base(None, 0x1000), 0x1000);
        assert_eq!(
            preferred_base(Some(BaseAddr::Absolute(0x7000_0000)), 0x1000),
            0x7000_0000
        );
        assert_eq!(
            preferred_base(Some(BaseAddr::Delta(0x2000)), 0x1000),
            0x3000
        );
        assert_eq!(preferred_base(Some(BaseAddr::Delta(-0x500)), 0x1000), 0xb00);
    }

    #[test]
    fn forbidden_override_fails_loudly() {
        let layout = small_layout();
        // Page-aligned but absurd: far beyond the canonical user range.
        let bad = 0x7fff_ffff_0000_usize.wrapping_mul(0x1000);
        let result = MappedRegion::reserve(&layout, Some(BaseAddr::Absolute(bad)), false);
        assert!(result.is_err());
    }
}
