//! First-in-first-out replacement.
//!
//! A circular array of resident page indices; the eviction cursor
//! advances one slot per eviction. New pages are always admitted
//! read+write and victims are always reported dirty, so there is no
//! residency index to answer prefetch queries from.

use farmem_error::{FarmemError, Result};
use farmem_types::{AccessKind, PageIndex, Protection};
use tracing::debug;

use super::{Placement, Residency, ReplacementPolicy};

pub struct FifoPolicy {
    used: Vec<PageIndex>,
    capacity: usize,
    next_evict: usize,
}

impl FifoPolicy {
    pub fn new(local_pages: usize) -> Result<Self> {
        if local_pages < 1 {
            return Err(FarmemError::TooFewLocalPages {
                policy: "FIFO",
                needed: 1,
            });
        }
        debug!(local_pages, "fifo replacement initialized");
        Ok(Self {
            used: Vec::with_capacity(local_pages),
            capacity: local_pages,
            next_evict: 0,
        })
    }
}

impl ReplacementPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn place(&mut self, page: PageIndex) -> Result<Placement> {
        if self.used.len() < self.capacity {
            self.used.push(page);
            return Ok(Placement {
                protection: Protection::ReadWrite,
                victim: None,
                victim_clean: false,
            });
        }
        let victim = self.used[self.next_evict];
        self.used[self.next_evict] = page;
        self.next_evict = (self.next_evict + 1) % self.capacity;
        Ok(Placement {
            protection: Protection::ReadWrite,
            victim: Some(victim),
            victim_clean: false,
        })
    }

    fn upgrade(&mut self, _page: PageIndex, _kind: AccessKind) -> Option<Protection> {
        // Pages are never admitted read-only, so a fault always means
        // the page is gone.
        None
    }

    fn residency(&self, _page: PageIndex) -> Residency {
        Residency::Unknown
    }
}
