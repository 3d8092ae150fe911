//! Fixed-capacity residency table.
//!
//! A chained hash keyed by page index. Entries live in a dense slot
//! array sized at capacity, so rank queries (`at_rank`) index it
//! directly; chain links live in a separate arena and are referenced by
//! index, never by pointer.
//!
//! The table is built for the eviction cycle's strict rhythm: a delete
//! is always immediately followed by an insert, and the insert reuses
//! both the detached chain link and the detached entry slot. The
//! structure detects discipline violations (two deletes with no
//! intervening insert, deleting an absent key, inserting past capacity)
//! and reports them as invariant errors.

use farmem_error::{FarmemError, Result};
use farmem_types::PageIndex;

/// Multiplicative-hash primes, large enough to scatter small indices.
const BIG_PRIME_A: u64 = 34_359_738_641;
const BIG_PRIME_B: u64 = 1_152_921_504_606_847_229;

/// Bucket-count ladder: roughly doubling primes.
const BUCKET_PRIMES: [usize; 21] = [
    11, 23, 53, 107, 223, 449, 907, 1823, 3659, 7321, 14653, 29311, 58631, 117_269, 234_539,
    469_099, 938_207, 1_876_417, 3_752_839, 7_505_681, 15_011_389,
];

/// Smallest ladder prime at least twice the capacity.
fn bucket_count(capacity: usize) -> usize {
    let want = capacity.saturating_mul(2).max(2);
    BUCKET_PRIMES
        .iter()
        .copied()
        .find(|&p| p >= want)
        .unwrap_or(*BUCKET_PRIMES.last().unwrap())
}

#[derive(Debug, Clone, Copy)]
struct Link {
    /// Index into the dense slot array.
    slot: u32,
    /// Next link in this bucket's chain.
    next: Option<u32>,
}

#[derive(Debug, Clone)]
struct Slot<P> {
    page: PageIndex,
    payload: P,
}

/// Hash-indexed residency map with a stable payload slot per entry.
pub struct PageTable<P> {
    slots: Vec<Slot<P>>,
    buckets: Vec<Option<u32>>,
    links: Vec<Link>,
    /// Link (and with it, slot) detached by the last delete, reused by
    /// the next insert.
    dead_link: Option<u32>,
    len: usize,
    capacity: usize,
}

impl<P> PageTable<P> {
    /// Create a table holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            buckets: vec![None; bucket_count(capacity)],
            links: Vec::with_capacity(capacity),
            dead_link: None,
            len: 0,
            capacity,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn bucket_of(&self, page: PageIndex) -> usize {
        let mixed = u64::from(page.get())
            .wrapping_add(BIG_PRIME_B)
            .wrapping_mul(BIG_PRIME_A);
        (mixed % self.buckets.len() as u64) as usize
    }

    fn find_link(&self, page: PageIndex) -> Option<u32> {
        let mut cursor = self.buckets[self.bucket_of(page)];
        while let Some(l) = cursor {
            let link = self.links[l as usize];
            if self.slots[link.slot as usize].page == page {
                return Some(l);
            }
            cursor = link.next;
        }
        None
    }

    /// Insert a page. Reuses the slot detached by the immediately
    /// preceding delete when there is one.
    pub fn insert(&mut self, page: PageIndex, payload: P) -> Result<()> {
        if self.len == self.capacity {
            return Err(FarmemError::PageTableOverflow {
                capacity: self.capacity,
            });
        }
        let link_idx = match self.dead_link.take() {
            // Common case after warm-up: recycle the detached link and
            // its entry slot.
            Some(l) => {
                let slot = self.links[l as usize].slot;
                self.slots[slot as usize] = Slot { page, payload };
                l
            }
            // Early in the run: extend the dense region.
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot { page, payload });
                self.links.push(Link { slot, next: None });
                (self.links.len() - 1) as u32
            }
        };
        let bucket = self.bucket_of(page);
        self.links[link_idx as usize].next = self.buckets[bucket];
        self.buckets[bucket] = Some(link_idx);
        self.len += 1;
        Ok(())
    }

    /// Delete a page, caching its link and slot for the next insert.
    pub fn delete(&mut self, page: PageIndex) -> Result<()> {
        if self.dead_link.is_some() {
            return Err(FarmemError::DoubleDelete);
        }
        let bucket = self.bucket_of(page);
        let mut cursor = self.buckets[bucket];
        let mut prev: Option<u32> = None;
        while let Some(l) = cursor {
            let link = self.links[l as usize];
            if self.slots[link.slot as usize].page == page {
                match prev {
                    None => self.buckets[bucket] = link.next,
                    Some(p) => self.links[p as usize].next = link.next,
                }
                self.dead_link = Some(l);
                self.len -= 1;
                return Ok(());
            }
            prev = Some(l);
            cursor = link.next;
        }
        Err(FarmemError::DeleteMissing { page: page.get() })
    }

    /// Payload of a resident page, or `None`.
    #[must_use]
    pub fn find(&self, page: PageIndex) -> Option<&P> {
        self.find_link(page)
            .map(|l| &self.slots[self.links[l as usize].slot as usize].payload)
    }

    /// Mutable payload of a resident page, or `None`.
    pub fn find_mut(&mut self, page: PageIndex) -> Option<&mut P> {
        let l = self.find_link(page)?;
        let slot = self.links[l as usize].slot as usize;
        Some(&mut self.slots[slot].payload)
    }

    /// True when the page is resident.
    #[must_use]
    pub fn contains(&self, page: PageIndex) -> bool {
        self.find_link(page).is_some()
    }

    /// Entry at rank `r` in `[0, len)`.
    ///
    /// Only meaningful between complete delete/insert pairs; with a
    /// detached slot outstanding the dense region has a hole.
    pub fn at_rank(&self, rank: usize) -> Result<(PageIndex, &P)> {
        if self.dead_link.is_some() {
            return Err(FarmemError::internal(
                "rank query with a detached page-table slot outstanding",
            ));
        }
        let slot = self.slots.get(rank).ok_or(FarmemError::RankOutOfBounds {
            rank,
            len: self.len,
        })?;
        if rank >= self.len {
            return Err(FarmemError::RankOutOfBounds {
                rank,
                len: self.len,
            });
        }
        Ok((slot.page, &slot.payload))
    }

    /// Mutable entry at rank `r` in `[0, len)`.
    pub fn at_rank_mut(&mut self, rank: usize) -> Result<(PageIndex, &mut P)> {
        if self.dead_link.is_some() {
            return Err(FarmemError::internal(
                "rank query with a detached page-table slot outstanding",
            ));
        }
        if rank >= self.len {
            return Err(FarmemError::RankOutOfBounds {
                rank,
                len: self.len,
            });
        }
        let slot = &mut self.slots[rank];
        Ok((slot.page, &mut slot.payload))
    }

    /// Page stored at a given dense slot index.
    pub(crate) fn page_at_slot(&self, slot: u32) -> PageIndex {
        self.slots[slot as usize].page
    }

    /// Payload stored at a given dense slot index.
    pub(crate) fn payload_at_slot(&self, slot: u32) -> &P {
        &self.slots[slot as usize].payload
    }
}
