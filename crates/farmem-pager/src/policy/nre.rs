//! Not-recently-evicted replacement.
//!
//! Random replacement with a memory: the last `K` evicted page indices
//! sit in a bounded ring, and a candidate found there is redrawn, up to
//! `R` retries. A page bouncing out and straight back in costs two
//! network transfers; steering the random choice away from recent
//! victims keeps loops over slightly-too-big working sets from
//! degenerating.
//!
//! The resident set lives in a page table with empty payloads, which
//! doubles as the residency index.

use std::collections::VecDeque;

use farmem_error::{FarmemError, Result};
use farmem_types::{AccessKind, PageIndex, Protection};
use rand::rngs::StdRng;
use tracing::{debug, trace};

use super::{scaled_random, Placement, Residency, ReplacementPolicy};
use crate::page_table::PageTable;

pub struct NrePolicy {
    table: PageTable<()>,
    capacity: usize,
    /// Ring of the last `ring_len` evicted pages.
    recent_evictions: VecDeque<PageIndex>,
    ring_len: usize,
    max_retries: usize,
    last_admitted: Option<PageIndex>,
    rng: StdRng,
}

impl NrePolicy {
    pub fn new(
        local_pages: usize,
        ring_len: usize,
        max_retries: usize,
        rng: StdRng,
    ) -> Result<Self> {
        if local_pages < 2 {
            return Err(FarmemError::TooFewLocalPages {
                policy: "NRE",
                needed: 2,
            });
        }
        debug!(
            local_pages,
            ring_len, max_retries, "not-recently-evicted replacement initialized"
        );
        Ok(Self {
            table: PageTable::new(local_pages),
            capacity: local_pages,
            recent_evictions: VecDeque::with_capacity(ring_len),
            ring_len,
            max_retries,
            last_admitted: None,
            rng,
        })
    }

    fn remember_eviction(&mut self, victim: PageIndex) {
        if self.ring_len == 0 {
            return;
        }
        if self.recent_evictions.len() == self.ring_len {
            self.recent_evictions.pop_front();
        }
        self.recent_evictions.push_back(victim);
    }
}

impl ReplacementPolicy for NrePolicy {
    fn name(&self) -> &'static str {
        "nre"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn place(&mut self, page: PageIndex) -> Result<Placement> {
        if self.table.len() < self.capacity {
            self.table.insert(page, ())?;
            self.last_admitted = Some(page);
            return Ok(Placement {
                protection: Protection::ReadWrite,
                victim: None,
                victim_clean: false,
            });
        }

        // Draw victims until one is outside the recent-eviction ring or
        // the retry budget runs out. The page that just faulted in last
        // time is excluded outright.
        let mut retries = 0;
        let victim = loop {
            let rank = scaled_random(&mut self.rng, self.table.len());
            let (candidate, ()) = self.table.at_rank(rank)?;
            if Some(candidate) == self.last_admitted {
                continue;
            }
            if retries < self.max_retries && self.recent_evictions.contains(&candidate) {
                retries += 1;
                trace!(%candidate, retries, "candidate was recently evicted, redrawing");
                continue;
            }
            break candidate;
        };

        self.remember_eviction(victim);
        self.table.delete(victim)?;
        self.table.insert(page, ())?;
        self.last_admitted = Some(page);
        Ok(Placement {
            protection: Protection::ReadWrite,
            victim: Some(victim),
            victim_clean: false,
        })
    }

    fn upgrade(&mut self, page: PageIndex, _kind: AccessKind) -> Option<Protection> {
        // Pages are never read-only here; a resident page answering the
        // fault path just gets its full access restated.
        self.table.contains(page).then_some(Protection::ReadWrite)
    }

    fn residency(&self, page: PageIndex) -> Residency {
        if self.table.contains(page) {
            Residency::Resident
        } else {
            Residency::NotResident
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn p(n: u32) -> PageIndex {
        PageIndex::new(n)
    }

    fn filled(pages: usize, ring: usize, retries: usize, seed: u64) -> NrePolicy {
        let mut policy =
            NrePolicy::new(pages, ring, retries, StdRng::seed_from_u64(seed)).unwrap();
        for n in 0..pages as u32 {
            policy.place(p(n)).unwrap();
        }
        policy
    }

    #[test]
    fn recent_victims_are_not_rechosen_within_the_ring() {
        // Generous retry budget relative to ring size: the ring must be
        // respected for every eviction.
        for seed in 0..16 {
            let mut policy = filled(16, 4, 5, seed);
            let mut recent: VecDeque<u32> = VecDeque::new();
            for n in 16..96 {
                let victim = policy.place(p(n)).unwrap().victim.unwrap().get();
                assert!(
                    !recent.contains(&victim),
                    "seed {seed}: victim {victim} is in the recent ring {recent:?}"
                );
                if recent.len() == 4 {
                    recent.pop_front();
                }
                recent.push_back(victim);
            }
        }
    }

    #[test]
    fn the_newest_page_is_never_the_next_victim() {
        for seed in 0..16 {
            let mut policy = filled(4, 2, 1, seed);
            let mut last = p(3);
            for n in 4..64 {
                let placement = policy.place(p(n)).unwrap();
                assert_ne!(placement.victim, Some(last), "seed {seed}");
                last = p(n);
            }
        }
    }

    #[test]
    fn exhausted_retries_fall_back_to_a_ringed_victim() {
        // Two resident pages, ring big enough to hold both, zero
        // retries: the draw must still produce some victim.
        let mut policy = filled(2, 8, 0, 3);
        for n in 2..10 {
            assert!(policy.place(p(n)).unwrap().victim.is_some());
        }
    }

    #[test]
    fn residency_tracks_the_table() {
        let mut policy = filled(3, 2, 2, 9);
        assert_eq!(policy.residency(p(0)), Residency::Resident);
        assert_eq!(policy.residency(p(77)), Residency::NotResident);
        let victim = policy.place(p(77)).unwrap().victim.unwrap();
        assert_eq!(policy.residency(victim), Residency::NotResident);
        assert_eq!(policy.residency(p(77)), Residency::Resident);
    }

    #[test]
    fn upgrade_restates_full_access_for_residents() {
        let mut policy = filled(2, 2, 2, 1);
        assert_eq!(
            policy.upgrade(p(0), AccessKind::Write),
            Some(Protection::ReadWrite)
        );
        assert_eq!(policy.upgrade(p(55), AccessKind::Read), None);
    }
}
