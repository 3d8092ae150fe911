//! Uniform random replacement.
//!
//! The victim is drawn uniformly from the resident set, excluding the
//! most recently admitted page — evicting the page that just faulted in
//! turns a two-page access loop into a thrash cycle.

use farmem_error::{FarmemError, Result};
use farmem_types::{AccessKind, PageIndex, Protection};
use rand::rngs::StdRng;
use tracing::debug;

use super::{scaled_random, Placement, Residency, ReplacementPolicy};

pub struct RandomPolicy {
    used: Vec<PageIndex>,
    capacity: usize,
    /// Most recently admitted page, never the next victim.
    last_admitted: Option<PageIndex>,
    rng: StdRng,
}

impl RandomPolicy {
    pub fn new(local_pages: usize, rng: StdRng) -> Result<Self> {
        if local_pages < 2 {
            return Err(FarmemError::TooFewLocalPages {
                policy: "random",
                needed: 2,
            });
        }
        debug!(local_pages, "random replacement initialized");
        Ok(Self {
            used: Vec::with_capacity(local_pages),
            capacity: local_pages,
            last_admitted: None,
            rng,
        })
    }
}

impl ReplacementPolicy for RandomPolicy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn place(&mut self, page: PageIndex) -> Result<Placement> {
        if self.used.len() < self.capacity {
            self.used.push(page);
            self.last_admitted = Some(page);
            return Ok(Placement {
                protection: Protection::ReadWrite,
                victim: None,
                victim_clean: false,
            });
        }
        let slot = loop {
            let slot = scaled_random(&mut self.rng, self.used.len());
            if Some(self.used[slot]) != self.last_admitted {
                break slot;
            }
        };
        let victim = self.used[slot];
        self.used[slot] = page;
        self.last_admitted = Some(page);
        Ok(Placement {
            protection: Protection::ReadWrite,
            victim: Some(victim),
            victim_clean: false,
        })
    }

    fn upgrade(&mut self, _page: PageIndex, _kind: AccessKind) -> Option<Protection> {
        None
    }

    fn residency(&self, _page: PageIndex) -> Residency {
        Residency::Unknown
    }
}
