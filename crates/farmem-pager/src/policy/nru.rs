//! Not-recently-used replacement.
//!
//! Every resident page carries `{referenced, modified}` bits. New pages
//! are admitted read-only (unless configured read+write, which costs
//! the modified-bit distinction), so the first write comes back through
//! the fault path and sets `modified`. A sweep clears all referenced
//! bits once per interval, checked on each fault, and demotes the
//! swept pages to no-access so their next reference is observable as a
//! protection fault.
//!
//! Eviction picks uniformly within the smallest nonempty class of
//! `referenced * 2 + modified`. Class membership is tracked two-tier:
//! exact per-class counts, plus a bucket array of table slots that is
//! re-sorted lazily — the array is usually nearly sorted, so the draw
//! first tries it as-is and only sorts when it lands on a page of the
//! wrong class.

use std::sync::Arc;

use farmem_error::{FarmemError, Result};
use farmem_types::{AccessKind, PageIndex, Protection};
use rand::rngs::StdRng;
use tracing::{debug, trace};

use super::{scaled_random, Placement, Residency, ReplacementPolicy};
use crate::clock::Clock;
use crate::page_table::PageTable;

/// Reference/modified state of one resident page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NruBits {
    pub referenced: bool,
    pub modified: bool,
}

impl NruBits {
    #[inline]
    fn class(self) -> usize {
        usize::from(self.referenced) * 2 + usize::from(self.modified)
    }
}

/// NRU tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct NruOptions {
    /// Reference-bit clear interval in milliseconds.
    pub interval_ms: u64,
    /// Admit new pages read+write instead of read-only.
    pub readwrite: bool,
}

impl Default for NruOptions {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            readwrite: true,
        }
    }
}

pub struct NruPolicy {
    table: PageTable<NruBits>,
    capacity: usize,
    /// Table slots ordered by class when `sorted`.
    by_class: Vec<u32>,
    /// Exact count of resident pages per class.
    class_size: [usize; 4],
    sorted: bool,
    options: NruOptions,
    clock: Arc<dyn Clock>,
    prev_clear_ms: u64,
    /// Demotions accumulated by sweeps, awaiting the engine.
    pending_demotions: Vec<(PageIndex, Protection)>,
    /// Eviction tally per class, reported at shutdown.
    replacements: [u64; 4],
    rng: StdRng,
}

impl NruPolicy {
    pub fn new(
        local_pages: usize,
        options: NruOptions,
        clock: Arc<dyn Clock>,
        rng: StdRng,
    ) -> Result<Self> {
        if local_pages < 1 {
            return Err(FarmemError::TooFewLocalPages {
                policy: "NRU",
                needed: 1,
            });
        }
        debug!(
            local_pages,
            interval_ms = options.interval_ms,
            readwrite = options.readwrite,
            "not-recently-used replacement initialized"
        );
        let prev_clear_ms = clock.now_ms();
        Ok(Self {
            table: PageTable::new(local_pages),
            capacity: local_pages,
            by_class: Vec::with_capacity(local_pages),
            class_size: [0; 4],
            sorted: true,
            options,
            clock,
            prev_clear_ms,
            pending_demotions: Vec::new(),
            replacements: [0; 4],
            rng,
        })
    }

    fn admission_bits(&self) -> (NruBits, Protection) {
        if self.options.readwrite {
            (
                NruBits {
                    referenced: true,
                    modified: true,
                },
                Protection::ReadWrite,
            )
        } else {
            (
                NruBits {
                    referenced: true,
                    modified: false,
                },
                Protection::Read,
            )
        }
    }

    /// Clear all reference bits once `interval_ms` has elapsed.
    fn maybe_clear_reference_bits(&mut self) {
        let now = self.clock.now_ms();
        if now.saturating_sub(self.prev_clear_ms) < self.options.interval_ms {
            return;
        }
        self.clear_reference_bits(now);
    }

    fn clear_reference_bits(&mut self, now: u64) {
        trace!("clearing all reference bits");
        for rank in 0..self.table.len() {
            if let Ok((page, bits)) = self.table.at_rank_mut(rank) {
                bits.referenced = false;
                // Drop access so the next reference faults back in and
                // re-sets the bit.
                self.pending_demotions.push((page, Protection::None));
            }
        }
        // Classes 2 and 3 collapse onto 0 and 1.
        self.class_size = [
            self.class_size[0] + self.class_size[2],
            self.class_size[1] + self.class_size[3],
            0,
            0,
        ];
        self.sorted = false;
        self.prev_clear_ms = now;
    }

    /// Bucket-sort the slot array by class and mark it sorted.
    fn sort_by_class(&mut self) {
        let len = self.table.len();
        let mut offsets = [0usize; 4];
        offsets[1] = self.class_size[0];
        offsets[2] = offsets[1] + self.class_size[1];
        offsets[3] = offsets[2] + self.class_size[2];

        let mut sorted = vec![0u32; len];
        for slot in 0..len as u32 {
            let class = self.table.payload_at_slot(slot).class();
            sorted[offsets[class]] = slot;
            offsets[class] += 1;
        }
        self.by_class = sorted;
        self.sorted = true;
    }

    /// Uniform choice within the smallest nonempty class.
    fn choose_victim_slot(&mut self) -> u32 {
        let class = (0..4)
            .find(|&c| self.class_size[c] > 0)
            .expect("resident set is nonempty when evicting");
        let draw = scaled_random(&mut self.rng, self.class_size[class]);

        // Classes below `class` are empty, so when the array is sorted
        // its first `class_size[class]` entries are exactly that class.
        // Try the possibly stale array first; sort only on a miss.
        let slot = self.by_class[draw];
        if self.table.payload_at_slot(slot).class() == class {
            return slot;
        }
        self.sort_by_class();
        self.by_class[draw]
    }
}

impl ReplacementPolicy for NruPolicy {
    fn name(&self) -> &'static str {
        "nru"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn place(&mut self, page: PageIndex) -> Result<Placement> {
        self.maybe_clear_reference_bits();
        let (bits, protection) = self.admission_bits();

        if self.table.len() < self.capacity {
            self.table.insert(page, bits)?;
            // Dense fill: the new entry's slot is the last rank.
            self.by_class.push((self.table.len() - 1) as u32);
            self.class_size[bits.class()] += 1;
            self.sorted = false;
            return Ok(Placement {
                protection,
                victim: None,
                victim_clean: false,
            });
        }

        let slot = self.choose_victim_slot();
        let victim = self.table.page_at_slot(slot);
        let victim_bits = *self.table.payload_at_slot(slot);
        let class = victim_bits.class();
        self.replacements[class] += 1;
        self.class_size[class] -= 1;
        trace!(%victim, class, "evicting");

        self.table.delete(victim)?;
        // The insert reuses the victim's slot, so `by_class` entries
        // stay valid slot indices; only their ordering is now stale.
        self.table.insert(page, bits)?;
        self.class_size[bits.class()] += 1;
        self.sorted = false;

        Ok(Placement {
            protection,
            victim: Some(victim),
            victim_clean: !victim_bits.modified,
        })
    }

    fn upgrade(&mut self, page: PageIndex, kind: AccessKind) -> Option<Protection> {
        self.maybe_clear_reference_bits();
        let bits = self.table.find_mut(page)?;
        let old_class = bits.class();
        bits.referenced = true;
        if kind == AccessKind::Write {
            bits.modified = true;
        }
        let modified = bits.modified;
        let new_class = bits.class();
        self.class_size[old_class] -= 1;
        self.class_size[new_class] += 1;
        self.sorted = false;
        // Modified pages get full access back; an observed read on a
        // clean page stays read-only so the first write is still seen.
        Some(if modified {
            Protection::ReadWrite
        } else {
            Protection::Read
        })
    }

    fn residency(&self, page: PageIndex) -> Residency {
        if self.table.contains(page) {
            Residency::Resident
        } else {
            Residency::NotResident
        }
    }

    fn drain_demotions(&mut self) -> Vec<(PageIndex, Protection)> {
        std::mem::take(&mut self.pending_demotions)
    }

    fn force_sweep(&mut self) {
        let now = self.clock.now_ms();
        self.clear_reference_bits(now);
    }

    fn supports_prefetch(&self) -> bool {
        true
    }

    fn finish(&self) {
        debug!(
            class0 = self.replacements[0],
            class1 = self.replacements[1],
            class2 = self.replacements[2],
            class3 = self.replacements[3],
            "evictions by NRU class"
        );
    }
}
