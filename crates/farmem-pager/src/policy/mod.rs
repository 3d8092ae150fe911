//! Page-replacement policies.
//!
//! All policies share one contract: given a page that faulted,
//! [`ReplacementPolicy::place`] returns the protection to admit it
//! with, the victim to evict (if the cache is full), and whether the
//! victim is clean — and mutates internal state so the faulting page is
//! now resident and the victim is not.
//!
//! Policies that keep no residency index (FIFO, random) answer
//! [`Residency::Unknown`] and therefore cannot support prefetching; the
//! engine downgrades prefetch to `none` for them.

mod fifo;
mod nre;
mod nru;
mod random;

pub use fifo::FifoPolicy;
pub use nre::NrePolicy;
pub use nru::{NruOptions, NruPolicy};
pub use random::RandomPolicy;

use farmem_error::Result;
use farmem_types::{AccessKind, PageIndex, Protection};
use rand::rngs::StdRng;
use rand::RngCore;

/// Outcome of a placement decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Protection the incoming page is admitted with.
    pub protection: Protection,
    /// Resident page to evict, or `None` while the cache is filling.
    pub victim: Option<PageIndex>,
    /// True when the victim is known unmodified and the network write
    /// can be skipped.
    pub victim_clean: bool,
}

/// What a policy knows about a page's residency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Resident,
    NotResident,
    /// The policy keeps no index it could answer from.
    Unknown,
}

/// A page-replacement policy.
pub trait ReplacementPolicy: Send {
    /// Short policy name for logs.
    fn name(&self) -> &'static str;

    /// Number of locally cacheable pages after any metadata funding.
    fn capacity(&self) -> usize;

    /// Admit `page`, choosing a victim if the cache is full.
    fn place(&mut self, page: PageIndex) -> Result<Placement>;

    /// The resident-page fault path: if `page` is resident, update
    /// access state for an access of `kind` and return the protection
    /// it should now carry. `None` means the page is not resident and
    /// must be fetched.
    fn upgrade(&mut self, page: PageIndex, kind: AccessKind) -> Option<Protection>;

    /// Residency of `page`, when the policy can tell.
    fn residency(&self, page: PageIndex) -> Residency;

    /// Protection changes the policy wants applied to resident pages,
    /// accumulated since the last drain (the NRU sweep demotes pages so
    /// the next reference is observable). The engine applies them under
    /// the same fault that triggered them.
    fn drain_demotions(&mut self) -> Vec<(PageIndex, Protection)> {
        Vec::new()
    }

    /// Run any interval-driven maintenance immediately instead of
    /// waiting for it to come due on a fault.
    fn force_sweep(&mut self) {}

    /// True when [`ReplacementPolicy::residency`] gives real answers,
    /// which prefetch-candidate filtering requires.
    fn supports_prefetch(&self) -> bool {
        false
    }

    /// Log end-of-run statistics.
    fn finish(&self) {}
}

/// Primes used to scale raw random draws, in case the generator's low
/// bits are weak.
const BIG_PRIME_A: u64 = 34_359_738_641;
const BIG_PRIME_B: u64 = 1_152_921_504_606_847_229;

/// A scaled random draw in `[0, bound)`.
pub(crate) fn scaled_random(rng: &mut StdRng, bound: usize) -> usize {
    debug_assert!(bound > 0);
    let mixed = rng
        .next_u64()
        .wrapping_add(BIG_PRIME_A)
        .wrapping_mul(BIG_PRIME_B);
    (mixed % bound as u64) as usize
}

/// Shrink the cacheable page count so the policy's metadata fits in
/// the same memory budget.
///
/// The budget is `local_pages * page_size` bytes; each cached page
/// additionally costs `per_entry_bytes` of metadata, and the policy
/// pays `fixed_bytes` up front. Returns the reduced page count.
pub(crate) fn fund_metadata(
    local_pages: usize,
    page_size: usize,
    per_entry_bytes: usize,
    fixed_bytes: usize,
) -> usize {
    let budget = (local_pages * page_size).saturating_sub(fixed_bytes);
    budget / (page_size + per_entry_bytes)
}

/// Approximate per-cached-page metadata cost of the table-backed
/// policies: a dense entry slot, a chain link, and a two-slot share of
/// the bucket array.
fn table_entry_overhead<P>() -> usize {
    std::mem::size_of::<PageIndex>()
        + std::mem::size_of::<P>()
        + 2 * std::mem::size_of::<(u32, Option<u32>)>()
}

/// Everything needed to construct a policy.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub kind: farmem_types::PolicyKind,
    /// NRE eviction-history length.
    pub nre_entries: usize,
    /// NRE retry budget.
    pub nre_retries: usize,
    pub nru: NruOptions,
    /// The user pinned the page count explicitly; policies must not
    /// shrink it to fund their metadata.
    pub local_pages_explicit: bool,
}

/// Build the configured policy.
///
/// Unless the local page count was explicit, table-backed policies give
/// back enough pages to pay for their metadata; the effective count is
/// available afterwards via [`ReplacementPolicy::capacity`].
pub fn build_policy(
    config: &PolicyConfig,
    local_pages: usize,
    page_size: usize,
    clock: std::sync::Arc<dyn crate::clock::Clock>,
    rng: StdRng,
) -> Result<Box<dyn ReplacementPolicy>> {
    use farmem_types::PolicyKind;

    let funded = |per_entry: usize| {
        if config.local_pages_explicit {
            local_pages
        } else {
            fund_metadata(local_pages, page_size, per_entry, 0)
        }
    };

    Ok(match config.kind {
        PolicyKind::Fifo => Box::new(FifoPolicy::new(local_pages)?),
        PolicyKind::Random => Box::new(RandomPolicy::new(local_pages, rng)?),
        PolicyKind::Nre => Box::new(NrePolicy::new(
            funded(table_entry_overhead::<()>()),
            config.nre_entries,
            config.nre_retries,
            rng,
        )?),
        PolicyKind::Nru => Box::new(NruPolicy::new(
            funded(table_entry_overhead::<(bool, bool)>() + std::mem::size_of::<u32>()),
            config.nru,
            clock,
            rng,
        )?),
    })
}
