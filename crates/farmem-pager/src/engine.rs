//! The fault-service engine.
//!
//! [`PagingEngine::service_fault`] is the single entry point for access
//! violations inside the managed region. The hosted signal trampoline
//! calls it after taking the global lock and freezing peer user
//! threads; tests call it directly against an in-memory region. Either
//! way the pipeline is the same: complete the outstanding eviction, ask
//! the policy for a placement, back the faulting page, and run the
//! fetch/evict/prefetch sequence so the trapped instruction can resume.
//!
//! Exactly one fetch, one evict, and one prefetch may be outstanding;
//! each has a dedicated slot with a page-sized scratch buffer.

use std::sync::Arc;

use farmem_error::{FarmemError, Result};
use farmem_transport::{EvictTicket, FetchTicket, PageTransport};
use farmem_types::{AccessKind, PageIndex, PrefetchKind, Protection, RegionLayout};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::policy::{Placement, ReplacementPolicy, Residency};
use crate::region::RegionMemory;
use crate::stats::EngineStats;

/// Engine-level knobs, distilled from the full configuration.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub prefetch: PrefetchKind,
    /// Overlap the eviction's network write with user execution; the
    /// write completes at the top of the next fault.
    pub async_evict: bool,
    /// Stage transfers through scratch buffers instead of handing the
    /// transport the region pages themselves.
    pub extra_memcpy: bool,
    /// Periodic status interval in seconds.
    pub heartbeat_secs: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            prefetch: PrefetchKind::None,
            async_evict: false,
            extra_memcpy: false,
            heartbeat_secs: None,
        }
    }
}

/// What a fault turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The address is not ours; the caller should re-raise.
    OutOfRegion,
    /// Resident page, protection changed (minor fault).
    Upgraded,
    /// Page fetched from its holder (major fault).
    Loaded,
}

#[derive(Debug)]
struct FetchSlot {
    target: Option<PageIndex>,
    ticket: Option<FetchTicket>,
    protection: Protection,
    buffer: Vec<u8>,
}

impl Default for FetchSlot {
    fn default() -> Self {
        Self {
            target: None,
            ticket: None,
            protection: Protection::ReadWrite,
            buffer: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct EvictSlot {
    target: Option<PageIndex>,
    ticket: Option<EvictTicket>,
    clean: bool,
    buffer: Vec<u8>,
}

#[derive(Debug, Default)]
struct PrefetchSlot {
    target: Option<PageIndex>,
    ticket: Option<FetchTicket>,
    buffer: Vec<u8>,
}

/// The master-side software paging engine.
pub struct PagingEngine<T: PageTransport, M: RegionMemory> {
    layout: RegionLayout,
    region: M,
    transport: T,
    policy: Box<dyn ReplacementPolicy>,
    options: EngineOptions,
    clock: Arc<dyn Clock>,
    stats: EngineStats,
    fetch: FetchSlot,
    evict: EvictSlot,
    prefetch: PrefetchSlot,
    /// Page whose fault is currently being serviced.
    current_fault: Option<PageIndex>,
    /// Previous fault page, for delta prefetch.
    prev_prefetch_page: Option<PageIndex>,
    /// Previous fault page and delta, for predictability statistics.
    prev_stats_page: Option<PageIndex>,
    prev_delta: Option<i64>,
    last_heartbeat_s: u64,
}

impl<T: PageTransport, M: RegionMemory> PagingEngine<T, M> {
    pub fn new(
        layout: RegionLayout,
        region: M,
        transport: T,
        policy: Box<dyn ReplacementPolicy>,
        mut options: EngineOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let page_size = layout.page_size();
        if transport.page_size() != page_size || region.page_size() != page_size {
            return Err(FarmemError::internal(
                "transport, region, and layout disagree on the page size",
            ));
        }
        if options.prefetch != PrefetchKind::None && !policy.supports_prefetch() {
            warn!(
                policy = policy.name(),
                "policy keeps no residency index; disabling prefetch"
            );
            options.prefetch = PrefetchKind::None;
        }

        let page_buf = || vec![0u8; page_size];
        let staged = options.extra_memcpy;
        let prefetching = options.prefetch != PrefetchKind::None;
        let last_heartbeat_s = clock.now_us() / 1_000_000;
        Ok(Self {
            layout,
            region,
            transport,
            policy,
            options,
            clock,
            stats: EngineStats::default(),
            fetch: FetchSlot {
                buffer: if staged { page_buf() } else { Vec::new() },
                ..FetchSlot::default()
            },
            evict: EvictSlot {
                buffer: if staged { page_buf() } else { Vec::new() },
                ..EvictSlot::default()
            },
            prefetch: PrefetchSlot {
                buffer: if prefetching { page_buf() } else { Vec::new() },
                ..PrefetchSlot::default()
            },
            current_fault: None,
            prev_prefetch_page: None,
            prev_stats_page: None,
            prev_delta: None,
            last_heartbeat_s,
        })
    }

    #[inline]
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    #[inline]
    pub fn region(&self) -> &M {
        &self.region
    }

    #[inline]
    pub fn region_mut(&mut self) -> &mut M {
        &mut self.region
    }

    #[inline]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Effective local cache capacity in pages.
    #[inline]
    pub fn local_pages(&self) -> usize {
        self.policy.capacity()
    }

    /// Current prefetch target, if a prefetch is in flight.
    #[inline]
    pub fn prefetch_target(&self) -> Option<PageIndex> {
        self.prefetch.target
    }

    /// Run interval maintenance (the NRU sweep) immediately.
    pub fn force_sweep(&mut self) -> Result<()> {
        self.policy.force_sweep();
        self.apply_demotions()
    }

    /// Back and seed the initial cold cache: the policy admits the
    /// first `local_pages` pages without any peer traffic, and the
    /// whole prefix is backed in one mapping.
    pub fn prefill_cold_pages(&mut self) -> Result<()> {
        let count = self.policy.capacity().min(self.layout.num_pages() as usize);
        let mut protection = Protection::ReadWrite;
        for n in 0..count {
            let placement = self.policy.place(PageIndex::new(n as u32))?;
            if let Some(victim) = placement.victim {
                return Err(FarmemError::PrematureEviction { page: victim.get() });
            }
            protection = placement.protection;
        }
        if count > 0 {
            self.region.back(PageIndex::new(0), count, protection)?;
        }
        debug!(pages = count, "cold cache prefilled");
        Ok(())
    }

    /// Service one access violation at a region-relative byte offset.
    pub fn service_fault(&mut self, offset: usize, kind: AccessKind) -> Result<FaultOutcome> {
        if !self.layout.contains(offset) {
            trace!(offset, "fault outside the managed region");
            return Ok(FaultOutcome::OutOfRegion);
        }
        let page = self.layout.page_of(offset);
        if let Some(pending) = self.current_fault {
            return Err(FarmemError::ReentrantFault {
                page: page.get(),
                pending: pending.get(),
            });
        }
        self.current_fault = Some(page);
        let outcome = self.service_page_fault(page, kind);
        self.current_fault = None;
        outcome
    }

    fn service_page_fault(&mut self, page: PageIndex, kind: AccessKind) -> Result<FaultOutcome> {
        trace!(%page, ?kind, "fault");

        // Resident page: a protection change is all that's needed.
        let upgraded = self.policy.upgrade(page, kind);
        self.apply_demotions_excluding(page)?;
        if let Some(protection) = upgraded {
            self.region.protect(page, protection)?;
            self.stats.minor_faults += 1;
            return Ok(FaultOutcome::Upgraded);
        }

        self.stats.major_faults += 1;
        let start_us = self.clock.now_us();

        // The previous asynchronous eviction must finish before its
        // slot (and, for the same page, its ordering) can be reused.
        if self.evict.target.is_some() {
            self.evict_end()?;
        }

        let placement = self.policy.place(page)?;
        self.apply_demotions_excluding(page)?;
        self.region.back(page, 1, Protection::ReadWrite)?;

        if self.options.prefetch != PrefetchKind::None {
            self.complete_prefetch(page, &placement)?;
            self.start_prefetch(page)?;
        } else {
            self.fetch_begin(page, placement.protection)?;
            if let Some(victim) = placement.victim {
                self.evict_begin(victim, placement.victim_clean)?;
            }
            self.fetch_end()?;
        }

        let elapsed = self.clock.now_us().saturating_sub(start_us);
        self.stats.record_fault_time(elapsed);
        self.record_fault_delta(page);
        self.maybe_heartbeat();
        Ok(FaultOutcome::Loaded)
    }

    fn apply_demotions(&mut self) -> Result<()> {
        for (page, protection) in self.policy.drain_demotions() {
            self.region.protect(page, protection)?;
        }
        Ok(())
    }

    /// Apply sweep demotions, except to the page this fault is about to
    /// grant access to anyway.
    fn apply_demotions_excluding(&mut self, exclude: PageIndex) -> Result<()> {
        for (page, protection) in self.policy.drain_demotions() {
            if page != exclude {
                self.region.protect(page, protection)?;
            }
        }
        Ok(())
    }

    // --- Fetch slot ---

    fn fetch_begin(&mut self, page: PageIndex, protection: Protection) -> Result<()> {
        if self.fetch.target.is_some() {
            return Err(FarmemError::SlotBusy { kind: "fetch" });
        }
        let remote = self.layout.remote_ref(page);
        self.fetch.ticket = Some(self.transport.fetch_begin(remote)?);
        self.fetch.target = Some(page);
        self.fetch.protection = protection;
        Ok(())
    }

    fn fetch_end(&mut self) -> Result<()> {
        let page = self
            .fetch
            .target
            .take()
            .ok_or_else(|| FarmemError::internal("fetch_end with no fetch outstanding"))?;
        let ticket = self.fetch.ticket.take().expect("ticket follows target");
        if self.options.extra_memcpy {
            self.transport.fetch_end(ticket, &mut self.fetch.buffer)?;
            self.region.page_mut(page).copy_from_slice(&self.fetch.buffer);
        } else {
            self.transport.fetch_end(ticket, self.region.page_mut(page))?;
        }
        if self.fetch.protection != Protection::ReadWrite {
            self.region.protect(page, self.fetch.protection)?;
        }
        self.stats.pages_received += 1;
        Ok(())
    }

    // --- Evict slot ---

    fn evict_begin(&mut self, victim: PageIndex, clean: bool) -> Result<()> {
        if self.evict.target.is_some() {
            return Err(FarmemError::SlotBusy { kind: "evict" });
        }
        trace!(%victim, clean, "evict begin");
        self.evict.target = Some(victim);
        self.evict.clean = clean;
        if !clean && !self.region.accessible(victim, AccessKind::Read) {
            // A sweep in this same fault may have demoted the victim to
            // no-access; the copy below must be able to read it.
            self.region.protect(victim, Protection::Read)?;
        }
        if !clean {
            let remote = self.layout.remote_ref(victim);
            let ticket = if self.options.extra_memcpy {
                self.evict.buffer.copy_from_slice(self.region.page(victim));
                self.transport.evict_begin(remote, &self.evict.buffer)?
            } else {
                self.transport.evict_begin(remote, self.region.page(victim))?
            };
            self.evict.ticket = Some(ticket);
        }
        if self.options.async_evict {
            // Writes racing the in-flight copy must trap rather than be
            // silently dropped; readers may keep using the stale-free
            // local copy until the next fault retires it.
            self.region.protect(victim, Protection::Read)?;
        } else {
            self.evict_end()?;
        }
        Ok(())
    }

    fn evict_end(&mut self) -> Result<()> {
        let victim = self
            .evict
            .target
            .take()
            .ok_or_else(|| FarmemError::internal("evict_end with no eviction outstanding"))?;
        if self.evict.clean {
            self.stats.clean_evictions += 1;
        } else {
            let ticket = self.evict.ticket.take().expect("ticket follows target");
            self.transport.evict_end(ticket)?;
            self.stats.pages_sent += 1;
        }
        self.region.unback(victim)?;
        Ok(())
    }

    // --- Prefetch slot ---

    /// Resolve an outstanding prefetch against the page that actually
    /// faulted, then fetch it for real if the guess was wrong.
    fn complete_prefetch(&mut self, page: PageIndex, placement: &Placement) -> Result<()> {
        if let Some(guessed) = self.prefetch.target.take() {
            let ticket = self.prefetch.ticket.take().expect("ticket follows target");
            self.transport.fetch_end(ticket, &mut self.prefetch.buffer)?;
            self.stats.pages_received += 1;

            if guessed == page {
                // Overlap the eviction with the copy-in.
                if let Some(victim) = placement.victim {
                    self.evict_begin(victim, placement.victim_clean)?;
                }
                self.region.page_mut(page).copy_from_slice(&self.prefetch.buffer);
                self.stats.good_prefetches += 1;
                if placement.protection != Protection::ReadWrite {
                    self.region.protect(page, placement.protection)?;
                }
                return Ok(());
            }
            trace!(%guessed, wanted = %page, "prefetched the wrong page");
            self.stats.bad_prefetches += 1;
        }
        self.fetch_begin(page, placement.protection)?;
        if let Some(victim) = placement.victim {
            self.evict_begin(victim, placement.victim_clean)?;
        }
        self.fetch_end()
    }

    /// Kick off the next speculative fetch.
    fn start_prefetch(&mut self, page: PageIndex) -> Result<()> {
        let candidate = match self.options.prefetch {
            PrefetchKind::None => return Ok(()),
            PrefetchKind::Next => page.offset_by(1),
            PrefetchKind::Delta => {
                let prev = self.prev_prefetch_page.replace(page);
                prev.and_then(|prev| {
                    let delta = i64::from(page.get()) - i64::from(prev.get());
                    page.offset_by(delta)
                })
            }
        };
        let Some(candidate) = candidate else {
            return Ok(());
        };
        if candidate.get() >= self.layout.num_pages()
            || self.policy.residency(candidate) == Residency::Resident
        {
            return Ok(());
        }
        trace!(%candidate, "prefetch begin");
        let remote = self.layout.remote_ref(candidate);
        self.prefetch.ticket = Some(self.transport.fetch_begin(remote)?);
        self.prefetch.target = Some(candidate);
        Ok(())
    }

    // --- Bulk helpers ---

    /// Fault in a byte range, up to the size of the local cache.
    ///
    /// Walks the range in reverse order (so its beginning is the most
    /// likely part to stay resident) and repeats until a pass completes
    /// with every page accessible, progress stalls, or the iteration
    /// floor is reached — random policies can evict pages this walk
    /// just brought in.
    pub fn touch_range(&mut self, offset: usize, len: usize) -> Result<()> {
        const MIN_PASSES: usize = 3;

        if len == 0 || !self.layout.contains(offset) {
            return Ok(());
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.layout.extent() => {}
            _ => return Ok(()),
        }
        let cache_bytes = self.policy.capacity() * self.layout.page_size();
        let len = len.min(cache_bytes);
        let first = self.layout.page_of(self.layout.round_down(offset)).get();
        let last = self.layout.page_of(offset + len - 1).get();

        let mut nonresident = usize::MAX;
        let mut pass = 0;
        loop {
            let prev_nonresident = nonresident;
            nonresident = 0;
            for n in (first..=last).rev() {
                let page = PageIndex::new(n);
                if !self.region.accessible(page, AccessKind::Read) {
                    nonresident += 1;
                    self.service_fault(self.layout.page_start(page), AccessKind::Read)?;
                }
            }
            pass += 1;
            if nonresident == 0 {
                break;
            }
            if nonresident >= prev_nonresident && pass >= MIN_PASSES {
                debug!(nonresident, "touch walk stalled; giving up");
                break;
            }
        }
        Ok(())
    }

    // --- Bookkeeping ---

    fn record_fault_delta(&mut self, page: PageIndex) {
        if let Some(prev) = self.prev_stats_page {
            let delta = i64::from(page.get()) - i64::from(prev.get());
            self.stats.record_delta(delta, self.prev_delta);
            self.prev_delta = Some(delta);
        }
        self.prev_stats_page = Some(page);
    }

    fn maybe_heartbeat(&mut self) {
        let Some(interval) = self.options.heartbeat_secs else {
            return;
        };
        let now_s = self.clock.now_us() / 1_000_000;
        if now_s.saturating_sub(self.last_heartbeat_s) >= interval {
            self.last_heartbeat_s = now_s;
            info!(
                major_faults = self.stats.major_faults,
                minor_faults = self.stats.minor_faults,
                pages_sent = self.stats.pages_sent,
                pages_received = self.stats.pages_received,
                "heartbeat"
            );
        }
    }

    /// Drain outstanding operations and shut the transport down.
    pub fn finalize(&mut self) -> Result<()> {
        if self.prefetch.target.take().is_some() {
            let ticket = self.prefetch.ticket.take().expect("ticket follows target");
            self.transport.fetch_end(ticket, &mut self.prefetch.buffer)?;
            self.stats.pages_received += 1;
        }
        if self.evict.target.is_some() {
            self.evict_end()?;
        }
        self.policy.finish();
        info!(
            major_faults = self.stats.major_faults,
            minor_faults = self.stats.minor_faults,
            good_prefetches = self.stats.good_prefetches,
            bad_prefetches = self.stats.bad_prefetches,
            clean_evictions = self.stats.clean_evictions,
            pages_sent = self.stats.pages_sent,
            pages_received = self.stats.pages_received,
            "paging engine finalized"
        );
        self.transport.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::{FifoPolicy, NruOptions, NruPolicy};
    use crate::region::MemRegion;
    use farmem_transport::{SharedCluster, SharedTransport};
    use farmem_types::{PageDistribution, PageSize};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const PAGE: usize = 256;

    type TestEngine = PagingEngine<SharedTransport, MemRegion>;

    fn layout(peers: u32, pages_per_peer: usize) -> RegionLayout {
        RegionLayout::new(
            PageSize::from_raw(PAGE),
            pages_per_peer * PAGE,
            peers,
            PageDistribution::RoundRobin,
        )
        .unwrap()
    }

    fn fifo_engine(
        peers: u32,
        pages_per_peer: usize,
        cache_pages: usize,
        options: EngineOptions,
    ) -> TestEngine {
        let layout = layout(peers, pages_per_peer);
        let region = MemRegion::new(&layout);
        let transport =
            SharedTransport::new(SharedCluster::new(peers, pages_per_peer * PAGE), PAGE);
        PagingEngine::new(
            layout,
            region,
            transport,
            Box::new(FifoPolicy::new(cache_pages).unwrap()),
            options,
            Arc::new(ManualClock::new()),
        )
        .unwrap()
    }

    fn nru_engine(
        peers: u32,
        pages_per_peer: usize,
        cache_pages: usize,
        readwrite: bool,
        options: EngineOptions,
    ) -> (TestEngine, Arc<ManualClock>) {
        let layout = layout(peers, pages_per_peer);
        let region = MemRegion::new(&layout);
        let transport =
            SharedTransport::new(SharedCluster::new(peers, pages_per_peer * PAGE), PAGE);
        let clock = Arc::new(ManualClock::new());
        let policy = NruPolicy::new(
            cache_pages,
            NruOptions {
                interval_ms: 5000,
                readwrite,
            },
            clock.clone(),
            StdRng::seed_from_u64(1234),
        )
        .unwrap();
        let engine = PagingEngine::new(
            layout,
            region,
            transport,
            Box::new(policy),
            options,
            clock.clone(),
        )
        .unwrap();
        (engine, clock)
    }

    /// One user load: retry the access until the MMU model admits it,
    /// servicing a fault per retry, then read the byte.
    fn user_read(engine: &mut TestEngine, offset: usize) -> u8 {
        let page = engine.layout().page_of(offset);
        while !engine.region().accessible(page, AccessKind::Read) {
            engine.service_fault(offset, AccessKind::Read).unwrap();
        }
        engine.region().page(page)[offset % PAGE]
    }

    /// One user store, with the same restart loop.
    fn user_write(engine: &mut TestEngine, offset: usize, byte: u8) {
        let page = engine.layout().page_of(offset);
        while !engine.region().accessible(page, AccessKind::Write) {
            engine.service_fault(offset, AccessKind::Write).unwrap();
        }
        let within = offset % PAGE;
        engine.region_mut().page_mut(page)[within] = byte;
    }

    #[test]
    fn pattern_survives_forced_eviction() {
        // 8-page region, 2-page cache: every page goes to a peer and
        // comes back before the final read.
        let mut engine = fifo_engine(2, 4, 2, EngineOptions::default());
        for n in 0..8usize {
            user_write(&mut engine, n * PAGE + 3, n as u8 + 10);
        }
        for n in 0..8usize {
            assert_eq!(
                user_read(&mut engine, n * PAGE + 3),
                n as u8 + 10,
                "page {n} lost its data"
            );
        }
        assert!(engine.stats().pages_sent >= 6);
        assert!(engine.stats().pages_received >= 6);
        engine.finalize().unwrap();
    }

    #[test]
    fn out_of_region_faults_are_reported_not_serviced() {
        let mut engine = fifo_engine(1, 4, 2, EngineOptions::default());
        let outcome = engine
            .service_fault(engine.layout().extent() + 100, AccessKind::Read)
            .unwrap();
        assert_eq!(outcome, FaultOutcome::OutOfRegion);
        assert_eq!(engine.stats().major_faults, 0);
    }

    #[test]
    fn reentrant_fault_on_a_different_page_is_fatal() {
        let mut engine = fifo_engine(1, 4, 2, EngineOptions::default());
        engine.current_fault = Some(PageIndex::new(0));
        let err = engine.service_fault(PAGE, AccessKind::Read).unwrap_err();
        assert!(matches!(
            err,
            FarmemError::ReentrantFault { page: 1, pending: 0 }
        ));
    }

    #[test]
    fn async_eviction_is_staged_across_faults() {
        let options = EngineOptions {
            async_evict: true,
            ..EngineOptions::default()
        };
        let mut engine = fifo_engine(1, 4, 1, options);

        user_write(&mut engine, 0, 1);
        // Fault on page 1 starts evicting page 0 asynchronously: the
        // page is demoted to read-only but keeps its backing.
        user_write(&mut engine, PAGE, 2);
        let p0 = PageIndex::new(0);
        assert!(engine.region().is_backed(p0));
        assert_eq!(engine.region().protection(p0), Protection::Read);
        assert_eq!(engine.stats().pages_sent, 0, "evict must not have completed");

        // The next fault retires the eviction before starting its own.
        user_write(&mut engine, 2 * PAGE, 3);
        assert!(!engine.region().is_backed(p0));
        assert_eq!(engine.stats().pages_sent, 1);
        engine.finalize().unwrap();
    }

    #[test]
    fn synchronous_eviction_completes_within_the_fault() {
        let mut engine = fifo_engine(1, 4, 1, EngineOptions::default());
        user_write(&mut engine, 0, 1);
        user_write(&mut engine, PAGE, 2);
        assert!(!engine.region().is_backed(PageIndex::new(0)));
        assert_eq!(engine.stats().pages_sent, 1);
    }

    #[test]
    fn read_only_admission_upgrades_on_write() {
        let (mut engine, _clock) = nru_engine(1, 8, 4, false, EngineOptions::default());
        assert_eq!(user_read(&mut engine, 0), 0);
        let p0 = PageIndex::new(0);
        assert_eq!(engine.region().protection(p0), Protection::Read);
        assert_eq!(engine.stats().major_faults, 1);

        user_write(&mut engine, 0, 9);
        assert_eq!(engine.region().protection(p0), Protection::ReadWrite);
        assert_eq!(engine.stats().minor_faults, 1);
        assert_eq!(engine.stats().major_faults, 1, "upgrade is not a fetch");
    }

    #[test]
    fn unwritten_pages_evict_clean() {
        let (mut engine, _clock) = nru_engine(1, 8, 2, false, EngineOptions::default());
        // Read three pages through a two-page cache: the evictions are
        // of never-written pages and must skip the network.
        for n in 0..3 {
            user_read(&mut engine, n * PAGE);
        }
        assert!(engine.stats().clean_evictions >= 1);
        assert_eq!(engine.stats().pages_sent, 0);
    }

    #[test]
    fn delta_prefetch_hits_a_strided_walk() {
        let options = EngineOptions {
            prefetch: PrefetchKind::Delta,
            ..EngineOptions::default()
        };
        let (mut engine, _clock) = nru_engine(2, 32, 16, true, options);

        user_read(&mut engine, 10 * PAGE);
        user_read(&mut engine, 20 * PAGE);
        assert_eq!(engine.prefetch_target(), Some(PageIndex::new(30)));

        user_read(&mut engine, 30 * PAGE);
        assert_eq!(engine.stats().good_prefetches, 1);
        assert_eq!(engine.prefetch_target(), Some(PageIndex::new(40)));

        let received_before = engine.stats().pages_received;
        user_read(&mut engine, 40 * PAGE);
        assert_eq!(engine.stats().good_prefetches, 2);
        assert_eq!(
            engine.stats().pages_received,
            received_before + 1,
            "a good prefetch is exactly one page transfer"
        );
        engine.finalize().unwrap();
    }

    #[test]
    fn wrong_prefetch_is_discarded_and_refetched() {
        let options = EngineOptions {
            prefetch: PrefetchKind::Next,
            ..EngineOptions::default()
        };
        let (mut engine, _clock) = nru_engine(2, 32, 16, true, options);

        user_write(&mut engine, 5 * PAGE, 55);
        assert_eq!(engine.prefetch_target(), Some(PageIndex::new(6)));
        // Jump elsewhere: the prefetched page 6 is wasted.
        user_write(&mut engine, 40 * PAGE, 44);
        assert_eq!(engine.stats().bad_prefetches, 1);
        assert_eq!(engine.prefetch_target(), Some(PageIndex::new(41)));
        assert_eq!(user_read(&mut engine, 40 * PAGE), 44);
        engine.finalize().unwrap();
    }

    #[test]
    fn prefetch_requires_a_residency_index() {
        let options = EngineOptions {
            prefetch: PrefetchKind::Next,
            ..EngineOptions::default()
        };
        // FIFO cannot answer residency queries: the engine must fall
        // back to no prefetching rather than guess.
        let mut engine = fifo_engine(1, 8, 4, options);
        user_read(&mut engine, 0);
        assert_eq!(engine.prefetch_target(), None);
    }

    #[test]
    fn staged_copy_mode_round_trips() {
        let options = EngineOptions {
            extra_memcpy: true,
            ..EngineOptions::default()
        };
        let mut engine = fifo_engine(2, 4, 2, options);
        for n in 0..8usize {
            user_write(&mut engine, n * PAGE, 100 + n as u8);
        }
        for n in 0..8usize {
            assert_eq!(user_read(&mut engine, n * PAGE), 100 + n as u8);
        }
    }

    #[test]
    fn touch_range_faults_in_a_span() {
        let mut engine = fifo_engine(1, 8, 4, EngineOptions::default());
        engine.touch_range(0, 4 * PAGE).unwrap();
        for n in 0..4 {
            assert!(engine
                .region()
                .accessible(PageIndex::new(n), AccessKind::Read));
        }
        assert_eq!(engine.stats().major_faults, 4);

        // A span larger than the cache is clamped, not an error.
        engine.touch_range(0, 8 * PAGE).unwrap();
    }

    #[test]
    fn prefill_backs_the_cold_prefix_without_traffic() {
        let mut engine = fifo_engine(1, 8, 4, EngineOptions::default());
        engine.prefill_cold_pages().unwrap();
        for n in 0..4 {
            assert!(engine
                .region()
                .accessible(PageIndex::new(n), AccessKind::Write));
        }
        assert_eq!(engine.stats().pages_received, 0);
        assert_eq!(engine.stats().major_faults, 0);

        // The fifth page still faults normally.
        user_write(&mut engine, 4 * PAGE, 1);
        assert_eq!(engine.stats().major_faults, 1);
    }

    #[test]
    fn nru_sweep_demotions_reach_the_region() {
        let (mut engine, clock) = nru_engine(1, 8, 4, false, EngineOptions::default());
        for n in 0..4 {
            user_read(&mut engine, n * PAGE);
        }
        clock.advance_ms(6000);
        engine.force_sweep().unwrap();
        for n in 0..4 {
            assert_eq!(
                engine.region().protection(PageIndex::new(n)),
                Protection::None,
                "page {n} must be demoted for reference sampling"
            );
        }
        // A read now is a minor fault that restores read access.
        let majors = engine.stats().major_faults;
        user_read(&mut engine, 0);
        assert_eq!(engine.stats().major_faults, majors);
        assert!(engine.stats().minor_faults >= 1);
        assert_eq!(
            engine.region().protection(PageIndex::new(0)),
            Protection::Read
        );
    }

    #[test]
    fn resident_set_never_exceeds_the_cache() {
        let mut engine = fifo_engine(2, 8, 3, EngineOptions::default());
        for n in 0..16usize {
            user_write(&mut engine, n * PAGE, n as u8);
            let backed = (0..engine.layout().num_pages())
                .filter(|&p| engine.region().is_backed(PageIndex::new(p)))
                .count();
            assert!(backed <= 3, "resident set grew to {backed}");
        }
    }
}
