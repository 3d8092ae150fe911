//! Bootstrap: from configuration to a running paging host.
//!
//! Order matters here and mirrors the dependency chain: logging, page
//! size, memory grab, cluster negotiation, region placement, cache
//! sizing, policy wiring, cold-page prefill, and finally the signal
//! handler. Peers never return from [`bootstrap`] — their event loop
//! runs until the master broadcasts termination.
//!
//! Deployments with a real multi-node fabric substitute their own
//! [`farmem_transport::Fabric`]; this bootstrap wires the in-process
//! channel fabric, which needs the rank count from `FM_RANKS`.

use std::sync::Arc;

use farmem_error::{FarmemError, Result};
use farmem_pager::policy::{build_policy, NruOptions, PolicyConfig};
use farmem_pager::region::RegionMemory;
use farmem_pager::{EngineOptions, FaultOutcome, PagingEngine, SystemClock};
use farmem_transport::{
    spawn_cluster, ChannelFabric, ClusterOptions, MessageTransport, PageTransport,
};
use farmem_types::{
    AccessKind, CountSpec, EngineConfig, PageIndex, PageSize, PageSizeSpec, Protection,
    RegionLayout,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::alloc::RegionHeap;
use crate::intercept::FaultSignalLedger;
use crate::region::MappedRegion;
use crate::signal::{self, FaultDisposition};
use crate::sysinfo;
use crate::threads::{CoreSync, NoFreezeProbe, SegvSignaller};

/// The engine type of the hosted deployment.
pub type HostEngine = PagingEngine<MessageTransport<ChannelFabric>, MappedRegion>;

/// Local cache size in pages: what fits in the master's RAM, bounded
/// by the kernel's mapping budget (the worst resident pattern needs
/// one mapping per cached page plus one per hole), optionally
/// overridden, and never larger than the region itself.
pub fn compute_local_pages(
    master_bytes: usize,
    page_size: usize,
    max_maps: Option<usize>,
    override_spec: Option<CountSpec>,
    extent: usize,
) -> usize {
    let mut max_local = master_bytes / page_size;
    if let Some(maps) = max_maps.filter(|&m| m > 0) {
        if max_local >= maps * 2 {
            max_local = maps * 2 - 1;
        }
    }
    let mut local = override_spec.map_or(max_local, |spec| spec.resolve(max_local));
    if local > max_local {
        warn!(
            requested = local,
            available = max_local,
            "more local pages requested than seem to be available"
        );
    }
    if local * page_size > extent {
        local = extent / page_size;
    }
    local
}

/// Coax the kernel into releasing buffer-cache memory by repeatedly
/// allocating everything it reports free and touching it.
fn grab_memory(os_page: usize) {
    const ROUNDS: usize = 3;
    for _ in 0..ROUNDS {
        let Ok(avail) = sysinfo::available_memory(None) else {
            return;
        };
        let mut buffer: Vec<u8> = Vec::new();
        if buffer.try_reserve_exact(avail).is_err() {
            continue;
        }
        buffer.resize(avail, 0);
        let mut checksum = 0u8;
        for i in (0..buffer.len()).step_by(os_page) {
            checksum ^= buffer[i];
        }
        std::hint::black_box(checksum);
    }
}

/// Empirically shrink the local cache until backing and touching it
/// causes no major faults, pushing every page through one fetch/evict
/// round trip so the transport allocates its own memory up front.
fn reduce_master_cache(
    region: &mut MappedRegion,
    transport: &mut MessageTransport<ChannelFabric>,
    layout: &RegionLayout,
    mut local_pages: usize,
    os_page: usize,
) -> Result<usize> {
    let page_size = layout.page_size();

    // Back as many cache pages as the OS will give us.
    while local_pages >= 1 {
        match region.back(PageIndex::new(0), local_pages, Protection::ReadWrite) {
            Ok(()) => break,
            Err(_) => local_pages -= 1,
        }
    }
    if local_pages == 0 {
        return Err(FarmemError::NoCachePage);
    }

    // Touch every OS page once to load it.
    for p in 0..local_pages {
        let page = region.page_mut(PageIndex::new(p as u32));
        for i in (0..page_size).step_by(os_page) {
            page[i] = 0;
        }
    }

    // One full fetch and evict round trip per cached page.
    let mut scratch = vec![0u8; page_size];
    for p in 0..local_pages as u32 {
        let remote = layout.remote_ref(PageIndex::new(p));
        let ticket = transport.fetch_begin(remote)?;
        transport.fetch_end(ticket, &mut scratch)?;
    }
    for p in 0..local_pages as u32 {
        let remote = layout.remote_ref(PageIndex::new(p));
        let ticket = transport.evict_begin(remote, &scratch)?;
        transport.evict_end(ticket)?;
    }

    // Touch again; every major fault now means a page that no longer
    // fits in RAM.
    let faults_before = sysinfo::major_faults();
    for p in 0..local_pages {
        let page = region.page_mut(PageIndex::new(p as u32));
        for i in (0..page_size).step_by(os_page) {
            page[i] = 0;
        }
    }
    let new_faults = sysinfo::major_faults().saturating_sub(faults_before);

    for p in 0..local_pages as u32 {
        region.unback(PageIndex::new(p))?;
    }

    if new_faults > 0 {
        let shrink = ((new_faults as usize * os_page) + page_size - 1) / page_size;
        let reduced = local_pages.saturating_sub(shrink).max(1);
        info!(
            faults = new_faults,
            from = local_pages,
            to = reduced,
            "reducing the local cache after observing major faults"
        );
        local_pages = reduced;
    }
    Ok(local_pages)
}

/// A running farmem host.
///
/// In the paged mode the managed region spans the pooled memory of the
/// peers and the fault handler keeps the local window fresh; with no
/// peers configured the region is plain local memory and paging is
/// disabled.
pub struct HostRuntime {
    sync: Arc<CoreSync>,
    engine: Option<Mutex<HostEngine>>,
    /// Region base/extent; in local-only mode the backing region lives
    /// here instead of inside an engine.
    local_region: Option<Mutex<MappedRegion>>,
    region_base: usize,
    region_extent: usize,
    user_heap: Mutex<RegionHeap>,
    /// Recorded-but-not-applied user fault-signal installations.
    pub signal_ledger: FaultSignalLedger,
    peers: Mutex<Vec<std::thread::JoinHandle<Result<Vec<u8>>>>>,
}

impl HostRuntime {
    /// Absolute base of the managed region.
    #[must_use]
    pub fn region_base(&self) -> usize {
        self.region_base
    }

    /// Bytes in the managed region.
    #[must_use]
    pub fn region_extent(&self) -> usize {
        self.region_extent
    }

    #[must_use]
    pub fn sync(&self) -> &Arc<CoreSync> {
        &self.sync
    }

    /// The engine, in paged mode.
    pub fn engine(&self) -> Option<&Mutex<HostEngine>> {
        self.engine.as_ref()
    }

    /// The backing region, in the peerless local-only mode.
    pub fn local_region(&self) -> Option<&Mutex<MappedRegion>> {
        self.local_region.as_ref()
    }

    /// Allocate user memory from the region-backed heap (or internal
    /// memory when called from inside the core).
    pub fn user_alloc(&self, bytes: usize) -> Result<usize> {
        if self.sync.in_core() {
            // Core code must never receive paged memory: hand out an
            // ordinary allocation and verify it is outside the region.
            let layout = std::alloc::Layout::from_size_align(bytes.max(1), 16)
                .map_err(|_| FarmemError::internal("bad allocation layout"))?;
            // SAFETY: layout has nonzero size.
            let ptr = unsafe { std::alloc::alloc(layout) } as usize;
            if ptr == 0 {
                return Err(FarmemError::internal("internal allocation failed"));
            }
            crate::alloc::check_internal_ptr(ptr, self.region_base, self.region_extent)?;
            return Ok(ptr);
        }
        let offset = self.sync.with(|| self.user_heap.lock().allocate(bytes))?;
        Ok(self.region_base + offset)
    }

    /// Free memory returned by [`HostRuntime::user_alloc`] from user
    /// context.
    pub fn user_free(&self, addr: usize) -> Result<()> {
        let offset = addr
            .checked_sub(self.region_base)
            .filter(|&o| o < self.region_extent)
            .ok_or_else(|| FarmemError::internal("free of a non-heap address"))?;
        self.sync.with(|| self.user_heap.lock().free(offset))
    }

    /// The fault hook: the serialization point of the whole system.
    fn on_access_violation(&self, addr: usize, kind: AccessKind) -> FaultDisposition {
        self.sync.enter();

        // A frozen thread re-enters here by design; it leaves as soon
        // as it wins the lock.
        let record = self.sync.current_record(false);
        if record.must_bail() {
            self.sync.exit();
            return FaultDisposition::Handled;
        }

        let offset = addr.checked_sub(self.region_base).filter(|&o| o < self.region_extent);
        let Some(offset) = offset else {
            self.sync.exit();
            return FaultDisposition::NotOurs;
        };

        let Some(engine) = self.engine.as_ref() else {
            // Local-only mode never protects region pages; a fault here
            // is a real crash in user code.
            self.sync.exit();
            return FaultDisposition::NotOurs;
        };

        self.sync
            .freeze_peer_threads(&SegvSignaller, &NoFreezeProbe);

        let outcome = engine.lock().service_fault(offset, kind);
        self.sync.exit();

        match outcome {
            Ok(FaultOutcome::OutOfRegion) => FaultDisposition::NotOurs,
            Ok(_) => FaultDisposition::Handled,
            Err(err) => {
                crate::abort::fatal(&err, || {
                    let _ = self.shutdown_subsystems();
                });
            }
        }
    }

    fn shutdown_subsystems(&self) -> Result<()> {
        let _ = signal::restore_previous();
        if let Some(engine) = self.engine.as_ref() {
            engine.lock().finalize()?;
        }
        for peer in self.peers.lock().drain(..) {
            let _ = peer.join();
        }
        Ok(())
    }

    /// Orderly shutdown: drain in-flight operations, terminate peers,
    /// restore the original fault handler.
    pub fn finalize(&self) -> Result<()> {
        self.sync.with(|| self.shutdown_subsystems())
    }
}

/// Bring the whole system up from configuration.
pub fn bootstrap(config: EngineConfig) -> Result<Arc<HostRuntime>> {
    crate::telemetry::init(config.debug_level);
    let os_page = sysinfo::os_page_size();

    let available = sysinfo::available_memory(config.reserve_mem)?;
    let page_size = match config.page_size {
        PageSizeSpec::Bytes(bytes) => PageSize::new(bytes, os_page)?,
        PageSizeSpec::Auto => {
            let maps = sysinfo::max_map_count().unwrap_or(0);
            if maps == 0 {
                warn!("cannot determine the mapping limit; using the OS page size");
            }
            PageSize::new(
                sysinfo::min_safe_page_size(available, maps, os_page),
                os_page,
            )?
        }
    };
    info!(page_size = page_size.get(), "logical page size selected");

    if config.reduce_mem {
        // Flushing the kernel's caches only pays off when the sizing
        // below is going to measure real memory pressure.
        grab_memory(os_page);
    }

    let ranks = config.ranks.unwrap_or(2);
    let num_peers = ranks.saturating_sub(1);
    let peer_budget = config.peer_mem.unwrap_or(available);

    if num_peers == 0 {
        // Degraded mode: no peers to pool, so the "huge" region is just
        // local memory and every access is ordinary.
        let extent = (peer_budget / page_size.get()).max(1) * page_size.get();
        let layout = RegionLayout::new(page_size, extent, 1, config.distribution)?;
        let mut region = MappedRegion::reserve(&layout, config.base_addr, config.mlock)?;
        region.back(PageIndex::new(0), layout.num_pages() as usize, Protection::ReadWrite)?;
        info!(extent, "no peers available; all memory is local");
        let (base, extent) = (region.base(), region.extent());
        return Ok(Arc::new(HostRuntime {
            sync: Arc::new(CoreSync::new()),
            engine: None,
            local_region: Some(Mutex::new(region)),
            region_base: base,
            region_extent: extent,
            user_heap: Mutex::new(RegionHeap::new(0, extent)),
            signal_ledger: FaultSignalLedger::new(),
            peers: Mutex::new(Vec::new()),
        }));
    }

    // Transport helper threads must be able to allocate internally.
    let cluster_options = ClusterOptions {
        heterogeneous: config.heterogeneous,
        reduce_mem: config.reduce_mem,
        mlock: config.mlock,
        os_page_size: os_page,
    };
    let cluster = spawn_cluster(num_peers, page_size.get(), peer_budget, cluster_options)?;
    let mut transport = cluster.transport;

    let layout = RegionLayout::new(
        page_size,
        cluster.per_peer_bytes,
        num_peers,
        config.distribution,
    )?;
    let mut region = MappedRegion::reserve(&layout, config.base_addr, config.mlock)?;

    let master_bytes = config.master_mem.unwrap_or(available);
    let mut local_pages = compute_local_pages(
        master_bytes,
        page_size.get(),
        sysinfo::max_map_count(),
        config.local_pages,
        layout.extent(),
    );
    if config.reduce_mem && config.local_pages.is_none() {
        local_pages =
            reduce_master_cache(&mut region, &mut transport, &layout, local_pages, os_page)?;
    }
    debug!(local_pages, "local cache sized");

    let clock = Arc::new(SystemClock::new());
    let policy = build_policy(
        &PolicyConfig {
            kind: config.policy,
            nre_entries: config.nre_entries,
            nre_retries: config.nre_retries,
            nru: NruOptions {
                interval_ms: config.nru_interval_ms,
                readwrite: config.nru_readwrite,
            },
            local_pages_explicit: config.local_pages.is_some(),
        },
        local_pages,
        page_size.get(),
        clock.clone(),
        StdRng::from_entropy(),
    )?;

    let engine_options = EngineOptions {
        prefetch: config.prefetch,
        async_evict: config.async_evict,
        extra_memcpy: config.extra_memcpy,
        heartbeat_secs: config.heartbeat_secs,
    };
    let (base, extent) = (region.base(), region.extent());
    let mut engine = PagingEngine::new(layout, region, transport, policy, engine_options, clock)?;
    engine.prefill_cold_pages()?;

    let runtime = Arc::new(HostRuntime {
        sync: Arc::new(CoreSync::new()),
        engine: Some(Mutex::new(engine)),
        local_region: None,
        region_base: base,
        region_extent: extent,
        user_heap: Mutex::new(RegionHeap::new(0, extent)),
        signal_ledger: FaultSignalLedger::new(),
        peers: Mutex::new(cluster.peers),
    });

    let hook_runtime = Arc::clone(&runtime);
    signal::install(Box::new(move |addr, kind| {
        hook_runtime.on_access_violation(addr, kind)
    }))?;

    info!(
        base = format_args!("{base:#x}"),
        extent, "farmem is running"
    );
    Ok(runtime)
}
