//! A complete farmem deployment in one process.
//!
//! [`SimNode`] wires real peer threads (over the channel fabric), the
//! real engine, and an in-memory region that models page protections.
//! User accesses go through [`SimNode::read_bytes`] and
//! [`SimNode::write_bytes`], which replay the hardware's
//! trap-service-resume loop in miniature: every access checks the
//! modeled MMU and services faults until the access is admitted.
//!
//! Everything the engine does here — the wire traffic, the eviction
//! decisions, the statistics — is exactly what the hosted deployment
//! does; only the trap delivery is simulated.

use std::sync::Arc;

use farmem_error::{FarmemError, Result};
use farmem_pager::policy::{build_policy, NruOptions, PolicyConfig};
use farmem_pager::region::{MemRegion, RegionMemory};
use farmem_pager::{
    AccessKind, Clock, EngineOptions, ManualClock, PagingEngine, SystemClock,
};
use farmem_transport::{spawn_cluster, ChannelFabric, ClusterOptions, MessageTransport};
use farmem_types::{
    EngineConfig, PageIndex, PageSize, PolicyKind, RegionLayout,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// The engine type a simulated node runs.
pub type SimEngine = PagingEngine<MessageTransport<ChannelFabric>, MemRegion>;

/// Settings for a simulated deployment.
#[derive(Debug, Clone)]
pub struct SimSettings {
    pub num_peers: u32,
    pub page_size: usize,
    pub pages_per_peer: usize,
    pub local_pages: usize,
    pub policy: PolicyKind,
    pub options: EngineOptions,
    /// Drive time manually (NRU sweeps, heartbeat) instead of from the
    /// wall clock.
    pub manual_clock: bool,
    pub rng_seed: u64,
    /// Policy knobs lifted from the configuration surface.
    pub config: EngineConfig,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            num_peers: 2,
            page_size: 4096,
            pages_per_peer: 16,
            local_pages: 4,
            policy: PolicyKind::Fifo,
            options: EngineOptions::default(),
            manual_clock: true,
            rng_seed: 0x5eed,
            config: EngineConfig::default(),
        }
    }
}

/// One whole deployment: master engine plus live peer threads.
pub struct SimNode {
    engine: SimEngine,
    manual_clock: Option<Arc<ManualClock>>,
    /// Watermark allocator state for [`SimNode::alloc`].
    next_alloc: usize,
    peers: Vec<std::thread::JoinHandle<Result<Vec<u8>>>>,
    page_size: usize,
    extent: usize,
}

impl SimNode {
    pub fn build(settings: SimSettings) -> Result<Self> {
        let cluster = spawn_cluster(
            settings.num_peers,
            settings.page_size,
            settings.pages_per_peer * settings.page_size,
            ClusterOptions {
                heterogeneous: settings.config.heterogeneous,
                ..ClusterOptions::default()
            },
        )?;
        let layout = RegionLayout::new(
            PageSize::from_raw(settings.page_size),
            cluster.per_peer_bytes,
            settings.num_peers,
            settings.config.distribution,
        )?;
        let region = MemRegion::new(&layout);

        let manual_clock = settings.manual_clock.then(|| Arc::new(ManualClock::new()));
        let clock: Arc<dyn Clock> = match &manual_clock {
            Some(manual) => manual.clone(),
            None => Arc::new(SystemClock::new()),
        };

        let policy = build_policy(
            &PolicyConfig {
                kind: settings.policy,
                nre_entries: settings.config.nre_entries,
                nre_retries: settings.config.nre_retries,
                nru: NruOptions {
                    interval_ms: settings.config.nru_interval_ms,
                    readwrite: settings.config.nru_readwrite,
                },
                // Simulated nodes size their cache explicitly.
                local_pages_explicit: true,
            },
            settings.local_pages,
            settings.page_size,
            clock.clone(),
            StdRng::seed_from_u64(settings.rng_seed),
        )?;

        let extent = layout.extent();
        let engine = PagingEngine::new(
            layout,
            region,
            cluster.transport,
            policy,
            settings.options,
            clock,
        )?;
        Ok(Self {
            engine,
            manual_clock,
            next_alloc: 0,
            peers: cluster.peers,
            page_size: settings.page_size,
            extent,
        })
    }

    #[must_use]
    pub fn engine(&self) -> &SimEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SimEngine {
        &mut self.engine
    }

    /// The manual clock, when the node was built with one.
    #[must_use]
    pub fn clock(&self) -> Option<&Arc<ManualClock>> {
        self.manual_clock.as_ref()
    }

    #[must_use]
    pub fn extent(&self) -> usize {
        self.extent
    }

    /// Allocate a span of the region, watermark style: fails past the
    /// region's end exactly like the hosted user heap's grow.
    pub fn alloc(&mut self, bytes: usize) -> Result<usize> {
        let aligned = bytes.div_ceil(16) * 16;
        if self.next_alloc + aligned > self.extent {
            return Err(FarmemError::internal("allocation exceeds the region"));
        }
        let offset = self.next_alloc;
        self.next_alloc += aligned;
        Ok(offset)
    }

    /// Replay one user access until the modeled MMU admits it.
    fn admit(&mut self, offset: usize, kind: AccessKind) -> Result<()> {
        let page = self.engine.layout().page_of(offset);
        loop {
            if self.engine.region().accessible(page, kind) {
                return Ok(());
            }
            self.engine.service_fault(offset, kind)?;
        }
    }

    /// User-level read of an arbitrary span.
    pub fn read_bytes(&mut self, mut offset: usize, out: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < out.len() {
            self.admit(offset, AccessKind::Read)?;
            let page = self.engine.layout().page_of(offset);
            let within = offset % self.page_size;
            let take = (self.page_size - within).min(out.len() - pos);
            out[pos..pos + take]
                .copy_from_slice(&self.engine.region().page(page)[within..within + take]);
            pos += take;
            offset += take;
        }
        Ok(())
    }

    /// User-level write of an arbitrary span.
    pub fn write_bytes(&mut self, mut offset: usize, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < data.len() {
            self.admit(offset, AccessKind::Write)?;
            let page = self.engine.layout().page_of(offset);
            let within = offset % self.page_size;
            let take = (self.page_size - within).min(data.len() - pos);
            self.engine.region_mut().page_mut(page)[within..within + take]
                .copy_from_slice(&data[pos..pos + take]);
            pos += take;
            offset += take;
        }
        Ok(())
    }

    pub fn read_u32(&mut self, offset: usize) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read_bytes(offset, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Resident page count as the modeled MMU sees it.
    #[must_use]
    pub fn backed_pages(&self) -> usize {
        let layout = self.engine.layout();
        (0..layout.num_pages())
            .filter(|&p| self.engine.region().is_backed(PageIndex::new(p)))
            .count()
    }

    /// Shut down: drain the engine, terminate the peers, join them.
    pub fn finalize(mut self) -> Result<()> {
        self.engine.finalize()?;
        for peer in self.peers {
            peer.join()
                .map_err(|_| FarmemError::internal("peer thread panicked"))??;
        }
        Ok(())
    }
}
