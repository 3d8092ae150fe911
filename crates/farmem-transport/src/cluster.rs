//! Cluster bring-up: size negotiation and in-process deployment.
//!
//! Before any page traffic, the master and the peers agree on the
//! logical page size and on a single per-peer byte budget:
//!
//! 1. the master broadcasts the page size;
//! 2. every peer allocates its buffer, shrinking page-by-page until
//!    the allocation succeeds;
//! 3. all ranks reduce to the minimum so every peer holds the same
//!    amount, rounded down to a whole number of pages;
//! 4. optionally (`FM_REDUCEMEM`) every peer touches its full buffer
//!    twice and gives back one OS page per major fault observed on the
//!    second pass, followed by a second min-reduction.
//!
//! Setup traffic uses reserved tag bytes above the page-server range so
//! the five protocol tags keep their published meaning.

use farmem_error::{FarmemError, Result};
use farmem_types::PeerRank;
use tracing::{debug, info, warn};

use crate::fabric::{ChannelFabric, Fabric};
use crate::message::MessageTransport;
use crate::peer::{KeepResident, PeerServer};
use crate::wire::OffsetCodec;

/// Setup-phase tags, outside the page-server tag space.
const SETUP_PAGE_SIZE: u8 = 0xF0;
const SETUP_BUDGET: u8 = 0xF1;
const SETUP_AGREED: u8 = 0xF2;

/// Counts major page faults so buffer sizing can react to memory
/// pressure. The hosted implementation reads resource usage; tests and
/// in-process clusters use [`NoFaultProbe`].
pub trait FaultProbe: Send + Sync {
    /// Cumulative major-fault count for this process.
    fn major_faults(&self) -> u64;
}

/// A probe that never reports faults, disabling empirical reduction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaultProbe;

impl FaultProbe for NoFaultProbe {
    fn major_faults(&self) -> u64 {
        0
    }
}

/// Knobs for cluster bring-up.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Encode wire offsets in canonical byte order.
    pub heterogeneous: bool,
    /// Run the empirical touch-and-count buffer reduction.
    pub reduce_mem: bool,
    /// Ask peers to RAM-lock their buffers (they then park on a
    /// blocking receive instead of busy-touching).
    pub mlock: bool,
    /// OS page size, used as the touch stride.
    pub os_page_size: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            heterogeneous: false,
            reduce_mem: false,
            mlock: false,
            os_page_size: 4096,
        }
    }
}

fn encode_u64(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

fn decode_u64(body: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = body
        .try_into()
        .map_err(|_| FarmemError::internal("setup message with malformed length"))?;
    Ok(u64::from_be_bytes(bytes))
}

fn expect_setup(fabric: &impl Fabric, tag: u8) -> Result<u64> {
    let msg = fabric.recv()?;
    if msg.tag != tag {
        return Err(FarmemError::ProtocolSequence {
            expected: tag,
            actual: msg.tag,
        });
    }
    decode_u64(&msg.body)
}

/// Allocate as large a buffer as possible, shrinking one page at a time
/// from `budget` down. Mirrors the classic probe-by-allocation loop.
fn allocate_shrinking(budget: usize, page_size: usize) -> Result<Vec<u8>> {
    let mut want = budget;
    while want >= page_size {
        let mut buf: Vec<u8> = Vec::new();
        if buf.try_reserve_exact(want).is_ok() {
            buf.resize(want, 0);
            if want != budget {
                debug!(budget, got = want, "peer buffer shrunk to fit");
            }
            return Ok(buf);
        }
        want -= page_size;
    }
    Err(FarmemError::TransportInit {
        detail: format!("failed to allocate even one {page_size}-byte page of peer buffer"),
    })
}

/// Peer side of one min-reduction round: report a budget, receive the
/// agreed minimum.
fn peer_reduce(fabric: &impl Fabric, my_bytes: usize) -> Result<usize> {
    fabric.send(PeerRank::MASTER, SETUP_BUDGET, encode_u64(my_bytes as u64))?;
    let agreed = expect_setup(fabric, SETUP_AGREED)?;
    Ok(agreed as usize)
}

/// Master side of one min-reduction round over all peers.
fn master_reduce(fabric: &impl Fabric, page_size: usize) -> Result<usize> {
    let num_peers = fabric.num_ranks() - 1;
    let mut min_bytes = u64::MAX;
    for _ in 0..num_peers {
        let msg = fabric.recv()?;
        if msg.tag != SETUP_BUDGET {
            return Err(FarmemError::ProtocolSequence {
                expected: SETUP_BUDGET,
                actual: msg.tag,
            });
        }
        min_bytes = min_bytes.min(decode_u64(&msg.body)?);
    }
    // Round down to a whole number of logical pages.
    let agreed = (min_bytes as usize / page_size) * page_size;
    for rank in 1..=num_peers {
        fabric.send(PeerRank::new(rank), SETUP_AGREED, encode_u64(agreed as u64))?;
    }
    Ok(agreed)
}

/// Run the peer side of negotiation, then the event loop. Never
/// returns until terminated.
pub fn run_peer(
    fabric: ChannelFabric,
    requested_bytes: usize,
    probe: &dyn FaultProbe,
    options: &ClusterOptions,
) -> Result<Vec<u8>> {
    let page_size = expect_setup(&fabric, SETUP_PAGE_SIZE)? as usize;

    let mut buffer = allocate_shrinking(requested_bytes, page_size)?;
    let agreed = peer_reduce(&fabric, buffer.len())?;
    buffer.truncate(agreed);

    if options.reduce_mem {
        // Touch every OS page once to load the buffer, then again to
        // count how many no longer fit in RAM; give those back.
        for i in (0..buffer.len()).step_by(options.os_page_size) {
            buffer[i] = 0;
        }
        let before = probe.major_faults();
        for i in (0..buffer.len()).step_by(options.os_page_size) {
            buffer[i] = 0;
        }
        let new_faults = probe.major_faults() - before;
        if new_faults > 0 {
            let shrink = (new_faults as usize) * options.os_page_size;
            let reduced = buffer.len().saturating_sub(shrink);
            warn!(
                faults = new_faults,
                reduced, "peer buffer reduced after observing major faults"
            );
            buffer.truncate(reduced);
        }
        let agreed = peer_reduce(&fabric, buffer.len())?;
        buffer.truncate(agreed);
    }

    let keep = if options.mlock {
        KeepResident::Locked
    } else {
        KeepResident::BusyTouch
    };
    let codec = OffsetCodec::new(options.heterogeneous);
    let server = PeerServer::new(
        fabric,
        buffer,
        page_size,
        options.os_page_size,
        codec,
        keep,
    );
    server.run()
}

/// Run the master side of negotiation. Returns the agreed per-peer
/// byte budget.
pub fn negotiate_master(
    fabric: &ChannelFabric,
    page_size: usize,
    options: &ClusterOptions,
) -> Result<usize> {
    for rank in 1..fabric.num_ranks() {
        fabric.send(PeerRank::new(rank), SETUP_PAGE_SIZE, encode_u64(page_size as u64))?;
    }
    let mut agreed = master_reduce(fabric, page_size)?;
    if options.reduce_mem {
        agreed = master_reduce(fabric, page_size)?;
    }
    if agreed == 0 {
        return Err(FarmemError::TransportInit {
            detail: "peers agreed on a zero-byte budget".into(),
        });
    }
    info!(per_peer_bytes = agreed, "cluster negotiation complete");
    Ok(agreed)
}

/// A running in-process cluster.
pub struct SpawnedCluster {
    /// The master's transport.
    pub transport: MessageTransport<ChannelFabric>,
    /// Agreed per-peer byte budget.
    pub per_peer_bytes: usize,
    /// Peer threads; join after `finalize` to collect their buffers.
    pub peers: Vec<std::thread::JoinHandle<Result<Vec<u8>>>>,
}

/// Spawn `num_peers` peer threads plus the master transport, run
/// negotiation, and return the ready-to-use cluster.
pub fn spawn_cluster(
    num_peers: u32,
    page_size: usize,
    requested_peer_bytes: usize,
    options: ClusterOptions,
) -> Result<SpawnedCluster> {
    let mut fabrics = ChannelFabric::cluster(num_peers + 1);
    let master_fabric = fabrics.remove(0);

    let mut peers = Vec::with_capacity(num_peers as usize);
    for fabric in fabrics {
        let opts = options.clone();
        peers.push(
            std::thread::Builder::new()
                .name(format!("farmem-peer-{}", fabric.rank()))
                .spawn(move || run_peer(fabric, requested_peer_bytes, &NoFaultProbe, &opts))
                .map_err(|e| FarmemError::TransportInit {
                    detail: format!("failed to spawn peer thread: {e}"),
                })?,
        );
    }

    let per_peer_bytes = negotiate_master(&master_fabric, page_size, &options)?;
    let codec = OffsetCodec::new(options.heterogeneous);
    Ok(SpawnedCluster {
        transport: MessageTransport::new(master_fabric, page_size, codec),
        per_peer_bytes,
        peers,
    })
}
