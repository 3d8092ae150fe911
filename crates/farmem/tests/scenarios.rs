//! End-to-end scenarios over the full in-process stack: real peer
//! threads, real wire traffic, modeled traps. Region and cache sizes
//! are scaled down from production so each scenario still forces every
//! page through eviction where it means to.

use farmem::sim::{SimNode, SimSettings};
use farmem::{EngineOptions, PageIndex, PolicyKind, PrefetchKind};
use farmem_types::EngineConfig;

const PAGE: usize = 4096;

fn settings(policy: PolicyKind, peers: u32, pages_per_peer: usize, cache: usize) -> SimSettings {
    SimSettings {
        num_peers: peers,
        page_size: PAGE,
        pages_per_peer,
        local_pages: cache,
        policy,
        ..SimSettings::default()
    }
}

/// Fill an integer array spanning the whole pooled region with
/// `a[i] = i + 1`, then sum it with wrapping arithmetic. Every page is
/// written, evicted to a peer, and read back; the sum only comes out
/// right if no byte was lost in transit.
#[test]
fn fill_and_sum_through_eviction() {
    // 2 peers x 32 pages = 256 KiB of pooled memory, 4-page cache.
    let mut node = SimNode::build(settings(PolicyKind::Fifo, 2, 32, 4)).unwrap();

    // An allocation larger than the pooled extent must fail.
    let oversized = node.extent() + PAGE;
    assert!(node.alloc(oversized).is_err());

    // An allocation that fits succeeds and is filled and summed.
    let count = (node.extent() / 4) as u32; // u32 slots
    let base = node.alloc(count as usize * 4).unwrap();

    for i in 0..count {
        node.write_u32(base + i as usize * 4, i + 1).unwrap();
    }
    let mut sum = 0u32;
    for i in 0..count {
        sum = sum.wrapping_add(node.read_u32(base + i as usize * 4).unwrap());
    }

    // Closed form of 1 + 2 + ... + n, wrapping at 2^32.
    let n = u64::from(count);
    let expected = (n * (n + 1) / 2) as u32;
    assert_eq!(sum, expected);

    let stats = node.engine().stats();
    assert!(stats.pages_sent > 0, "the workload must actually evict");
    assert!(stats.pages_received > u64::from(count / 1024));
    node.finalize().unwrap();
}

/// NRU with read-only admission: after a sweep, a page touched for
/// reading is in a higher class than its untouched neighbors and must
/// not be the eviction victim.
#[test]
fn nru_protects_the_recently_read_page() {
    let mut config = EngineConfig::default();
    config.nru_readwrite = false;
    config.nru_interval_ms = 5000;

    for seed in 0..8 {
        let mut settings = settings(PolicyKind::Nru, 2, 16, 4);
        settings.config = config.clone();
        settings.rng_seed = seed;
        let mut node = SimNode::build(settings).unwrap();

        // Touch pages 0..4 read-only.
        for n in 0..4 {
            let mut byte = [0u8];
            node.read_bytes(n * PAGE, &mut byte).unwrap();
        }
        // Force the reference-bit sweep, then read page 0 again.
        node.clock().unwrap().advance_ms(6000);
        node.engine_mut().force_sweep().unwrap();
        let mut byte = [0u8];
        node.read_bytes(0, &mut byte).unwrap();

        // One more fault forces an eviction: the victim must be one of
        // the unreferenced pages, never page 0.
        node.write_bytes(10 * PAGE, &[1]).unwrap();
        assert!(
            node.engine().region().is_backed(PageIndex::new(0)),
            "seed {seed}: the recently read page was evicted"
        );
        node.finalize().unwrap();
    }
}

/// NRE: with a 4-entry history and an ample retry budget, a fresh
/// fault never evicts any of the last four victims. (With a small
/// budget the policy may legitimately fall back to a ringed victim
/// once the retries are spent; a generous budget pins the property.)
#[test]
fn nre_avoids_recent_victims() {
    let mut config = EngineConfig::default();
    config.nre_entries = 4;
    config.nre_retries = 64;

    let mut settings = settings(PolicyKind::Nre, 2, 32, 8);
    settings.config = config;
    let mut node = SimNode::build(settings).unwrap();

    // Fill the cache, then keep faulting fresh pages, reconstructing
    // the victim of each fault from the region model.
    let mut resident: Vec<u32> = (0..8).collect();
    for n in 0..8usize {
        node.write_bytes(n * PAGE, &[n as u8]).unwrap();
    }
    let mut recent: Vec<u32> = Vec::new();
    for n in 8..48usize {
        node.write_bytes(n * PAGE, &[n as u8]).unwrap();
        let victim = *resident
            .iter()
            .find(|&&p| !node.engine().region().is_backed(PageIndex::new(p)))
            .expect("every fault past the fill evicts exactly one page");
        assert!(
            !recent.contains(&victim),
            "fault {n}: victim {victim} is within the last {} evictions",
            recent.len()
        );
        let pos = resident.iter().position(|&p| p == victim).unwrap();
        resident[pos] = n as u32;
        recent.push(victim);
        if recent.len() > 4 {
            recent.remove(0);
        }
    }
    node.finalize().unwrap();
}

/// Delta prefetch across a strided page walk: after the stride is
/// established, each fault finds its page already in flight.
#[test]
fn delta_prefetch_follows_the_stride() {
    let mut settings = settings(PolicyKind::Nru, 2, 32, 16);
    settings.options = EngineOptions {
        prefetch: PrefetchKind::Delta,
        ..EngineOptions::default()
    };
    let mut node = SimNode::build(settings).unwrap();

    let mut byte = [0u8];
    node.read_bytes(10 * PAGE, &mut byte).unwrap();
    node.read_bytes(20 * PAGE, &mut byte).unwrap();
    node.read_bytes(30 * PAGE, &mut byte).unwrap();
    assert_eq!(node.engine().prefetch_target(), Some(PageIndex::new(40)));

    let received_before = node.engine().stats().pages_received;
    let good_before = node.engine().stats().good_prefetches;
    node.read_bytes(40 * PAGE, &mut byte).unwrap();
    let stats = node.engine().stats();
    assert_eq!(stats.good_prefetches, good_before + 1);
    assert_eq!(stats.pages_received, received_before + 1);
    node.finalize().unwrap();
}

/// Two workers sharing one node: accesses interleave arbitrarily but
/// serialize through the engine, and both observe their own data.
#[test]
fn concurrent_workers_see_consistent_data() {
    use std::sync::{Arc, Mutex};

    let node = Arc::new(Mutex::new(
        SimNode::build(settings(PolicyKind::Fifo, 2, 32, 4)).unwrap(),
    ));

    let mut handles = Vec::new();
    for worker in 0..2u8 {
        let node = Arc::clone(&node);
        handles.push(std::thread::spawn(move || {
            // Disjoint page sets per worker.
            for round in 0..8usize {
                let page = worker as usize * 32 + round * 2;
                let offset = page * PAGE;
                let value = u32::from(worker) << 16 | round as u32;
                node.lock().unwrap().write_u32(offset, value).unwrap();
            }
            for round in 0..8usize {
                let page = worker as usize * 32 + round * 2;
                let offset = page * PAGE;
                let expected = u32::from(worker) << 16 | round as u32;
                let got = node.lock().unwrap().read_u32(offset).unwrap();
                assert_eq!(got, expected, "worker {worker} round {round}");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let node = Arc::try_unwrap(node)
        .unwrap_or_else(|_| panic!("workers still hold the node"))
        .into_inner()
        .unwrap();
    assert!(node.backed_pages() <= 4);
    node.finalize().unwrap();
}

/// A chunked read larger than the local cache lands intact: the chunks
/// are pre-faulted so every byte arrives even though the destination
/// pages can't all be resident at once.
#[test]
fn chunked_file_read_spans_more_pages_than_the_cache() {
    use std::io::Write as _;

    // 64-page region, 8-page cache, 64-page (256 KiB) transfer.
    let mut node = SimNode::build(settings(PolicyKind::Fifo, 2, 32, 8)).unwrap();
    let total = 64 * PAGE;

    let mut file = tempfile::tempfile().unwrap();
    let pattern: Vec<u8> = (0..total).map(|i| (i % 249) as u8).collect();
    file.write_all(&pattern).unwrap();
    let mut file = {
        use std::io::Seek as _;
        file.seek(std::io::SeekFrom::Start(0)).unwrap();
        file
    };

    let read = farmem_host::intercept::chunked_read_into_region(
        node.engine_mut(),
        0,
        total,
        &mut file,
        PAGE,
    )
    .unwrap();
    assert_eq!(read, total);

    // Read back through the paging path and compare.
    let mut out = vec![0u8; total];
    node.read_bytes(0, &mut out).unwrap();
    assert_eq!(out, pattern);
    node.finalize().unwrap();
}
