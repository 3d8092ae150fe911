//! Hosted end-to-end: real mapped memory, a real SIGSEGV handler, real
//! peer threads. The test program below is the canonical smoke
//! workload — fill an array bigger than the local cache, sum it, and
//! check the closed form — executed through actual pointer dereferences
//! that trap and resume.
//!
//! Everything lives in one `#[test]` because the fault handler is
//! process-global state; independent tests would race its
//! installation.

use farmem_host::bootstrap;
use farmem_host::sysinfo::os_page_size;
use farmem_types::{
    config::{CountSpec, PageSizeSpec},
    EngineConfig, PolicyKind,
};

#[test]
fn paged_memory_round_trips_through_real_faults() {
    let os_page = os_page_size();

    let mut config = EngineConfig::default();
    config.ranks = Some(3); // master + 2 peers
    config.page_size = PageSizeSpec::Bytes(os_page);
    config.peer_mem = Some(64 * os_page);
    config.master_mem = Some(32 * os_page);
    config.local_pages = Some(CountSpec::Count(4));
    config.policy = PolicyKind::Fifo;

    let host = bootstrap(config).expect("bootstrap");
    let extent = host.region_extent();
    assert_eq!(extent, 2 * 64 * os_page);

    // An array of u32 spanning 32 pages: eight times the local cache.
    let span_bytes = 32 * os_page;
    let addr = host.user_alloc(span_bytes).expect("user allocation");
    assert!(addr >= host.region_base() && addr < host.region_base() + extent);

    let words = span_bytes / 4;
    let base = addr as *mut u32;

    // Fill a[i] = i + 1 through raw stores; most of them trap.
    for i in 0..words {
        // SAFETY: addr..addr+span_bytes is ours; the fault handler
        // makes the pages real as we touch them.
        unsafe { base.add(i).write_volatile(i as u32 + 1) };
    }

    // Sum it back; the reads page everything in again.
    let mut sum = 0u32;
    for i in 0..words {
        // SAFETY: as above.
        sum = sum.wrapping_add(unsafe { base.add(i).read_volatile() });
    }
    let n = words as u64;
    let expected = (n * (n + 1) / 2) as u32;
    assert_eq!(sum, expected, "a page was lost or corrupted in transit");

    // The workload cannot have fit in the cache: pages must have moved.
    {
        let engine = host.engine().expect("paged mode").lock();
        let stats = engine.stats();
        assert!(stats.major_faults >= 28, "major faults: {}", stats.major_faults);
        assert!(stats.pages_sent > 0, "nothing was ever evicted to a peer");
        assert!(stats.pages_received > 0);
    }

    // Second allocation beyond the region must fail; a modest one works.
    assert!(host.user_alloc(extent).is_err());
    let small = host.user_alloc(os_page).expect("small allocation");
    host.user_free(small).expect("free");

    host.finalize().expect("finalize");
}
