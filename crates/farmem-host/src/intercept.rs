//! The interception surface.
//!
//! A handful of host interactions must be steered away from defaults
//! that would destabilize paging: signal-mask changes must never block
//! the fault signal, user mappings must never land inside the managed
//! region, memory-size queries should advertise the pooled extent, and
//! bulk I/O against paged buffers must be chunked so the kernel never
//! faults while holding its own locks. Each concern is expressed as a
//! small, separately testable piece; the hosted runtime wires them to
//! the real syscall sites.

use std::io::{Read, Write};

use farmem_error::{FarmemError, Result};
use farmem_pager::region::RegionMemory;
use farmem_pager::PagingEngine;
use farmem_transport::PageTransport;
use nix::sys::signal::{SigSet, Signal};
use tracing::{debug, trace, warn};

/// Consecutive successes/failures before the adaptive chunker moves.
pub const MAX_CONSECUTIVE: u32 = 3;

// ---------------------------------------------------------------------------
// Signal-mask filtering
// ---------------------------------------------------------------------------

/// Strip the fault signal from a mask the user is about to install.
///
/// The caller may block anything else; blocking SIGSEGV would make
/// paging (and freezing) impossible.
pub fn strip_fault_signal(set: &SigSet) -> SigSet {
    let mut filtered = SigSet::empty();
    for signal in Signal::iterator() {
        if signal != Signal::SIGSEGV && set.contains(signal) {
            filtered.add(signal);
        }
    }
    filtered
}

/// Records a user's attempt to take over the fault signal without
/// applying it. The core's handler must stay installed; the recorded
/// action is what a later query observes.
#[derive(Debug, Default)]
pub struct FaultSignalLedger {
    recorded: parking_lot::Mutex<Vec<String>>,
}

impl FaultSignalLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (and refuse) a user installation for the fault signal.
    pub fn record(&self, description: impl Into<String>) {
        let description = description.into();
        debug!(handler = %description, "recorded user fault-signal handler without applying it");
        self.recorded.lock().push(description);
    }

    /// The most recently recorded handler, as a later query would see.
    #[must_use]
    pub fn last_recorded(&self) -> Option<String> {
        self.recorded.lock().last().cloned()
    }
}

// ---------------------------------------------------------------------------
// Synthesized meminfo
// ---------------------------------------------------------------------------

/// Rewrite meminfo-format text so the pooled extent appears as this
/// node's total memory. `MemFree` shrinks by however much of the real
/// total was already in use.
pub fn synthesize_meminfo(real: &str, extent: usize) -> String {
    let mut total_kb: Option<usize> = None;
    let mut out = String::with_capacity(real.len());
    for line in real.lines() {
        if let Some(kb) = crate::sysinfo::parse_meminfo(&format!("{line}\n"), "MemTotal:") {
            total_kb = Some(kb / 1024);
            out.push_str(&format!("MemTotal:     {:8} kB\n", extent / 1024));
        } else if let Some(free) =
            crate::sysinfo::parse_meminfo(&format!("{line}\n"), "MemFree:")
        {
            let free_kb = free / 1024;
            let used_kb = total_kb.unwrap_or(0).saturating_sub(free_kb);
            out.push_str(&format!(
                "MemFree:      {:8} kB\n",
                (extent / 1024).saturating_sub(used_kb)
            ));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Guarded mapping placement
// ---------------------------------------------------------------------------

/// Hints for a user mapping that must avoid the managed region:
/// preferably below it (just past the data segment), otherwise just
/// past its end.
#[must_use]
pub fn mmap_hints(data_end: usize, region_base: usize, region_extent: usize, len: usize) -> (Option<usize>, usize) {
    let below = if data_end.checked_add(len).is_some_and(|end| end <= region_base) {
        Some(data_end)
    } else {
        None
    };
    (below, region_base + region_extent)
}

/// Check a mapping the kernel actually gave us against the region.
pub fn check_mapping_outside(
    addr: usize,
    len: usize,
    region_base: usize,
    region_extent: usize,
) -> Result<()> {
    let overlaps = addr < region_base + region_extent && addr + len > region_base;
    if overlaps {
        return Err(FarmemError::internal(format!(
            "mapping at {addr:#x} (+{len:#x}) landed inside the managed region"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Adaptive chunked I/O
// ---------------------------------------------------------------------------

/// Binary-search state for the transfer chunk size.
///
/// Starts at one OS page and searches between the largest size known
/// to work and the smallest known to fail: it doubles its confidence
/// after [`MAX_CONSECUTIVE`] successes, halves after the same number of
/// failures, resets the search when a formerly good size fails, and
/// gives up below one OS page.
#[derive(Debug)]
pub struct AdaptiveChunker {
    os_page: usize,
    successful: usize,
    unsuccessful: usize,
    max_successful: usize,
    consecutive_ok: u32,
    consecutive_fail: u32,
    last_chunk: usize,
    gave_up: bool,
}

impl AdaptiveChunker {
    /// `cache_bytes` bounds the search from above: a transfer larger
    /// than twice the local cache cannot be pre-faulted anyway.
    #[must_use]
    pub fn new(os_page: usize, cache_bytes: usize) -> Self {
        let successful = os_page;
        Self {
            os_page,
            successful,
            unsuccessful: (2 * cache_bytes).saturating_sub(successful).max(os_page),
            max_successful: successful,
            consecutive_ok: 0,
            consecutive_fail: 0,
            last_chunk: 0,
            gave_up: false,
        }
    }

    /// The chunk size to try next, capped at `remaining`.
    #[must_use]
    pub fn next_chunk(&mut self, remaining: usize) -> usize {
        let mid = (self.successful + self.unsuccessful) / 2;
        self.last_chunk = mid.min(remaining);
        self.last_chunk
    }

    /// True once the chunker has concluded no size works.
    #[must_use]
    pub fn gave_up(&self) -> bool {
        self.gave_up
    }

    pub fn record_success(&mut self) {
        self.consecutive_fail = 0;
        self.consecutive_ok += 1;
        self.max_successful = self.max_successful.max(self.last_chunk);
        if self.consecutive_ok == MAX_CONSECUTIVE {
            self.successful = self.last_chunk;
            self.consecutive_ok = 0;
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_ok = 0;
        self.consecutive_fail += 1;
        if self.consecutive_fail == MAX_CONSECUTIVE {
            self.unsuccessful = self.last_chunk;
            self.consecutive_fail = 0;
            if self.unsuccessful <= self.os_page {
                self.gave_up = true;
            } else if self.unsuccessful <= self.successful {
                // What used to work no longer does: restart the search
                // from the bottom and hope conditions improved.
                trace!("formerly good chunk size failed; resetting the search");
                self.successful = self.os_page;
                self.unsuccessful =
                    (2 * self.max_successful).saturating_sub(self.successful).max(self.os_page);
            }
        }
    }
}

/// Read up to `len` bytes from `src` into the managed region at
/// `offset`, one pre-touched chunk at a time. Returns the bytes read.
pub fn chunked_read_into_region<T, M>(
    engine: &mut PagingEngine<T, M>,
    offset: usize,
    len: usize,
    src: &mut impl Read,
    os_page: usize,
) -> Result<usize>
where
    T: PageTransport,
    M: RegionMemory,
{
    if offset.checked_add(len).map_or(true, |end| end > engine.layout().extent()) {
        return Err(FarmemError::internal("chunked read outside the managed region"));
    }
    let cache_bytes = engine.local_pages() * engine.layout().page_size();
    let mut chunker = AdaptiveChunker::new(os_page, cache_bytes);
    let mut scratch = Vec::new();
    let mut done = 0;

    while done < len && !chunker.gave_up() {
        let chunk = chunker.next_chunk(len - done);
        // Pre-fault the destination for writing, so the copy below
        // cannot trap midway through and the pages' modified state
        // reflects the incoming data.
        write_touch_range(engine, offset + done, chunk)?;

        scratch.resize(chunk, 0);
        match src.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => {
                copy_into_region(engine, offset + done, &scratch[..n])?;
                done += n;
                chunker.record_success();
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                chunker.record_failure();
            }
            Err(err) => {
                warn!(%err, "chunked read failed");
                chunker.record_failure();
            }
        }
    }
    Ok(done)
}

/// Write `len` bytes from the region at `offset` into `dst`, one
/// pre-touched chunk at a time. Returns the bytes written.
pub fn chunked_write_from_region<T, M>(
    engine: &mut PagingEngine<T, M>,
    offset: usize,
    len: usize,
    dst: &mut impl Write,
    os_page: usize,
) -> Result<usize>
where
    T: PageTransport,
    M: RegionMemory,
{
    if offset.checked_add(len).map_or(true, |end| end > engine.layout().extent()) {
        return Err(FarmemError::internal("chunked write outside the managed region"));
    }
    let cache_bytes = engine.local_pages() * engine.layout().page_size();
    let mut chunker = AdaptiveChunker::new(os_page, cache_bytes);
    let mut scratch = Vec::new();
    let mut done = 0;

    while done < len && !chunker.gave_up() {
        let chunk = chunker.next_chunk(len - done);
        engine.touch_range(offset + done, chunk)?;

        scratch.clear();
        copy_from_region(engine, offset + done, chunk, &mut scratch)?;
        match dst.write(&scratch) {
            Ok(0) => break,
            Ok(n) => {
                done += n;
                chunker.record_success();
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                chunker.record_failure();
            }
            Err(err) => {
                warn!(%err, "chunked write failed");
                chunker.record_failure();
            }
        }
    }
    Ok(done)
}

/// Pre-touch the page under an ioctl pointer argument so the kernel
/// does not fault on it mid-call.
pub fn pretouch_ioctl_arg<T, M>(engine: &mut PagingEngine<T, M>, offset: usize) -> Result<()>
where
    T: PageTransport,
    M: RegionMemory,
{
    engine.touch_range(offset, engine.layout().page_size())
}

/// Fault a byte range in with write access, page by page.
fn write_touch_range<T, M>(
    engine: &mut PagingEngine<T, M>,
    offset: usize,
    len: usize,
) -> Result<()>
where
    T: PageTransport,
    M: RegionMemory,
{
    if len == 0 {
        return Ok(());
    }
    let first = engine.layout().page_of(offset).get();
    let last = engine.layout().page_of(offset + len - 1).get();
    for n in (first..=last).rev() {
        let page = farmem_types::PageIndex::new(n);
        while !engine
            .region()
            .accessible(page, farmem_types::AccessKind::Write)
        {
            engine.service_fault(
                engine.layout().page_start(page),
                farmem_types::AccessKind::Write,
            )?;
        }
    }
    Ok(())
}

/// Scatter bytes into the region across page boundaries, faulting each
/// page back in if the walk ahead of us evicted it — exactly what a
/// userspace copy restarted by the fault handler would do.
fn copy_into_region<T, M>(
    engine: &mut PagingEngine<T, M>,
    offset: usize,
    data: &[u8],
) -> Result<()>
where
    T: PageTransport,
    M: RegionMemory,
{
    let page_size = engine.layout().page_size();
    let mut pos = 0;
    while pos < data.len() {
        let at = offset + pos;
        let page = engine.layout().page_of(at);
        while !engine.region().accessible(page, farmem_types::AccessKind::Write) {
            engine.service_fault(at, farmem_types::AccessKind::Write)?;
        }
        let within = at % page_size;
        let take = (page_size - within).min(data.len() - pos);
        engine.region_mut().page_mut(page)[within..within + take]
            .copy_from_slice(&data[pos..pos + take]);
        pos += take;
    }
    Ok(())
}

/// Gather bytes from the region across page boundaries, faulting pages
/// back in as needed.
fn copy_from_region<T, M>(
    engine: &mut PagingEngine<T, M>,
    offset: usize,
    len: usize,
    out: &mut Vec<u8>,
) -> Result<()>
where
    T: PageTransport,
    M: RegionMemory,
{
    let page_size = engine.layout().page_size();
    let mut pos = 0;
    while pos < len {
        let at = offset + pos;
        let page = engine.layout().page_of(at);
        while !engine.region().accessible(page, farmem_types::AccessKind::Read) {
            engine.service_fault(at, farmem_types::AccessKind::Read)?;
        }
        let within = at % page_size;
        let take = (page_size - within).min(len - pos);
        out.extend_from_slice(&engine.region().page(page)[within..within + take]);
        pos += take;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Thread creation
// ---------------------------------------------------------------------------

/// Default stack size for user threads when the system limit is
/// unbounded or unreadable.
const DEFAULT_STACK_BYTES: usize = 2 * 1024 * 1024;

/// Stack size to give every user thread.
///
/// User threads always get an explicitly sized stack: stacks of
/// unknowable extent mean unrelated deallocation can reach into
/// address space the core accounts for.
#[must_use]
pub fn user_thread_stack_size() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: limit points to a properly sized rlimit struct.
    if unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) } != 0 {
        return DEFAULT_STACK_BYTES;
    }
    if limit.rlim_cur == 0 || limit.rlim_cur == libc::RLIM_INFINITY {
        DEFAULT_STACK_BYTES
    } else {
        limit.rlim_cur as usize
    }
}

/// Spawn a user thread: fixed-size stack, fault signal unblocked, and
/// registered with the freeze protocol before the user's closure runs.
pub fn spawn_user_thread<F, R>(
    sync: std::sync::Arc<crate::threads::CoreSync>,
    name: String,
    f: F,
) -> std::io::Result<std::thread::JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .stack_size(user_thread_stack_size())
        .spawn(move || {
            // Registration takes the global lock so a concurrent freeze
            // wave cannot miss this thread while its memory view is
            // still settling.
            sync.with(|| {
                let _ = crate::signal::unblock_fault_signal();
                sync.current_record(false)
            });
            f()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_signal_is_stripped_from_masks() {
        let mut set = SigSet::empty();
        set.add(Signal::SIGSEGV);
        set.add(Signal::SIGUSR1);
        set.add(Signal::SIGTERM);
        let filtered = strip_fault_signal(&set);
        assert!(!filtered.contains(Signal::SIGSEGV));
        assert!(filtered.contains(Signal::SIGUSR1));
        assert!(filtered.contains(Signal::SIGTERM));
    }

    #[test]
    fn ledger_records_without_applying() {
        let ledger = FaultSignalLedger::new();
        assert_eq!(ledger.last_recorded(), None);
        ledger.record("user handler A");
        ledger.record("user handler B");
        assert_eq!(ledger.last_recorded().as_deref(), Some("user handler B"));
    }

    #[test]
    fn meminfo_advertises_the_extent() {
        let real = "MemTotal:       16384 kB\n\
                    MemFree:         4096 kB\n\
                    Buffers:          100 kB\n";
        let extent = 64 * 1024 * 1024; // 64 MiB = 65536 kB
        let fake = synthesize_meminfo(real, extent);
        assert!(fake.contains("MemTotal:        65536 kB"), "{fake}");
        // 16384 - 4096 = 12288 kB already in use; 65536 - 12288 = 53248.
        assert!(fake.contains("MemFree:         53248 kB"), "{fake}");
        assert!(fake.contains("Buffers:          100 kB"));
    }

    #[test]
    fn mapping_hints_avoid_the_region() {
        let (below, above) = mmap_hints(0x10000, 0x40000, 0x10000, 0x8000);
        assert_eq!(below, Some(0x10000));
        assert_eq!(above, 0x50000);

        // No room below: only the above hint remains.
        let (below, above) = mmap_hints(0x3c000, 0x40000, 0x10000, 0x8000);
        assert_eq!(below, None);
        assert_eq!(above, 0x50000);
    }

    #[test]
    fn overlapping_mappings_are_rejected() {
        assert!(check_mapping_outside(0x1000, 0x1000, 0x40000, 0x10000).is_ok());
        assert!(check_mapping_outside(0x50000, 0x1000, 0x40000, 0x10000).is_ok());
        assert!(check_mapping_outside(0x3f000, 0x2000, 0x40000, 0x10000).is_err());
        assert!(check_mapping_outside(0x48000, 0x1000, 0x40000, 0x10000).is_err());
    }

    #[test]
    fn chunker_grows_after_consecutive_successes() {
        let mut c = AdaptiveChunker::new(4096, 1 << 20);
        let first = c.next_chunk(usize::MAX);
        for _ in 0..MAX_CONSECUTIVE {
            c.next_chunk(usize::MAX);
            c.record_success();
        }
        let later = c.next_chunk(usize::MAX);
        assert!(later > first, "{later} should exceed {first}");
    }

    #[test]
    fn chunker_shrinks_after_consecutive_failures() {
        let mut c = AdaptiveChunker::new(4096, 1 << 20);
        let first = c.next_chunk(usize::MAX);
        for _ in 0..MAX_CONSECUTIVE {
            c.next_chunk(usize::MAX);
            c.record_failure();
        }
        let later = c.next_chunk(usize::MAX);
        assert!(later < first, "{later} should be below {first}");
        assert!(!c.gave_up());
    }

    #[test]
    fn chunker_gives_up_below_one_page() {
        let mut c = AdaptiveChunker::new(4096, 8192);
        for _ in 0..64 {
            if c.gave_up() {
                break;
            }
            c.next_chunk(usize::MAX);
            c.record_failure();
        }
        assert!(c.gave_up());
    }

    #[test]
    fn chunker_resets_when_a_good_size_fails() {
        let mut c = AdaptiveChunker::new(4096, 1 << 20);
        // Establish a large known-good size.
        for _ in 0..MAX_CONSECUTIVE {
            c.next_chunk(usize::MAX);
            c.record_success();
        }
        let good = c.successful;
        assert!(good > 4096);
        // Now everything fails down past the known-good point; the
        // search must restart from one page rather than wedge, and
        // with nothing ever working again it eventually gives up.
        for _ in 0..200 {
            if c.gave_up() {
                break;
            }
            c.next_chunk(usize::MAX);
            c.record_failure();
        }
        assert!(c.successful == 4096 || c.gave_up());
    }

    #[test]
    fn chunks_never_exceed_remaining() {
        let mut c = AdaptiveChunker::new(4096, 1 << 20);
        assert_eq!(c.next_chunk(100), 100);
    }

    #[test]
    fn stack_size_is_reasonable() {
        let size = user_thread_stack_size();
        assert!(size >= 64 * 1024);
    }
}
