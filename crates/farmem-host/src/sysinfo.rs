//! System-information probes.
//!
//! Everything here answers one question: how much memory can this node
//! actually afford to promise? The answers come from the kernel's
//! meminfo file, the per-process mapping limit, and resource usage;
//! each probe has a parse-only core so tests can feed it captured file
//! contents.

use std::path::Path;

use farmem_error::{FarmemError, Result};
use farmem_types::AmountSpec;
use tracing::debug;

const MEMINFO_FILE: &str = "/proc/meminfo";
const MAPCOUNT_FILE: &str = "/proc/sys/vm/max_map_count";

/// OS page size in bytes.
pub fn os_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Extract `key` values (kB-scaled to bytes) from meminfo-format text.
pub fn parse_meminfo(content: &str, key: &str) -> Option<usize> {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            let rest = rest.trim_start();
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            let kb: usize = digits.parse().ok()?;
            if rest[digits.len()..].trim_start().starts_with("kB") {
                return Some(kb * 1024);
            }
            return None;
        }
    }
    None
}

/// Reduce a byte amount by the configured reserve.
pub fn apply_reserve(bytes: usize, reserve: Option<AmountSpec>) -> Result<usize> {
    let Some(reserve) = reserve else {
        return Ok(bytes);
    };
    let skim = reserve.resolve(bytes);
    if skim > bytes {
        return Err(FarmemError::Config {
            key: "FM_RESERVEMEM".into(),
            value: format!("{skim}"),
            reason: "reserve exceeds the available memory",
        });
    }
    debug!(bytes, skim, "reserving memory off the available-RAM query");
    Ok(bytes - skim)
}

/// Free+buffer+cached memory from meminfo text, if all three parse.
pub fn available_from_meminfo(content: &str) -> Option<usize> {
    let free = parse_meminfo(content, "MemFree:")?;
    let buffers = parse_meminfo(content, "Buffers:")?;
    let cached = parse_meminfo(content, "Cached:")?;
    Some(free + buffers + cached)
}

/// The amount of physical memory this process can reasonably use.
///
/// First choice is the kernel meminfo file (free + buffers + cached);
/// the fallback is the available-pages sysconf query. Failing both is a
/// fatal environment error naming the knobs to set instead.
pub fn available_memory(reserve: Option<AmountSpec>) -> Result<usize> {
    if let Ok(content) = std::fs::read_to_string(MEMINFO_FILE) {
        if let Some(bytes) = available_from_meminfo(&content) {
            return apply_reserve(bytes, reserve);
        }
    }
    // SAFETY: sysconf has no memory-safety preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
    if pages > 0 {
        return apply_reserve(pages as usize * os_page_size(), reserve);
    }
    Err(FarmemError::NoPhysicalMemory)
}

/// Maximum number of mappings a process may hold, or `None` if the
/// kernel does not say.
pub fn max_map_count() -> Option<usize> {
    max_map_count_from(Path::new(MAPCOUNT_FILE))
}

fn max_map_count_from(path: &Path) -> Option<usize> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

/// The smallest logical page size that cannot exhaust the kernel's
/// mapping budget.
///
/// The worst resident pattern is alternating mapped and unmapped
/// logical pages, needing one mapping per resident page. Sizing pages
/// at `available / max_maps`, rounded up to the OS page, caps the
/// mapping count below the limit even then.
pub fn min_safe_page_size(available: usize, max_maps: usize, os_page: usize) -> usize {
    if max_maps == 0 {
        return os_page;
    }
    let raw = available.div_ceil(max_maps);
    let rounded = raw.div_ceil(os_page) * os_page;
    rounded.max(os_page)
}

/// Run state of a thread, read from its stat file: `R` running, `S`
/// sleeping, `D` uninterruptible, `Z` zombie, `T` stopped. `?` when the
/// state cannot be determined.
pub fn thread_state(tid: i32) -> char {
    let path = format!("/proc/{tid}/stat");
    match std::fs::read_to_string(path) {
        Ok(content) => parse_thread_state(&content),
        Err(_) => '?',
    }
}

/// The state field follows the parenthesized command name; search
/// backwards for the final `)` since the name itself may contain one.
pub fn parse_thread_state(stat: &str) -> char {
    let Some(close) = stat.rfind(')') else {
        return '?';
    };
    stat[close + 1..]
        .chars()
        .find(|c| !c.is_whitespace())
        .unwrap_or('?')
}

/// True when a thread in this state will not touch user memory until
/// scheduled again.
pub fn state_is_parked(state: char) -> bool {
    matches!(state, 'D' | 'Z' | 'T')
}

/// Cumulative major page faults of this process.
pub fn major_faults() -> u64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: usage points to a properly sized rusage struct.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc == 0 {
        usage.ru_majflt.max(0) as u64
    } else {
        0
    }
}

/// [`farmem_transport::FaultProbe`] backed by resource usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct RusageProbe;

impl farmem_transport::FaultProbe for RusageProbe {
    fn major_faults(&self) -> u64 {
        major_faults()
    }
}
