//! Engine configuration, read from `FM_*` environment variables at
//! startup.
//!
//! Parsing is strict: a variable that is present but malformed is a
//! hard error rather than a silent default, since a typo in a memory
//! budget can otherwise waste a whole run.

use std::fmt;

use farmem_error::{FarmemError, Result};

use crate::PageDistribution;

/// Which replacement policy drives eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PolicyKind {
    Fifo,
    Random,
    /// Not-recently-evicted.
    Nre,
    /// Not-recently-used.
    Nru,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fifo => "fifo",
            Self::Random => "random",
            Self::Nre => "nre",
            Self::Nru => "nru",
        };
        f.write_str(s)
    }
}

/// How to pick the next page to prefetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PrefetchKind {
    /// Don't prefetch any pages.
    None,
    /// Always prefetch the next page.
    Next,
    /// Prefetch at the same page distance as previously.
    Delta,
}

/// `FM_PAGESIZE`: an explicit byte count or `auto` (use the minimum
/// safe size derived from the kernel map-count limit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSizeSpec {
    Auto,
    Bytes(usize),
}

/// `FM_BASEADDR`: where to place the managed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseAddr {
    /// Place the region exactly here; failure is fatal.
    Absolute(usize),
    /// Signed offset from the default placement (end of the data
    /// segment rounded up); failure is fatal.
    Delta(i64),
}

/// A byte amount or a percentage of some base quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AmountSpec {
    Bytes(usize),
    Percent(f64),
}

impl AmountSpec {
    /// Resolve against a base amount.
    #[must_use]
    pub fn resolve(self, base: usize) -> usize {
        match self {
            Self::Bytes(n) => n,
            #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            Self::Percent(p) => (base as f64 * p / 100.0) as usize,
        }
    }
}

/// A count or a percentage of some base count (`FM_LOCAL_PAGES`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CountSpec {
    Count(usize),
    Percent(f64),
}

impl CountSpec {
    #[must_use]
    pub fn resolve(self, base: usize) -> usize {
        match self {
            Self::Count(n) => n,
            #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            Self::Percent(p) => (base as f64 * p / 100.0) as usize,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Logical page size (`FM_PAGESIZE`).
    pub page_size: PageSizeSpec,
    /// Preferred region placement (`FM_BASEADDR`).
    pub base_addr: Option<BaseAddr>,
    /// Per-peer buffer byte budget override (`FM_SLAVEMEM`).
    pub peer_mem: Option<usize>,
    /// Master usable-RAM override for cache sizing (`FM_MASTERMEM`).
    pub master_mem: Option<usize>,
    /// Locally cached page count, or percent of the maximum
    /// (`FM_LOCAL_PAGES`). When set, policies must not shrink it.
    pub local_pages: Option<CountSpec>,
    /// Bytes or percent skimmed off every available-RAM query
    /// (`FM_RESERVEMEM`).
    pub reserve_mem: Option<AmountSpec>,
    /// Empirical cache/buffer reduction by counting major faults
    /// (`FM_REDUCEMEM`).
    pub reduce_mem: bool,
    /// Prefetch technique (`FM_PREFETCH`).
    pub prefetch: PrefetchKind,
    /// Asynchronous eviction (`FM_ASYNCEVICT`).
    pub async_evict: bool,
    /// Stage fetches/evicts through copy buffers instead of using the
    /// region directly (`FM_MEMCPY`).
    pub extra_memcpy: bool,
    /// NRE eviction-history length (`FM_NRE_ENTRIES`).
    pub nre_entries: usize,
    /// NRE bad-selection retry budget (`FM_NRE_RETRIES`).
    pub nre_retries: usize,
    /// NRU reference-bit clear interval in ms (`FM_NRU_INTERVAL`).
    pub nru_interval_ms: u64,
    /// NRU: admit new pages read+write, losing the modified-bit
    /// distinction (`FM_NRU_RW`).
    pub nru_readwrite: bool,
    /// Request RAM-locking of peer buffers (`FM_MLOCK`).
    pub mlock: bool,
    /// Verbosity 0-5 (`FM_DEBUG`).
    pub debug_level: u8,
    /// Periodic status interval in seconds (`FM_HEARTBEAT`).
    pub heartbeat_secs: Option<u64>,
    /// Replacement policy (`FM_POLICY`).
    pub policy: PolicyKind,
    /// Page distribution among peers (`FM_DIST`).
    pub distribution: PageDistribution,
    /// Byte-swap wire offsets to canonical order (`FM_HETEROGENEOUS`).
    pub heterogeneous: bool,
    /// Rank hint exported by the launch wrapper (`FM_EXPECTED_RANK`).
    /// Used only to keep non-zero ranks quiet during early logging.
    pub expected_rank: Option<u32>,
    /// Total ranks in the deployment, master included (`FM_RANKS`).
    /// Deployments whose fabric knows its own world size ignore this.
    pub ranks: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: PageSizeSpec::Auto,
            base_addr: None,
            peer_mem: None,
            master_mem: None,
            local_pages: None,
            reserve_mem: None,
            reduce_mem: false,
            prefetch: PrefetchKind::None,
            async_evict: false,
            extra_memcpy: false,
            nre_entries: 32,
            nre_retries: 5,
            nru_interval_ms: 5000,
            nru_readwrite: true,
            mlock: false,
            debug_level: 0,
            heartbeat_secs: None,
            policy: PolicyKind::Nru,
            distribution: PageDistribution::RoundRobin,
            heterogeneous: false,
            expected_rank: None,
            ranks: None,
        }
    }
}

impl EngineConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(raw) = lookup("FM_PAGESIZE") {
            cfg.page_size = if raw == "auto" {
                PageSizeSpec::Auto
            } else {
                PageSizeSpec::Bytes(parse_positive("FM_PAGESIZE", &raw)?)
            };
        }
        if let Some(raw) = lookup("FM_BASEADDR") {
            cfg.base_addr = Some(parse_base_addr(&raw)?);
        }
        if let Some(raw) = lookup("FM_SLAVEMEM") {
            cfg.peer_mem = Some(parse_positive("FM_SLAVEMEM", &raw)?);
        }
        if let Some(raw) = lookup("FM_MASTERMEM") {
            cfg.master_mem = Some(parse_positive("FM_MASTERMEM", &raw)?);
        }
        if let Some(raw) = lookup("FM_LOCAL_PAGES") {
            cfg.local_pages = Some(parse_count_spec("FM_LOCAL_PAGES", &raw)?);
        }
        if let Some(raw) = lookup("FM_RESERVEMEM") {
            cfg.reserve_mem = Some(parse_amount_spec("FM_RESERVEMEM", &raw)?);
        }
        if let Some(raw) = lookup("FM_REDUCEMEM") {
            cfg.reduce_mem = parse_boolean("FM_REDUCEMEM", &raw)?;
        }
        if let Some(raw) = lookup("FM_PREFETCH") {
            cfg.prefetch = match raw.as_str() {
                "none" => PrefetchKind::None,
                "next" => PrefetchKind::Next,
                "delta" => PrefetchKind::Delta,
                _ => {
                    return Err(FarmemError::Config {
                        key: "FM_PREFETCH".into(),
                        value: raw,
                        reason: "expected one of none, next, delta",
                    })
                }
            };
        }
        if let Some(raw) = lookup("FM_ASYNCEVICT") {
            cfg.async_evict = parse_boolean("FM_ASYNCEVICT", &raw)?;
        }
        if let Some(raw) = lookup("FM_MEMCPY") {
            cfg.extra_memcpy = parse_boolean("FM_MEMCPY", &raw)?;
        }
        if let Some(raw) = lookup("FM_NRE_ENTRIES") {
            cfg.nre_entries = parse_nonnegative("FM_NRE_ENTRIES", &raw)?;
        }
        if let Some(raw) = lookup("FM_NRE_RETRIES") {
            cfg.nre_retries = parse_nonnegative("FM_NRE_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("FM_NRU_INTERVAL") {
            cfg.nru_interval_ms = parse_positive("FM_NRU_INTERVAL", &raw)? as u64;
        }
        if let Some(raw) = lookup("FM_NRU_RW") {
            cfg.nru_readwrite = parse_boolean("FM_NRU_RW", &raw)?;
        }
        if let Some(raw) = lookup("FM_MLOCK") {
            cfg.mlock = parse_boolean("FM_MLOCK", &raw)?;
        }
        if let Some(raw) = lookup("FM_DEBUG") {
            let level = parse_nonnegative("FM_DEBUG", &raw)?;
            cfg.debug_level = u8::try_from(level.min(5)).unwrap_or(5);
        }
        if let Some(raw) = lookup("FM_HEARTBEAT") {
            cfg.heartbeat_secs = Some(parse_nonnegative("FM_HEARTBEAT", &raw)? as u64);
        }
        if let Some(raw) = lookup("FM_POLICY") {
            cfg.policy = match raw.as_str() {
                "fifo" => PolicyKind::Fifo,
                "random" => PolicyKind::Random,
                "nre" => PolicyKind::Nre,
                "nru" => PolicyKind::Nru,
                _ => {
                    return Err(FarmemError::Config {
                        key: "FM_POLICY".into(),
                        value: raw,
                        reason: "expected one of fifo, random, nre, nru",
                    })
                }
            };
        }
        if let Some(raw) = lookup("FM_DIST") {
            cfg.distribution = match raw.as_str() {
                "rr" => PageDistribution::RoundRobin,
                "block" => PageDistribution::Block,
                _ => {
                    return Err(FarmemError::Config {
                        key: "FM_DIST".into(),
                        value: raw,
                        reason: "expected rr or block",
                    })
                }
            };
        }
        if let Some(raw) = lookup("FM_HETEROGENEOUS") {
            cfg.heterogeneous = parse_boolean("FM_HETEROGENEOUS", &raw)?;
        }
        if let Some(raw) = lookup("FM_EXPECTED_RANK") {
            cfg.expected_rank = raw.parse().ok();
        }
        if let Some(raw) = lookup("FM_RANKS") {
            let n = parse_positive("FM_RANKS", &raw)?;
            cfg.ranks = Some(u32::try_from(n).map_err(|_| {
                config_err("FM_RANKS", &raw, "must be a positive integer")
            })?);
        }

        Ok(cfg)
    }
}

fn config_err(key: &str, value: &str, reason: &'static str) -> FarmemError {
    FarmemError::Config {
        key: key.into(),
        value: value.into(),
        reason,
    }
}

/// Parse a strictly positive integer.
fn parse_positive(key: &str, raw: &str) -> Result<usize> {
    let n: usize = raw
        .trim()
        .parse()
        .map_err(|_| config_err(key, raw, "must be a positive integer"))?;
    if n == 0 {
        return Err(config_err(key, raw, "must be a positive integer"));
    }
    Ok(n)
}

/// Parse a nonnegative integer.
fn parse_nonnegative(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|_| config_err(key, raw, "must be a nonnegative integer"))
}

/// Parse a boolean. Leading `1yYtT` mean true, `0nNfF` mean false, and
/// an empty value means true.
fn parse_boolean(key: &str, raw: &str) -> Result<bool> {
    match raw.chars().next() {
        None => Ok(true),
        Some(c) if "1yYtT".contains(c) => Ok(true),
        Some(c) if "0nNfF".contains(c) => Ok(false),
        Some(_) => Err(config_err(key, raw, "is not a valid boolean value")),
    }
}

/// Parse a nonnegative percentage (trailing `%`).
fn parse_percent(key: &str, raw: &str) -> Result<f64> {
    let digits = raw.trim().trim_end_matches('%');
    let pct: f64 = digits
        .parse()
        .map_err(|_| config_err(key, raw, "unable to parse as a percentage"))?;
    if pct < 0.0 {
        return Err(config_err(key, raw, "must be nonnegative"));
    }
    Ok(pct)
}

fn parse_amount_spec(key: &str, raw: &str) -> Result<AmountSpec> {
    if raw.contains('%') {
        Ok(AmountSpec::Percent(parse_percent(key, raw)?))
    } else {
        Ok(AmountSpec::Bytes(parse_nonnegative(key, raw)?))
    }
}

fn parse_count_spec(key: &str, raw: &str) -> Result<CountSpec> {
    if raw.contains('%') {
        Ok(CountSpec::Percent(parse_percent(key, raw)?))
    } else {
        Ok(CountSpec::Count(parse_positive(key, raw)?))
    }
}

/// Parse `FM_BASEADDR`: `+N`/`-N` are deltas from the default
/// placement, anything else is an absolute address (decimal or `0x`
/// hex).
fn parse_base_addr(raw: &str) -> Result<BaseAddr> {
    let s = raw.trim();
    let parse_uint = |t: &str| -> Option<u64> {
        if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16).ok()
        } else {
            t.parse().ok()
        }
    };
    let err = || config_err("FM_BASEADDR", raw, "requires an integer value");
    if let Some(rest) = s.strip_prefix('+') {
        let n = parse_uint(rest).ok_or_else(err)?;
        Ok(BaseAddr::Delta(i64::try_from(n).map_err(|_| err())?))
    } else if let Some(rest) = s.strip_prefix('-') {
        let n = parse_uint(rest).ok_or_else(err)?;
        Ok(BaseAddr::Delta(-i64::try_from(n).map_err(|_| err())?))
    } else {
        let n = parse_uint(s).ok_or_else(err)?;
        Ok(BaseAddr::Absolute(n as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(vars: &[(&str, &str)]) -> Result<EngineConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        EngineConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let c = cfg(&[]).unwrap();
        assert_eq!(c.page_size, PageSizeSpec::Auto);
        assert_eq!(c.policy, PolicyKind::Nru);
        assert_eq!(c.prefetch, PrefetchKind::None);
        assert_eq!(c.nre_entries, 32);
        assert_eq!(c.nre_retries, 5);
        assert_eq!(c.nru_interval_ms, 5000);
        assert!(c.nru_readwrite);
        assert!(!c.async_evict);
        assert_eq!(c.distribution, PageDistribution::RoundRobin);
    }

    #[test]
    fn page_size_auto_and_bytes() {
        assert_eq!(
            cfg(&[("FM_PAGESIZE", "auto")]).unwrap().page_size,
            PageSizeSpec::Auto
        );
        assert_eq!(
            cfg(&[("FM_PAGESIZE", "262144")]).unwrap().page_size,
            PageSizeSpec::Bytes(262_144)
        );
        assert!(cfg(&[("FM_PAGESIZE", "0")]).is_err());
        assert!(cfg(&[("FM_PAGESIZE", "lots")]).is_err());
    }

    #[test]
    fn booleans_accept_the_classic_characters() {
        for v in ["1", "y", "Y", "t", "T", "yes", "true", ""] {
            assert!(cfg(&[("FM_ASYNCEVICT", v)]).unwrap().async_evict, "{v:?}");
        }
        for v in ["0", "n", "N", "f", "F", "no", "false"] {
            assert!(!cfg(&[("FM_ASYNCEVICT", v)]).unwrap().async_evict, "{v:?}");
        }
        assert!(cfg(&[("FM_ASYNCEVICT", "maybe")]).is_err());
    }

    #[test]
    fn base_addr_forms() {
        assert_eq!(
            cfg(&[("FM_BASEADDR", "0x7f0000000000")]).unwrap().base_addr,
            Some(BaseAddr::Absolute(0x7f00_0000_0000))
        );
        assert_eq!(
            cfg(&[("FM_BASEADDR", "+1048576")]).unwrap().base_addr,
            Some(BaseAddr::Delta(1_048_576))
        );
        assert_eq!(
            cfg(&[("FM_BASEADDR", "-4096")]).unwrap().base_addr,
            Some(BaseAddr::Delta(-4096))
        );
        assert!(cfg(&[("FM_BASEADDR", "over there")]).is_err());
    }

    #[test]
    fn amounts_and_counts_take_percentages() {
        let c = cfg(&[("FM_RESERVEMEM", "25%"), ("FM_LOCAL_PAGES", "50%")]).unwrap();
        assert_eq!(c.reserve_mem.unwrap().resolve(1000), 250);
        assert_eq!(c.local_pages.unwrap().resolve(64), 32);

        let c = cfg(&[("FM_RESERVEMEM", "4096"), ("FM_LOCAL_PAGES", "8")]).unwrap();
        assert_eq!(c.reserve_mem.unwrap().resolve(1_000_000), 4096);
        assert_eq!(c.local_pages.unwrap().resolve(64), 8);

        assert!(cfg(&[("FM_RESERVEMEM", "-5%")]).is_err());
    }

    #[test]
    fn policy_and_prefetch_names() {
        assert_eq!(cfg(&[("FM_POLICY", "fifo")]).unwrap().policy, PolicyKind::Fifo);
        assert_eq!(cfg(&[("FM_POLICY", "nre")]).unwrap().policy, PolicyKind::Nre);
        assert_eq!(
            cfg(&[("FM_PREFETCH", "delta")]).unwrap().prefetch,
            PrefetchKind::Delta
        );
        assert!(cfg(&[("FM_POLICY", "lru")]).is_err());
        assert!(cfg(&[("FM_PREFETCH", "psychic")]).is_err());
    }

    #[test]
    fn debug_level_saturates_at_five() {
        assert_eq!(cfg(&[("FM_DEBUG", "3")]).unwrap().debug_level, 3);
        assert_eq!(cfg(&[("FM_DEBUG", "99")]).unwrap().debug_level, 5);
    }
}
