//! The fatal-abort path.
//!
//! An invariant violation inside a user-space pager leaves nothing to
//! recover: the abort prints one diagnostic line, gives each subsystem
//! a best-effort chance to shut down, and exits nonzero. Re-entering
//! the abort (a finalizer faulting, for instance) escalates through
//! progressively harsher exits until the process is unquestionably
//! gone.

use std::sync::atomic::{AtomicU32, Ordering};

use farmem_error::FarmemError;

static ABORT_DEPTH: AtomicU32 = AtomicU32::new(0);

/// How far along the escalation ladder an abort attempt is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortStage {
    /// First entry: diagnose, finalize, exit.
    Diagnose,
    /// Second entry: finalize silently, exit.
    SilentFinalize,
    /// Third entry: plain exit.
    BareExit,
    /// Fourth entry: self-deliver SIGTERM.
    Terminate,
    /// Beyond: SIGKILL.
    Kill,
}

/// Classify the current abort entry. Each call advances the ladder.
pub fn next_stage() -> AbortStage {
    match ABORT_DEPTH.fetch_add(1, Ordering::AcqRel) {
        0 => AbortStage::Diagnose,
        1 => AbortStage::SilentFinalize,
        2 => AbortStage::BareExit,
        3 => AbortStage::Terminate,
        _ => AbortStage::Kill,
    }
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    ABORT_DEPTH.store(0, Ordering::Release);
}

/// Abort the process over a fatal error. `finalize` is the best-effort
/// shutdown of the subsystems (handler, policy, allocator, transport);
/// it runs on the first two entries only.
pub fn fatal(err: &FarmemError, finalize: impl FnOnce()) -> ! {
    match next_stage() {
        AbortStage::Diagnose => {
            eprintln!("farmem: {err}");
            finalize();
            std::process::exit(1);
        }
        AbortStage::SilentFinalize => {
            finalize();
            std::process::exit(1);
        }
        AbortStage::BareExit => std::process::exit(1),
        AbortStage::Terminate => {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::this(),
                nix::sys::signal::Signal::SIGTERM,
            );
            std::process::exit(1);
        }
        AbortStage::Kill => {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::this(),
                nix::sys::signal::Signal::SIGKILL,
            );
            // SIGKILL cannot be outrun; satisfy the never type anyway.
            loop {
                std::thread::yield_now();
            }
        }
    }
}
