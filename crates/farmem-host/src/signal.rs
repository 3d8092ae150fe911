//! Access-violation handler installation.
//!
//! The handler is registered for SIGSEGV with `SA_SIGINFO` (we need the
//! faulting address), `SA_RESTART` (interrupted syscalls resume), and
//! `SA_NODEFER` (the freeze protocol delivers SIGSEGV to threads that
//! may already be inside the handler). The trampoline forwards the
//! fault to a process-global hook; faults the hook disowns reinstate
//! the previously registered disposition and return, so the kernel
//! re-raises them at the original handler.
//!
//! A signal handler is the one place a process-global is unavoidable;
//! it is the only one in this workspace.

use std::sync::OnceLock;

use farmem_error::{FarmemError, Result};
use farmem_types::AccessKind;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

/// What the hook decided about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Serviced; the faulting instruction may resume.
    Handled,
    /// Not inside the managed region; re-raise to the previous handler.
    NotOurs,
}

type FaultHook = Box<dyn Fn(usize, AccessKind) -> FaultDisposition + Send + Sync>;

struct HandlerState {
    hook: FaultHook,
    previous: SigAction,
}

static HANDLER: OnceLock<HandlerState> = OnceLock::new();

/// Decode read-vs-write from the fault context where the architecture
/// exposes it; elsewhere assume a write, which grants the broader
/// access and can never livelock a restarted instruction.
#[cfg(target_arch = "x86_64")]
fn access_kind(ctx: *mut libc::c_void) -> AccessKind {
    const PF_WRITE: i64 = 1 << 1;
    if ctx.is_null() {
        return AccessKind::Write;
    }
    // SAFETY: the kernel hands the handler a valid ucontext_t.
    let err = unsafe {
        (*ctx.cast::<libc::ucontext_t>()).uc_mcontext.gregs[libc::REG_ERR as usize]
    };
    if err & PF_WRITE != 0 {
        AccessKind::Write
    } else {
        AccessKind::Read
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn access_kind(_ctx: *mut libc::c_void) -> AccessKind {
    AccessKind::Write
}

extern "C" fn trampoline(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let addr = if info.is_null() {
        0
    } else {
        // SAFETY: for SIGSEGV the kernel fills si_addr.
        unsafe { (*info).si_addr() as usize }
    };
    let Some(state) = HANDLER.get() else {
        return;
    };
    match (state.hook)(addr, access_kind(ctx)) {
        FaultDisposition::Handled => {}
        FaultDisposition::NotOurs => {
            // Put the original disposition back and return; the
            // instruction re-faults straight into it.
            // SAFETY: restoring a SigAction previously returned by
            // sigaction for this signal.
            let _ = unsafe { signal::sigaction(Signal::SIGSEGV, &state.previous) };
        }
    }
}

/// Install the fault handler. May be called once per process.
pub fn install(hook: FaultHook) -> Result<()> {
    let action = SigAction::new(
        SigHandler::SigAction(trampoline),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART | SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    // SAFETY: trampoline only reads the siginfo/ucontext the kernel
    // provides and state published before installation.
    let previous = unsafe { signal::sigaction(Signal::SIGSEGV, &action) }.map_err(|err| {
        FarmemError::SignalInstall {
            detail: err.to_string(),
        }
    })?;
    HANDLER
        .set(HandlerState {
            hook,
            previous,
        })
        .map_err(|_| FarmemError::SignalInstall {
            detail: "fault handler already installed".into(),
        })?;
    debug!("access-violation handler installed");
    Ok(())
}

/// Restore the handler that was active before [`install`].
pub fn restore_previous() -> Result<()> {
    let Some(state) = HANDLER.get() else {
        return Ok(());
    };
    // SAFETY: restoring a previously captured disposition.
    unsafe { signal::sigaction(Signal::SIGSEGV, &state.previous) }.map_err(|err| {
        FarmemError::SignalInstall {
            detail: err.to_string(),
        }
    })?;
    Ok(())
}

/// Unblock SIGSEGV for the calling thread.
///
/// Some runtimes spawn threads with broad signal masks; a thread that
/// cannot receive the access-violation signal can neither fault pages
/// in nor be frozen. Every user thread runs this at startup.
pub fn unblock_fault_signal() -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGSEGV);
    set.thread_unblock().map_err(|err| FarmemError::SignalInstall {
        detail: format!("failed to unblock the fault signal: {err}"),
    })
}
