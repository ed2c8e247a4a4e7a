//! Write capture, factored behind the `DirtyPageSource` capability.
//!
//! Two sources exist. `SigTrapSource` keeps the region read-only and
//! turns the first store to a page into a coherence round: the SIGSEGV
//! handler reports the fault to the pump, spins for the global grant,
//! then arms the x86-64 trap flag so the store re-executes exactly once
//! and SIGTRAP hands the dirty page back for publication. The explicit
//! source keeps the region writable and leaves announcement to
//! `publish`/`write_at`; the round protocol is identical either way.
//!
//! Signal handlers cannot carry a runtime handle, so the trap side
//! lives in one process-global cell of atomics; at most one handle may
//! attach it at a time.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use dsm_proto::DSM_PAGE_SIZE;

use crate::region::Region;
use crate::DsmError;

/// How local writes are detected and announced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    /// Trap plain pointer stores via memory protection (linux/x86_64).
    SignalTrap,
    /// The application announces writes with `publish`/`write_at`.
    Explicit,
}

pub(crate) trait DirtyPageSource: Send {
    fn mode(&self) -> CaptureMode;
    fn attach(&mut self, region: &Region, wake_fd: RawFd) -> Result<(), DsmError>;
    fn detach(&mut self);
}

pub(crate) fn source_for(mode: CaptureMode) -> Result<Box<dyn DirtyPageSource>, DsmError> {
    match mode {
        CaptureMode::Explicit => Ok(Box::new(ExplicitSource)),
        CaptureMode::SignalTrap => {
            #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
            {
                Ok(Box::new(SigTrapSource { attached: false }))
            }
            #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
            {
                Err(DsmError::Fatal(
                    "signal-trap capture requires linux/x86_64; use CaptureMode::Explicit".into(),
                ))
            }
        }
    }
}

/// Nothing to install: the region stays writable and dirty pages are
/// announced by the application.
pub(crate) struct ExplicitSource;

impl DirtyPageSource for ExplicitSource {
    fn mode(&self) -> CaptureMode {
        CaptureMode::Explicit
    }

    fn attach(&mut self, _region: &Region, _wake_fd: RawFd) -> Result<(), DsmError> {
        Ok(())
    }

    fn detach(&mut self) {}
}

/// Capture state machine, shared between the signal handlers (main
/// thread) and the pump. Transitions:
///
///   IDLE -SEGV-> FAULTED -pump-> GRANTED -TRAP-> CAPTURED -pump-> FLUSHED -> IDLE
pub(crate) mod trap {
    use super::*;

    pub const IDLE: u32 = 0;
    pub const FAULTED: u32 = 1;
    pub const GRANTED: u32 = 2;
    pub const CAPTURED: u32 = 3;
    pub const FLUSHED: u32 = 4;

    pub struct TrapCell {
        pub state: AtomicU32,
        pub page: AtomicUsize,
        pub base: AtomicUsize,
        pub len: AtomicUsize,
        pub wake_fd: AtomicI32,
        pub claimed: AtomicBool,
    }

    pub static CELL: TrapCell = TrapCell {
        state: AtomicU32::new(IDLE),
        page: AtomicUsize::new(0),
        base: AtomicUsize::new(0),
        len: AtomicUsize::new(0),
        wake_fd: AtomicI32::new(-1),
        claimed: AtomicBool::new(false),
    };

    /// True while the main thread is between a fault and its round end.
    pub fn round_in_progress() -> bool {
        CELL.state.load(Acquire) != IDLE
    }

    /// Poke the pump from a signal handler. write(2) is async-signal-safe.
    pub(super) fn wake() {
        let fd = CELL.wake_fd.load(Relaxed);
        let byte = [1u8];
        unsafe { libc::write(fd, byte.as_ptr() as *const _, 1) };
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub(crate) struct SigTrapSource {
    attached: bool,
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl DirtyPageSource for SigTrapSource {
    fn mode(&self) -> CaptureMode {
        CaptureMode::SignalTrap
    }

    fn attach(&mut self, region: &Region, wake_fd: RawFd) -> Result<(), DsmError> {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

        if trap::CELL.claimed.swap(true, Acquire) {
            return Err(DsmError::State(
                "trap capture is already active in this process",
            ));
        }
        trap::CELL.base.store(region.base_addr(), Release);
        trap::CELL.len.store(region.len(), Release);
        trap::CELL.wake_fd.store(wake_fd, Release);
        trap::CELL.state.store(trap::IDLE, Release);

        let segv = SigAction::new(
            SigHandler::SigAction(on_segv),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );
        let step = SigAction::new(
            SigHandler::SigAction(on_trap),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );
        unsafe {
            sigaction(Signal::SIGSEGV, &segv)?;
            sigaction(Signal::SIGTRAP, &step)?;
        }
        self.attached = true;
        Ok(())
    }

    fn detach(&mut self) {
        use nix::sys::signal::{sigaction, SigAction, SigHandler, SaFlags, SigSet, Signal};

        if !self.attached {
            return;
        }
        let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe {
            let _ = sigaction(Signal::SIGSEGV, &dfl);
            let _ = sigaction(Signal::SIGTRAP, &dfl);
        }
        trap::CELL.base.store(0, Release);
        trap::CELL.len.store(0, Release);
        trap::CELL.wake_fd.store(-1, Release);
        trap::CELL.claimed.store(false, Release);
        self.attached = false;
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl Drop for SigTrapSource {
    fn drop(&mut self) {
        self.detach();
    }
}

/// First store to a protected page. Everything here is async-signal-
/// safe: atomics, write(2), and a busy wait for the pump-run round.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
extern "C" fn on_segv(_sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    use trap::*;

    let addr = unsafe { (*info).si_addr() } as usize;
    let base = CELL.base.load(Acquire);
    let len = CELL.len.load(Acquire);
    if addr < base || addr >= base + len {
        // Not a shared-region fault: put the default disposition back
        // and let the re-execution crash the process loudly.
        unsafe { libc::signal(libc::SIGSEGV, libc::SIG_DFL) };
        return;
    }

    CELL.page.store((addr - base) / DSM_PAGE_SIZE, Release);
    CELL.state.store(FAULTED, Release);
    wake();
    // The pump runs the round: announce, await the global grant, then
    // unprotect the page and flip us to GRANTED.
    while CELL.state.load(Acquire) != GRANTED {
        std::hint::spin_loop();
    }
    // Re-execute the store under single-step so SIGTRAP fires right
    // after it retires.
    unsafe { set_trap_flag(ctx, true) };
}

/// The single-stepped store has retired; hand the dirty page to the
/// pump and hold the application until the round is flushed.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
extern "C" fn on_trap(_sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    use trap::*;

    unsafe { set_trap_flag(ctx, false) };
    if CELL.state.load(Acquire) != GRANTED {
        // Stray SIGTRAP (debugger?); nothing of ours is in flight.
        return;
    }
    CELL.state.store(CAPTURED, Release);
    wake();
    while CELL.state.load(Acquire) != FLUSHED {
        std::hint::spin_loop();
    }
    CELL.state.store(IDLE, Release);
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn set_trap_flag(ctx: *mut libc::c_void, enable: bool) {
    const TF: i64 = 0x100;
    let uctx = &mut *(ctx as *mut libc::ucontext_t);
    let efl = &mut uctx.uc_mcontext.gregs[libc::REG_EFL as usize];
    if enable {
        *efl |= TF;
    } else {
        *efl &= !TF;
    }
}
