//! Signal integration: handlers do nothing but set sticky flags, sampled by
//! the broker between readiness waits.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{self, SigHandler, Signal};

static WINCH_FOUND: AtomicBool = AtomicBool::new(false);
static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static CHILD_PID: AtomicI32 = AtomicI32::new(0);
static ALARM_FOUND: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigwinch(_sig: i32) {
    WINCH_FOUND.store(true, Ordering::Relaxed);
}

extern "C" fn handle_sigchld(_sig: i32) {
    CHILD_EXITED.store(true, Ordering::Relaxed);
}

extern "C" fn handle_sigalrm(_sig: i32) {
    ALARM_FOUND.store(true, Ordering::Relaxed);
}

/// Installs the broker's signal handlers. Safe to call once per process;
/// the target installs all three, the controller only winch/chld.
pub fn install(install_alrm: bool) -> crate::error::Result<()> {
    unsafe {
        signal::signal(Signal::SIGWINCH, SigHandler::Handler(handle_sigwinch)).map_err(std::io::Error::from)?;
        signal::signal(Signal::SIGCHLD, SigHandler::Handler(handle_sigchld)).map_err(std::io::Error::from)?;
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn).map_err(std::io::Error::from)?;
        if install_alrm {
            signal::signal(Signal::SIGALRM, SigHandler::Handler(handle_sigalrm)).map_err(std::io::Error::from)?;
        }
    }
    Ok(())
}

/// Arms a one-shot startup deadline: if `connect`/`accept` hasn't completed
/// by the time it fires, the process self-terminates (the source's
/// "seppuku" behavior) rather than hang forever.
pub fn arm_startup_alarm(secs: u64) {
    ALARM_FOUND.store(false, Ordering::Relaxed);
    unsafe {
        libc::alarm(secs as libc::c_uint);
    }
}

pub fn disarm_startup_alarm() {
    unsafe {
        libc::alarm(0);
    }
}

/// Consumes the pending-winch flag, returning whether it was set.
pub fn take_winch() -> bool {
    WINCH_FOUND.swap(false, Ordering::Relaxed)
}

pub fn child_exited() -> bool {
    CHILD_EXITED.load(Ordering::Relaxed)
}

pub fn alarm_fired() -> bool {
    ALARM_FOUND.load(Ordering::Relaxed)
}

pub fn set_child_pid(pid: i32) {
    CHILD_PID.store(pid, Ordering::Relaxed);
}

pub fn child_pid() -> i32 {
    CHILD_PID.load(Ordering::Relaxed)
}

/// Delivers SIGWINCH to the child's process group (target side, after
/// applying an inbound `WINRESIZE` frame to the PTY master).
pub fn winch_process_group(pgid: i32) {
    unsafe {
        libc::kill(-pgid, libc::SIGWINCH);
    }
}
