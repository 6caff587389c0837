//! PTY/shell spawn (target side): opens a pty pair, forks, execs the
//! configured shell in the slave, and hands the broker the master fd and
//! child session id.

use std::ffi::CString;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

use nix::libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::unistd::{dup2, execvp, fork, setsid, ForkResult, Pid};

use crate::error::{BrokerError, Result};

pub struct Spawned {
    pub master_fd: RawFd,
    pub child: Pid,
}

/// Spawns `shell` in a fresh pty, applying `env` and `winsize` before exec.
/// The rc-file is a controller-side concern: the controller streams its
/// contents as simulated keystrokes once the session is interactive (see
/// `endpoint::send_rc_file`), so the target never reads or references it.
pub fn spawn(shell: &str, env: &[(String, String)], winsize: Option<Winsize>) -> Result<Spawned> {
    let OpenptyResult { master, slave } = openpty(winsize.as_ref(), None)
        .map_err(|e| BrokerError::Io(std::io::Error::from(e)))?;

    let master_fd = master.as_raw_fd();
    let slave_fd = slave.as_raw_fd();

    match unsafe { fork() }.map_err(|e| BrokerError::Io(std::io::Error::from(e)))? {
        ForkResult::Child => {
            drop(master);
            setsid().ok();
            unsafe {
                libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0);
            }

            dup2(slave_fd, STDIN_FILENO).ok();
            dup2(slave_fd, STDOUT_FILENO).ok();
            dup2(slave_fd, STDERR_FILENO).ok();
            if slave_fd > STDERR_FILENO {
                drop(slave);
            } else {
                let _ = slave.into_raw_fd();
            }

            for (k, v) in env {
                std::env::set_var(k, v);
            }

            let shell_cstr = CString::new(shell).unwrap_or_else(|_| CString::new("/bin/sh").unwrap());
            let args = [shell_cstr.clone()];
            let _ = execvp(&shell_cstr, &args);
            // execvp only returns on failure.
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            drop(slave);
            crate::signals::set_child_pid(child.as_raw());
            Ok(Spawned { master_fd, child })
        }
    }
}

/// Applies a new winsize to the pty master, in response to an inbound
/// `WINRESIZE` frame. Caller is responsible for signaling the foreground
/// process group afterward (see `signals::winch_process_group`).
pub fn apply_winsize(master_fd: RawFd, rows: u16, cols: u16) -> Result<()> {
    let size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(master_fd, libc::TIOCSWINSZ, &size) };
    if rc == 0 {
        Ok(())
    } else {
        Err(BrokerError::Io(std::io::Error::last_os_error()))
    }
}

pub fn current_winsize(fd: RawFd) -> Option<libc::winsize> {
    let mut size: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut size) };
    if rc == 0 {
        Some(size)
    } else {
        None
    }
}

pub fn reap(child: Pid) -> i32 {
    use nix::sys::wait::{waitpid, WaitStatus};
    match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
        _ => 1,
    }
}
