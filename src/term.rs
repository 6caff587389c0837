//! Controller-side terminal handling: raw mode and winsize queries.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::sys::termios::{self, SetArg, Termios};

use crate::error::{BrokerError, Result};

/// Puts `fd` (normally stdin) into raw mode, returning the original
/// settings so the caller can restore them on exit.
pub fn enter_raw_mode(fd: RawFd) -> Result<Termios> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let original = termios::tcgetattr(borrowed).map_err(|e| BrokerError::Io(std::io::Error::from(e)))?;

    let mut raw = original.clone();
    termios::cfmakeraw(&mut raw);
    termios::tcsetattr(borrowed, SetArg::TCSANOW, &raw).map_err(|e| BrokerError::Io(std::io::Error::from(e)))?;

    Ok(original)
}

pub fn restore_mode(fd: RawFd, original: &Termios) -> Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    termios::tcsetattr(borrowed, SetArg::TCSANOW, original).map_err(|e| BrokerError::Io(std::io::Error::from(e)))
}

pub fn current_size(fd: RawFd) -> Option<(u16, u16)> {
    let mut size: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut size) };
    if rc == 0 {
        Some((size.ws_row, size.ws_col))
    } else {
        None
    }
}

pub fn stdin_fd() -> RawFd {
    std::io::stdin().as_raw_fd()
}

pub fn stdout_fd() -> RawFd {
    std::io::stdout().as_raw_fd()
}
