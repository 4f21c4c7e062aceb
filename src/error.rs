//! The error taxonomy of SPEC_FULL.md §7: a fatal path for programmer errors, and a
//! logging path for kernel syscall failures that the reactor treats as survivable.

use std::os::fd::RawFd;

/// Abort the process after logging a programmer error (negative fd, double-wait on
/// an fd, a corrupt slot index). Mirrors the original system's `LOG(FATAL); abort()`.
pub fn fatal(msg: impl std::fmt::Display) -> ! {
    log::error!("{msg}");
    panic!("corowait: {msg}");
}

/// Log a failed `epoll_ctl`/`epoll_wait` call without aborting. The reactor keeps
/// running with whatever kernel state it already had; the operation is not retried.
pub fn log_kernel_error(syscall: &str, fd: Option<RawFd>, mask: Option<u32>, err: &std::io::Error) {
    match (fd, mask) {
        (Some(fd), Some(mask)) => log::error!("{syscall} failed for fd {fd} (mask {mask:#b}): {err}"),
        (Some(fd), None) => log::error!("{syscall} failed for fd {fd}: {err}"),
        _ => log::error!("{syscall} failed: {err}"),
    }
}
