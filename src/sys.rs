// This module contains the interface to unsafe system calls.
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, RawFd};

fn result(val: libc::c_int) -> io::Result<libc::c_int> {
    match val {
        -1 => Err(io::Error::last_os_error()),
        v => Ok(v),
    }
}

// Create a new epoll instance. The returned fd is close-on-exec.
pub fn epoll_create() -> io::Result<RawFd> {
    // SAFETY: very basic linux system call, no pointers.
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    result(fd)
}

// Add, modify or delete interest in `fd` on the epoll instance `epfd`.
//
// `udata` is stashed in the kernel as `epoll_event.u64` and handed back verbatim
// by `epoll_wait`; the reactor uses it to carry a raw pointer to the FdSlot.
pub fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32, udata: u64) -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: udata };
    // SAFETY: `ev` is a valid, fully-initialized epoll_event; epfd/fd are caller-checked.
    let ret = unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev as *mut libc::epoll_event) };
    result(ret).map(|_| ())
}

// Block for up to `timeout_ms` (-1 = forever, 0 = don't block) waiting for events,
// writing up to `events.len()` of them into `events`. Returns the number filled in.
pub fn epoll_wait(epfd: RawFd, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
    // SAFETY: `events` is a valid buffer of the given length; epfd is caller-checked.
    let ret = unsafe {
        libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as libc::c_int, timeout_ms)
    };
    match ret {
        -1 if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted => Ok(0),
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}

fn non_blocking(fd: RawFd) {
    // SAFETY: very basic linux system calls, no pointers.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

// Note that we change this pipe to non-blocking on the read side,
// but leave it as _blocking_ on the write side!
pub fn pipe() -> io::Result<(File, File)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: very basic linux system call.
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    non_blocking(fds[0]);
    // SAFETY: constructing a File from fds we just opened.
    let files = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    result(res).map(|_| files)
}

// Close a raw fd directly, bypassing `File`'s destructor. Used by `on_close` callers
// that already own the fd outside of a `File`/`TcpStream` wrapper.
pub fn close(fd: RawFd) -> io::Result<()> {
    // SAFETY: caller guarantees `fd` is open and not used again afterwards.
    result(unsafe { libc::close(fd) }).map(|_| ())
}
