use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use corowait::{co_poll, on_close, pending_waiters, run, spawn, PollFd};

// Three coroutines sharing one thread-local reactor:
//   - "ponger" co_polls on a socket pair and prints what "pinger" wrote to it.
//   - "sleeper" co_polls on a socket nobody ever writes to and times out.
//   - "abandoned" starts waiting, then has its fd closed out from under it by
//     "closer" before it ever gets data, and falls through to its own timeout.
// Run with RUST_LOG=trace to see the reactor's register/dispatch decisions.
fn main() {
    env_logger::init();

    let (mut ping_a, mut ping_b) = UnixStream::pair().unwrap();
    ping_b.set_nonblocking(true).unwrap();

    let (sleep_r, _sleep_w) = UnixStream::pair().unwrap();
    sleep_r.set_nonblocking(true).unwrap();

    let (abandoned_r, _abandoned_w) = UnixStream::pair().unwrap();
    abandoned_r.set_nonblocking(true).unwrap();
    let abandoned_fd = abandoned_r.as_raw_fd();

    let pinger = spawn(move || {
        ping_a.write_all(b"ping").unwrap();
    });

    let ponger = spawn(move || {
        let fd = ping_b.as_raw_fd();
        let mut fds = [PollFd::new(fd, libc::POLLIN as u16)];
        let n = co_poll(&mut fds, -1);
        println!("ponger: co_poll returned {n}, revents {:#b}", fds[0].revents);
        let mut buf = [0u8; 4];
        let len = ping_b.read(&mut buf).unwrap();
        println!("ponger: read {:?}", std::str::from_utf8(&buf[..len]));
    });

    let sleeper = spawn(move || {
        let fd = sleep_r.as_raw_fd();
        let mut fds = [PollFd::new(fd, libc::POLLIN as u16)];
        let n = co_poll(&mut fds, 200);
        println!("sleeper: co_poll returned {n} (expected 0, a timeout)");
    });

    let abandoned = spawn(move || {
        let mut fds = [PollFd::new(abandoned_fd, libc::POLLIN as u16)];
        let n = co_poll(&mut fds, 200);
        println!("abandoned: co_poll returned {n} (expected 0, its fd was closed out from under it)");
    });
    spawn(move || {
        on_close(abandoned_fd);
        println!("closer: closed fd {abandoned_fd} while `abandoned` was still waiting on it");
    });

    println!("pending waiters before running: {}", pending_waiters());

    run(pinger);
    run(ponger);
    run(sleeper);
    run(abandoned);

    println!("pending waiters after running: {}", pending_waiters());
}
